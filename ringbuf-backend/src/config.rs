// Copyright (C) 2025 Category Labs, Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use crate::{common::system_page_size, error::ShmBufError, id::MAX_SLOTS};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What the writer does when it catches up with unread data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Flight recorder: the oldest subbuffers are overwritten. One extra slot
    /// is reserved for the reader.
    #[serde(alias = "flight-recorder")]
    Overwrite,
    /// New records are dropped while the buffer is full.
    Discard,
}

impl Mode {
    pub(crate) fn to_raw(self) -> u32 {
        match self {
            Mode::Overwrite => 0,
            Mode::Discard => 1,
        }
    }

    pub(crate) fn from_raw(raw: u32) -> Result<Self, ShmBufError> {
        match raw {
            0 => Ok(Mode::Overwrite),
            1 => Ok(Mode::Discard),
            other => Err(ShmBufError::UnknownMode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_subbuf_size")]
    pub subbuf_size: usize,
    #[serde(default = "default_num_subbuf")]
    pub num_subbuf: usize,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Size of the pages backing each subbuffer. Defaults to the system page size.
    #[serde(default)]
    pub page_size: Option<usize>,
}

fn default_subbuf_size() -> usize {
    16 << 10
}

fn default_num_subbuf() -> usize {
    4
}

fn default_mode() -> Mode {
    Mode::Overwrite
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            subbuf_size: default_subbuf_size(),
            num_subbuf: default_num_subbuf(),
            mode: default_mode(),
            page_size: None,
        }
    }
}

impl ChannelConfig {
    pub fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> eyre::Result<Self> {
        let config: ChannelConfig = toml::from_str(content)?;
        Ok(config)
    }
}

/// Smallest supported backing page: one cache line.
pub const MIN_PAGE_SIZE: usize = 64;

/// Validated, immutable geometry of one channel.
///
/// Every process derives the same value from the segment header and keeps a
/// local copy, so the hot path never reads the header for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBackend {
    buf_size: usize,
    buf_size_order: u32,
    subbuf_size: usize,
    subbuf_size_order: u32,
    num_subbuf: usize,
    num_slots: usize,
    page_size: usize,
    page_size_order: u32,
    mode: Mode,
}

impl ChannelBackend {
    pub fn new(
        subbuf_size: usize,
        num_subbuf: usize,
        mode: Mode,
        page_size: usize,
    ) -> Result<Self, ShmBufError> {
        if !page_size.is_power_of_two() {
            return Err(ShmBufError::PageSizeNotPowerOfTwo(page_size));
        }
        if page_size < MIN_PAGE_SIZE {
            return Err(ShmBufError::PageSizeTooSmall {
                page_size,
                min: MIN_PAGE_SIZE,
            });
        }
        if !subbuf_size.is_power_of_two() {
            return Err(ShmBufError::SubbufSizeNotPowerOfTwo(subbuf_size));
        }
        if subbuf_size < page_size {
            return Err(ShmBufError::SubbufSmallerThanPage {
                subbuf_size,
                page_size,
            });
        }
        if !num_subbuf.is_power_of_two() {
            return Err(ShmBufError::NumSubbufNotPowerOfTwo(num_subbuf));
        }
        let num_slots = match mode {
            Mode::Overwrite => num_subbuf + 1,
            Mode::Discard => num_subbuf,
        };
        if num_slots > MAX_SLOTS {
            return Err(ShmBufError::TooManySubbuffers(num_slots));
        }
        let buf_size = subbuf_size
            .checked_mul(num_subbuf)
            .filter(|size| size.checked_mul(2).is_some())
            .ok_or(ShmBufError::BufferTooLarge)?;

        Ok(ChannelBackend {
            buf_size,
            buf_size_order: buf_size.trailing_zeros(),
            subbuf_size,
            subbuf_size_order: subbuf_size.trailing_zeros(),
            num_subbuf,
            num_slots,
            page_size,
            page_size_order: page_size.trailing_zeros(),
            mode,
        })
    }

    pub fn from_config(config: &ChannelConfig) -> Result<Self, ShmBufError> {
        let page_size = config.page_size.unwrap_or_else(system_page_size);
        Self::new(config.subbuf_size, config.num_subbuf, config.mode, page_size)
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn subbuf_size(&self) -> usize {
        self.subbuf_size
    }

    pub fn subbuf_size_order(&self) -> u32 {
        self.subbuf_size_order
    }

    pub fn num_subbuf(&self) -> usize {
        self.num_subbuf
    }

    /// Physical slots, including the reader's spare in overwrite mode.
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_size_order(&self) -> u32 {
        self.page_size_order
    }

    pub fn pages_per_subbuf(&self) -> usize {
        self.subbuf_size >> self.page_size_order
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Offset within the buffer's address space.
    #[inline(always)]
    pub fn wrap(&self, offset: u64) -> usize {
        (offset & (self.buf_size as u64 - 1)) as usize
    }

    /// Logical subbuffer ordinal holding `offset`.
    #[inline(always)]
    pub fn subbuf_index(&self, offset: u64) -> usize {
        self.wrap(offset) >> self.subbuf_size_order
    }

    /// Offset of `offset` within its subbuffer.
    #[inline(always)]
    pub fn subbuf_offset(&self, offset: u64) -> usize {
        (offset & (self.subbuf_size as u64 - 1)) as usize
    }

    /// How many times the buffer wrapped before reaching `offset`.
    #[inline(always)]
    pub fn buf_trunc_val(&self, offset: u64) -> u64 {
        offset >> self.buf_size_order
    }
}
