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

//! Subbuffer identifiers.
//!
//! An identifier names the physical slot that currently backs a logical
//! subbuffer, packed into a single 64-bit word so that handing a subbuffer
//! between writer and reader is one atomic operation:
//!
//! ```text
//!  63                32 31  30                  0
//! ┌────────────────────┬─────┬─────────────────────┐
//! │     generation     │noref│     slot index      │
//! └────────────────────┴─────┴─────────────────────┘
//! ```
//!
//! `noref` is set while the writer holds no reference to the slot, i.e. once
//! the subbuffer has been delivered to (or taken by) the reader. The
//! generation records which wrap of the buffer was delivered, so the reader
//! can tell a stale delivery from the one it expects.

use crate::{
    shm::ShmType,
    sync::{AtomicU64, Ordering},
};
use std::fmt;

const NOREF_SHIFT: u32 = 31;
const NOREF_FLAG: u64 = 1 << NOREF_SHIFT;
const INDEX_MASK: u64 = NOREF_FLAG - 1;
const GENERATION_SHIFT: u32 = 32;
const GENERATION_MASK: u64 = !((1 << GENERATION_SHIFT) - 1);

/// Number of distinct slot indices an identifier can carry.
pub const MAX_SLOTS: usize = 1 << NOREF_SHIFT;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SubbufId(u64);

impl SubbufId {
    /// Bits of `index` above the index field are discarded; callers keep
    /// indices below [`MAX_SLOTS`].
    #[inline(always)]
    pub const fn new(index: usize, noref: bool) -> Self {
        let id = index as u64 & INDEX_MASK;
        if noref {
            SubbufId(id | NOREF_FLAG)
        } else {
            SubbufId(id)
        }
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        SubbufId(raw)
    }

    #[inline(always)]
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    #[inline(always)]
    pub const fn is_noref(self) -> bool {
        self.0 & NOREF_FLAG != 0
    }

    #[inline(always)]
    pub const fn with_noref(self, noref: bool) -> Self {
        if noref {
            SubbufId(self.0 | NOREF_FLAG)
        } else {
            SubbufId(self.0 & !NOREF_FLAG)
        }
    }

    #[inline(always)]
    pub const fn generation(self) -> u32 {
        (self.0 >> GENERATION_SHIFT) as u32
    }

    /// Stamps the low 32 bits of `generation`.
    #[inline(always)]
    pub const fn with_generation(self, generation: u64) -> Self {
        let generation = (generation as u32 as u64) << GENERATION_SHIFT;
        SubbufId((self.0 & !GENERATION_MASK) | generation)
    }

    #[inline(always)]
    pub const fn matches_generation(self, generation: u64) -> bool {
        self.generation() == generation as u32
    }
}

impl fmt::Debug for SubbufId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubbufId")
            .field("index", &self.index())
            .field("noref", &self.is_noref())
            .field("generation", &self.generation())
            .finish()
    }
}

/// An identifier cell living in the shared segment.
#[repr(transparent)]
pub struct AtomicSubbufId(AtomicU64);

unsafe impl ShmType for AtomicSubbufId {}

impl AtomicSubbufId {
    pub fn new(id: SubbufId) -> Self {
        AtomicSubbufId(AtomicU64::new(id.0))
    }

    #[inline(always)]
    pub fn load(&self, order: Ordering) -> SubbufId {
        SubbufId(self.0.load(order))
    }

    #[inline(always)]
    pub fn store(&self, id: SubbufId, order: Ordering) {
        self.0.store(id.0, order)
    }

    #[inline(always)]
    pub fn compare_exchange(
        &self,
        current: SubbufId,
        new: SubbufId,
        success: Ordering,
        failure: Ordering,
    ) -> Result<SubbufId, SubbufId> {
        self.0
            .compare_exchange(current.0, new.0, success, failure)
            .map(SubbufId)
            .map_err(SubbufId)
    }
}
