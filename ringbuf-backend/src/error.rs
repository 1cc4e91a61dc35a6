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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShmBufError {
    #[error("size must be a non-zero multiple of page size ({0} bytes)")]
    SizeNotAligned(usize),

    #[error("subbuffer size must be a power of two (got {0} bytes)")]
    SubbufSizeNotPowerOfTwo(usize),

    #[error("number of subbuffers must be a power of two (got {0})")]
    NumSubbufNotPowerOfTwo(usize),

    #[error("page size must be a power of two (got {0} bytes)")]
    PageSizeNotPowerOfTwo(usize),

    #[error("page size of {page_size} bytes is below the {min} byte minimum")]
    PageSizeTooSmall { page_size: usize, min: usize },

    #[error("subbuffer size ({subbuf_size} bytes) is smaller than a page ({page_size} bytes)")]
    SubbufSmallerThanPage { subbuf_size: usize, page_size: usize },

    #[error("{0} physical slots exceed the subbuffer identifier index range")]
    TooManySubbuffers(usize),

    #[error("buffer size overflows the logical address space")]
    BufferTooLarge,

    #[error("unknown buffer mode {0}")]
    UnknownMode(u32),

    #[error("shared memory segment setup failed: {0}")]
    Segment(String),

    #[error("not a ring buffer segment (magic {0:#018x})")]
    BadMagic(u64),

    #[error("unsupported segment layout version {0}")]
    LayoutVersion(u32),

    #[error("segment header disagrees with its geometry: {0}")]
    CorruptHeader(&'static str),

    #[error(
        "shared reference out of range: {len} bytes at offset {offset} in a {size} byte segment"
    )]
    OutOfRange { offset: u64, len: usize, size: usize },

    #[error("shared reference at offset {offset} is not aligned to {align} bytes")]
    Misaligned { offset: u64, align: usize },

    #[error("subbuffer ordinal {sbidx} out of range ({num_subbuf} subbuffers)")]
    SubbufOutOfRange { sbidx: usize, num_subbuf: usize },

    #[error("physical slot {slot} out of range ({num_slots} slots)")]
    SlotOutOfRange { slot: usize, num_slots: usize },

    #[error("page {page} out of range ({num_pages} pages per subbuffer)")]
    PageOutOfRange { page: usize, num_pages: usize },

    #[error("subbuffer {sbidx} (slot {slot}) is not referenced by the writer")]
    ReaderOwned { sbidx: usize, slot: usize },

    #[error(
        "{len} bytes at subbuffer offset {offset} cross the subbuffer end ({subbuf_size} bytes)"
    )]
    CrossesSubbuffer {
        offset: usize,
        len: usize,
        subbuf_size: usize,
    },

    #[error("subbuffer {0} delivered twice without being claimed by the writer")]
    AlreadyDelivered(usize),

    #[error("reader slot {0} is still referenced by the writer")]
    ReaderSlotReferenced(usize),

    #[error("record consumed from slot {0} which has no unread records")]
    NoUnreadRecords(usize),

    #[error("string not terminated within {0} bytes")]
    Unterminated(usize),

    #[error("subbuffer exchange raced with the writer, retry")]
    Again,
}

impl ShmBufError {
    /// Whether the error reports a broken buffer contract rather than an expected outcome.
    ///
    /// Violations can only happen when a caller already broke the published
    /// protocol or the segment is corrupt.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            ShmBufError::OutOfRange { .. }
                | ShmBufError::Misaligned { .. }
                | ShmBufError::SubbufOutOfRange { .. }
                | ShmBufError::SlotOutOfRange { .. }
                | ShmBufError::PageOutOfRange { .. }
                | ShmBufError::ReaderOwned { .. }
                | ShmBufError::CrossesSubbuffer { .. }
                | ShmBufError::AlreadyDelivered(_)
                | ShmBufError::ReaderSlotReferenced(_)
                | ShmBufError::NoUnreadRecords(_)
        )
    }
}

impl From<eyre::Report> for ShmBufError {
    fn from(report: eyre::Report) -> Self {
        ShmBufError::Segment(format!("{report:#}"))
    }
}

impl From<std::io::Error> for ShmBufError {
    fn from(err: std::io::Error) -> Self {
        ShmBufError::Segment(err.to_string())
    }
}
