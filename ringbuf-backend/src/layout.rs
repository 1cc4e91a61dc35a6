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

//! Layout of the shared segment.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐ 0
//! │ ChannelHeader (geometry, reader id, counters) │
//! ├───────────────────────────────────────────────┤ wsb
//! │ writer ids, one per logical subbuffer         │
//! ├───────────────────────────────────────────────┤ array
//! │ BackendPages, one per physical slot           │
//! ├───────────────────────────────────────────────┤ page_refs
//! │ PageRef, pages_per_subbuf per slot            │
//! ├───────────────────────────────────────────────┤ data (page aligned)
//! │ data pages, interleaved across slots          │
//! └───────────────────────────────────────────────┘ segment_size
//! ```
//!
//! Page `j` of slot `s` is data page `j * num_slots + s`: the pages of one
//! slot are never adjacent, and accesses spanning pages resolve each page.

use crate::{
    common::{align_up, system_page_size},
    config::{ChannelBackend, Mode},
    error::ShmBufError,
    id::{AtomicSubbufId, SubbufId},
    pages::{BackendPages, PageRef},
    shm::{ShmHandle, ShmRef, ShmType},
    sync::{AtomicU64, Ordering},
};
use crossbeam::utils::CachePadded;
use std::mem::{align_of, size_of};

pub(crate) const SEGMENT_MAGIC: u64 = u64::from_le_bytes(*b"RBBACKND");
pub(crate) const LAYOUT_VERSION: u32 = 1;

#[repr(C)]
pub(crate) struct ChannelHeader {
    pub(crate) magic: u64,
    pub(crate) version: u32,
    pub(crate) mode: u32,
    pub(crate) subbuf_size: u64,
    pub(crate) num_subbuf: u64,
    pub(crate) page_size: u64,
    pub(crate) segment_size: u64,
    pub(crate) wsb: ShmRef<AtomicSubbufId>,
    pub(crate) array: ShmRef<BackendPages>,
    /// Only ever written by the reader.
    pub(crate) rsb: CachePadded<AtomicSubbufId>,
    pub(crate) records_read: AtomicU64,
    pub(crate) violations: AtomicU64,
}

unsafe impl ShmType for ChannelHeader {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentLayout {
    pub(crate) wsb: ShmRef<AtomicSubbufId>,
    pub(crate) array: ShmRef<BackendPages>,
    pub(crate) page_refs: ShmRef<PageRef>,
    pub(crate) data: ShmRef<u8>,
    pub(crate) segment_size: usize,
}

impl SegmentLayout {
    pub(crate) const HEADER: ShmRef<ChannelHeader> = ShmRef::new(0);

    /// Places every region for `chan`.
    ///
    /// Geometry read from a peer's header is untrusted; a layout that does not
    /// fit the address space fails with `BufferTooLarge`.
    pub(crate) fn compute(chan: &ChannelBackend) -> Result<Self, ShmBufError> {
        Self::place(chan).ok_or(ShmBufError::BufferTooLarge)
    }

    fn place(chan: &ChannelBackend) -> Option<Self> {
        let wsb = align_up(size_of::<ChannelHeader>(), align_of::<AtomicSubbufId>())?;
        let array = region(
            wsb,
            chan.num_subbuf(),
            size_of::<AtomicSubbufId>(),
            align_of::<BackendPages>(),
        )?;
        let page_refs = region(
            array,
            chan.num_slots(),
            size_of::<BackendPages>(),
            align_of::<PageRef>(),
        )?;
        let data = region(
            page_refs,
            chan.num_slots().checked_mul(chan.pages_per_subbuf())?,
            size_of::<PageRef>(),
            chan.page_size(),
        )?;
        let segment_size = region(
            data,
            chan.num_slots(),
            chan.subbuf_size(),
            system_page_size(),
        )?;

        Some(SegmentLayout {
            wsb: ShmRef::new(wsb as u64),
            array: ShmRef::new(array as u64),
            page_refs: ShmRef::new(page_refs as u64),
            data: ShmRef::new(data as u64),
            segment_size,
        })
    }

    /// Offset of page `page` of slot `slot`.
    pub(crate) fn data_page(&self, chan: &ChannelBackend, slot: usize, page: usize) -> ShmRef<u8> {
        let index = page * chan.num_slots() + slot;
        ShmRef::new(self.data.offset() + (index * chan.page_size()) as u64)
    }

    /// Writes the header and directory of a fresh segment.
    ///
    /// # Safety
    ///
    /// `handle` must map a segment of at least `segment_size` bytes that no
    /// one else accesses yet.
    pub(crate) unsafe fn initialize(
        &self,
        handle: &ShmHandle,
        chan: &ChannelBackend,
    ) -> Result<(), ShmBufError> {
        let (writer_ids, reader_id) = initial_ids(chan);

        handle.init(
            Self::HEADER,
            ChannelHeader {
                magic: SEGMENT_MAGIC,
                version: LAYOUT_VERSION,
                mode: chan.mode().to_raw(),
                subbuf_size: chan.subbuf_size() as u64,
                num_subbuf: chan.num_subbuf() as u64,
                page_size: chan.page_size() as u64,
                segment_size: self.segment_size as u64,
                wsb: self.wsb,
                array: self.array,
                rsb: CachePadded::new(AtomicSubbufId::new(reader_id)),
                records_read: AtomicU64::new(0),
                violations: AtomicU64::new(0),
            },
        )?;

        for (sbidx, id) in writer_ids.enumerate() {
            handle.init(self.wsb.add(sbidx), AtomicSubbufId::new(id))?;
        }

        let pages_per_subbuf = chan.pages_per_subbuf();
        for slot in 0..chan.num_slots() {
            let pages = self.page_refs.add(slot * pages_per_subbuf);
            handle.init(self.array.add(slot), BackendPages::new(pages, pages_per_subbuf))?;
            for page in 0..pages_per_subbuf {
                let data = self.data_page(chan, slot, page);
                handle.init(pages.add(page), PageRef { data })?;
            }
        }

        Ok(())
    }

    /// Puts ids and counters of a live segment back to their initial state.
    pub(crate) fn reset(
        &self,
        handle: &ShmHandle,
        chan: &ChannelBackend,
    ) -> Result<(), ShmBufError> {
        let header = handle.resolve(Self::HEADER)?;
        let (writer_ids, reader_id) = initial_ids(chan);

        for (sbidx, id) in writer_ids.enumerate() {
            handle.resolve_index(self.wsb, sbidx)?.store(id, Ordering::Release);
        }
        header.rsb.store(reader_id, Ordering::Release);
        header.records_read.store(0, Ordering::Relaxed);

        for slot in 0..chan.num_slots() {
            handle.resolve_index(self.array, slot)?.reset();
        }
        Ok(())
    }

    /// Checks that a header written by another process matches this layout.
    pub(crate) fn validate(
        &self,
        header: &ChannelHeader,
        mapped: usize,
    ) -> Result<(), ShmBufError> {
        if header.segment_size != self.segment_size as u64 || self.segment_size > mapped {
            return Err(ShmBufError::CorruptHeader("segment size"));
        }
        if header.wsb != self.wsb {
            return Err(ShmBufError::CorruptHeader("writer id table offset"));
        }
        if header.array != self.array {
            return Err(ShmBufError::CorruptHeader("slot array offset"));
        }
        Ok(())
    }
}

/// Writer ids claim slots `0..num_subbuf`. In overwrite mode the reader owns
/// the extra slot, flagged so the writer table can take it in exchange.
fn initial_ids(chan: &ChannelBackend) -> (impl Iterator<Item = SubbufId>, SubbufId) {
    let writer_ids = (0..chan.num_subbuf()).map(|sbidx| SubbufId::new(sbidx, false));
    let reader_id = match chan.mode() {
        Mode::Overwrite => SubbufId::new(chan.num_subbuf(), true),
        Mode::Discard => SubbufId::new(0, false),
    };
    (writer_ids, reader_id)
}

/// End of an array of `count` elements of `size` bytes at `start`, aligned
/// up to `align`.
fn region(start: usize, count: usize, size: usize, align: usize) -> Option<usize> {
    align_up(start.checked_add(count.checked_mul(size)?)?, align)
}
