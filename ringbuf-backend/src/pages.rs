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

//! Backend page directory entries.

use crate::{
    error::ShmBufError,
    shm::{ShmHandle, ShmRef, ShmType},
    sync::{AtomicU64, Ordering},
};

/// Location of one backing page.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct PageRef {
    pub(crate) data: ShmRef<u8>,
}

unsafe impl ShmType for PageRef {}

/// Bookkeeping for one physical subbuffer slot.
#[repr(C)]
pub(crate) struct BackendPages {
    /// Records committed by the writer since the slot was last delivered.
    pub(crate) records_commit: AtomicU64,
    /// Records delivered but not yet consumed by the reader.
    pub(crate) records_unread: AtomicU64,
    pub(crate) data_size: AtomicU64,
    pages: ShmRef<PageRef>,
    num_pages: u64,
}

unsafe impl ShmType for BackendPages {}

impl BackendPages {
    pub(crate) fn new(pages: ShmRef<PageRef>, num_pages: usize) -> Self {
        BackendPages {
            records_commit: AtomicU64::new(0),
            records_unread: AtomicU64::new(0),
            data_size: AtomicU64::new(0),
            pages,
            num_pages: num_pages as u64,
        }
    }

    pub(crate) fn records_unread(&self) -> u64 {
        self.records_unread.load(Ordering::Relaxed)
    }

    pub(crate) fn records_commit(&self) -> u64 {
        self.records_commit.load(Ordering::Relaxed)
    }

    pub(crate) fn data_size(&self) -> u64 {
        self.data_size.load(Ordering::Relaxed)
    }

    /// Start of the `page`-th page of this slot.
    #[inline(always)]
    pub(crate) fn page(&self, handle: &ShmHandle, page: usize) -> Result<ShmRef<u8>, ShmBufError> {
        if page as u64 >= self.num_pages {
            return Err(ShmBufError::PageOutOfRange {
                page,
                num_pages: self.num_pages as usize,
            });
        }
        Ok(handle.resolve_index(self.pages, page)?.data)
    }

    pub(crate) fn reset(&self) {
        self.records_commit.store(0, Ordering::Relaxed);
        self.records_unread.store(0, Ordering::Relaxed);
        self.data_size.store(0, Ordering::Relaxed);
    }
}
