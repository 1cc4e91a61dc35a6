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

//! Offset-based references into the shared segment.
//!
//! The segment is mapped at a different base address in every process, so
//! structures inside it refer to each other with [`ShmRef`] offsets. A
//! [`ShmHandle`] turns an offset into an address of the local mapping, and
//! every access goes through it again rather than keeping the address.

use crate::{error::ShmBufError, memory::Memory, sync::AtomicU64};
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::os::fd::{AsFd, BorrowedFd};
use std::ptr::NonNull;

/// Types that may be placed in the shared segment and viewed through a `&T`.
///
/// # Safety
///
/// Implementors must have a stable `#[repr(C)]` (or transparent) layout,
/// contain no pointers and accept every bit pattern a peer process may
/// leave in the segment.
pub unsafe trait ShmType {}

unsafe impl ShmType for u8 {}
unsafe impl ShmType for u64 {}
unsafe impl ShmType for AtomicU64 {}

/// A typed offset from the start of the shared segment.
#[repr(transparent)]
pub struct ShmRef<T> {
    offset: u64,
    _marker: PhantomData<fn() -> T>,
}

unsafe impl<T> ShmType for ShmRef<T> {}

impl<T> ShmRef<T> {
    pub const fn new(offset: u64) -> Self {
        ShmRef {
            offset,
            _marker: PhantomData,
        }
    }

    pub const fn offset(self) -> u64 {
        self.offset
    }

    /// Reference to the `count`-th element of an array starting here.
    ///
    /// Overflow saturates, which resolves as out of range.
    #[inline(always)]
    pub fn add(self, count: usize) -> Self {
        let delta = (count as u64).saturating_mul(size_of::<T>() as u64);
        ShmRef::new(self.offset.saturating_add(delta))
    }

    pub const fn cast<U>(self) -> ShmRef<U> {
        ShmRef::new(self.offset)
    }
}

impl<T> Clone for ShmRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ShmRef<T> {}

impl<T> PartialEq for ShmRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl<T> Eq for ShmRef<T> {}

impl<T> fmt::Debug for ShmRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShmRef({:#x})", self.offset)
    }
}

/// This process' view of the shared segment.
pub struct ShmHandle {
    memory: Memory,
}

impl ShmHandle {
    pub(crate) fn new(memory: Memory) -> Self {
        ShmHandle { memory }
    }

    pub fn size(&self) -> usize {
        self.memory.size()
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.memory.fd().as_fd()
    }

    #[inline(always)]
    fn check(&self, offset: u64, len: usize, align: usize) -> Result<usize, ShmBufError> {
        let size = self.memory.size();
        let start = usize::try_from(offset)
            .ok()
            .filter(|start| start.checked_add(len).is_some_and(|end| end <= size))
            .ok_or(ShmBufError::OutOfRange { offset, len, size })?;
        if start % align != 0 {
            return Err(ShmBufError::Misaligned { offset, align });
        }
        Ok(start)
    }

    /// Resolves a typed reference to a local reference.
    #[inline]
    pub fn resolve<T: ShmType>(&self, r: ShmRef<T>) -> Result<&T, ShmBufError> {
        let start = self.check(r.offset, size_of::<T>(), align_of::<T>())?;
        Ok(unsafe { &*(self.memory.as_ptr().as_ptr().add(start) as *const T) })
    }

    #[inline]
    pub fn resolve_index<T: ShmType>(&self, r: ShmRef<T>, index: usize) -> Result<&T, ShmBufError> {
        self.resolve(r.add(index))
    }

    /// Resolves `len` raw bytes starting at `r`.
    ///
    /// The pointer is only valid while `self` is alive. Whoever dereferences
    /// it must own the byte range under the buffer protocol.
    #[inline]
    pub fn resolve_bytes(&self, r: ShmRef<u8>, len: usize) -> Result<NonNull<u8>, ShmBufError> {
        let start = self.check(r.offset, len, 1)?;
        Ok(unsafe { self.memory.as_ptr().add(start) })
    }

    /// Writes `value` at `r` without reading or dropping what was there.
    ///
    /// # Safety
    ///
    /// No other thread or process may access `r` concurrently.
    pub(crate) unsafe fn init<T: ShmType>(
        &self,
        r: ShmRef<T>,
        value: T,
    ) -> Result<(), ShmBufError> {
        let start = self.check(r.offset, size_of::<T>(), align_of::<T>())?;
        (self.memory.as_ptr().as_ptr().add(start) as *mut T).write(value);
        Ok(())
    }
}
