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

use crate::{common::system_page_size, error::ShmBufError};
use core::ptr::NonNull;
use eyre::{ensure, eyre, Result, WrapErr};
use nix::sys::memfd::{memfd_create, MFdFlags};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat::fstat;
use nix::unistd::ftruncate;
use std::num::NonZero;
use std::os::fd::OwnedFd;

/// A memfd-backed shared segment mapped once into this process.
///
/// Each process maps the segment at its own base address, so nothing stored
/// inside it may depend on `as_ptr`.
pub(crate) struct Memory {
    ptr: NonNull<u8>,
    size: usize,
    fd: OwnedFd,
}

impl Memory {
    pub(crate) fn create(size: usize) -> Result<Self> {
        let page_size = system_page_size();
        ensure!(
            size != 0 && size % page_size == 0,
            ShmBufError::SizeNotAligned(page_size)
        );

        let fd = memfd_create(c"ringbuf-backend", MFdFlags::MFD_CLOEXEC)
            .wrap_err("failed to create memory file descriptor")?;

        ftruncate(&fd, size as i64).wrap_err("failed to set memory file size")?;

        Self::map(fd, size)
    }

    pub(crate) fn from_fd(fd: OwnedFd) -> Result<Self> {
        let stat = fstat(&fd).wrap_err("failed to stat memory file descriptor")?;
        let size = usize::try_from(stat.st_size).wrap_err("invalid memory file size")?;
        Self::map(fd, size)
    }

    fn map(fd: OwnedFd, size: usize) -> Result<Self> {
        let len = NonZero::new(size).ok_or_else(|| eyre!("cannot map an empty segment"))?;

        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
            .wrap_err("failed to map shared memory segment")?
        };

        Ok(Memory {
            ptr: ptr.cast(),
            size,
            fd,
        })
    }

    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn fd(&self) -> &OwnedFd {
        &self.fd
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
    }
}

unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}
