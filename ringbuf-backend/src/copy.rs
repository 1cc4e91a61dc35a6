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

/// Moves record bytes into backend pages.
///
/// The backend hands over one page-bounded chunk at a time, so an
/// implementation never sees a destination that spans two pages.
pub trait PageCopy: Send + Sync {
    fn copy(&self, dst: &mut [u8], src: &[u8]);

    fn fill(&self, dst: &mut [u8], value: u8) {
        dst.fill(value);
    }
}

/// Plain `memcpy`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Memcpy;

impl PageCopy for Memcpy {
    #[inline(always)]
    fn copy(&self, dst: &mut [u8], src: &[u8]) {
        dst.copy_from_slice(src);
    }
}
