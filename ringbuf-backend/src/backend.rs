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

//! Backend access primitives.

use crate::{
    backend_trace,
    common::{likely, unlikely},
    config::{ChannelBackend, ChannelConfig, Mode},
    copy::{Memcpy, PageCopy},
    error::ShmBufError,
    id::{AtomicSubbufId, SubbufId},
    layout::{ChannelHeader, SegmentLayout, LAYOUT_VERSION, SEGMENT_MAGIC},
    memory::Memory,
    pages::BackendPages,
    shm::ShmHandle,
    sync::Ordering,
};
use std::ops::ControlFlow;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use tracing::{debug, error};

/// One buffer of a channel: the shared segment plus this process' view of it.
///
/// Any number of writers may share a `Backend` as long as each writes only
/// the offset ranges the frontend allocated to it. Reader-side operations
/// (`read*`, `update_read_sb_index`, `consume_record`, ...) must only be
/// called by the single reader of the channel.
pub struct Backend<C = Memcpy> {
    handle: ShmHandle,
    chan: ChannelBackend,
    layout: SegmentLayout,
    copy: C,
}

impl Backend<Memcpy> {
    /// Creates and initializes a new shared segment.
    pub fn create(config: &ChannelConfig) -> Result<Self, ShmBufError> {
        let chan = ChannelBackend::from_config(config)?;
        let layout = SegmentLayout::compute(&chan)?;
        let handle = ShmHandle::new(Memory::create(layout.segment_size)?);
        unsafe { layout.initialize(&handle, &chan)? };

        debug!(
            buf_size = chan.buf_size(),
            subbuf_size = chan.subbuf_size(),
            num_subbuf = chan.num_subbuf(),
            num_slots = chan.num_slots(),
            page_size = chan.page_size(),
            mode = ?chan.mode(),
            segment_size = layout.segment_size,
            "created ring buffer backend"
        );

        Ok(Backend {
            handle,
            chan,
            layout,
            copy: Memcpy,
        })
    }

    /// Maps a segment created by [`Backend::create`], typically in another process.
    pub fn open(fd: OwnedFd) -> Result<Self, ShmBufError> {
        let handle = ShmHandle::new(Memory::from_fd(fd)?);
        let header = handle.resolve(SegmentLayout::HEADER)?;
        if header.magic != SEGMENT_MAGIC {
            return Err(ShmBufError::BadMagic(header.magic));
        }
        if header.version != LAYOUT_VERSION {
            return Err(ShmBufError::LayoutVersion(header.version));
        }

        let chan = ChannelBackend::new(
            header.subbuf_size as usize,
            header.num_subbuf as usize,
            Mode::from_raw(header.mode)?,
            header.page_size as usize,
        )?;
        let layout = SegmentLayout::compute(&chan)?;
        layout.validate(header, handle.size())?;

        debug!(
            buf_size = chan.buf_size(),
            num_subbuf = chan.num_subbuf(),
            mode = ?chan.mode(),
            segment_size = layout.segment_size,
            "opened ring buffer backend"
        );

        Ok(Backend {
            handle,
            chan,
            layout,
            copy: Memcpy,
        })
    }
}

impl<C: PageCopy> Backend<C> {
    /// Replaces the strategy used to copy record bytes into pages.
    pub fn with_copy<D: PageCopy>(self, copy: D) -> Backend<D> {
        Backend {
            handle: self.handle,
            chan: self.chan,
            layout: self.layout,
            copy,
        }
    }

    pub fn channel(&self) -> &ChannelBackend {
        &self.chan
    }

    pub fn shm(&self) -> &ShmHandle {
        &self.handle
    }

    /// The segment's file descriptor, to be passed to [`Backend::open`] elsewhere.
    pub fn memory_fd(&self) -> BorrowedFd<'_> {
        self.handle.fd()
    }

    fn header(&self) -> Result<&ChannelHeader, ShmBufError> {
        self.handle.resolve(SegmentLayout::HEADER)
    }

    #[inline(always)]
    fn write_id(&self, sbidx: usize) -> Result<&AtomicSubbufId, ShmBufError> {
        if unlikely(sbidx >= self.chan.num_subbuf()) {
            return Err(ShmBufError::SubbufOutOfRange {
                sbidx,
                num_subbuf: self.chan.num_subbuf(),
            });
        }
        self.handle.resolve_index(self.layout.wsb, sbidx)
    }

    #[inline(always)]
    fn slot(&self, id: SubbufId) -> Result<&BackendPages, ShmBufError> {
        let slot = id.index();
        if unlikely(slot >= self.chan.num_slots()) {
            return Err(ShmBufError::SlotOutOfRange {
                slot,
                num_slots: self.chan.num_slots(),
            });
        }
        self.handle.resolve_index(self.layout.array, slot)
    }

    fn write_slot(&self, sbidx: usize) -> Result<&BackendPages, ShmBufError> {
        self.slot(self.write_id(sbidx)?.load(Ordering::Relaxed))
    }

    fn read_slot(&self) -> Result<&BackendPages, ShmBufError> {
        self.slot(self.header()?.rsb.load(Ordering::Relaxed))
    }

    /// Passes errors through, reporting protocol violations on the way.
    #[inline(always)]
    fn report<T>(&self, result: Result<T, ShmBufError>) -> Result<T, ShmBufError> {
        match result {
            Err(err) if err.is_violation() => Err(self.violation(err)),
            other => other,
        }
    }

    #[cold]
    fn violation(&self, err: ShmBufError) -> ShmBufError {
        let violations = self
            .header()
            .map(|header| header.violations.fetch_add(1, Ordering::Relaxed) + 1)
            .ok();
        error!(error = %err, ?violations, "ring buffer protocol violation");
        if cfg!(feature = "abort-on-violation") {
            panic!("ring buffer protocol violation: {err}");
        }
        err
    }

    #[inline(always)]
    fn check_in_subbuf(&self, offset: usize, len: usize) -> Result<(), ShmBufError> {
        if unlikely(len > self.chan.subbuf_size() - offset) {
            return Err(ShmBufError::CrossesSubbuffer {
                offset,
                len,
                subbuf_size: self.chan.subbuf_size(),
            });
        }
        Ok(())
    }

    /// Walks the pages covering `len` bytes at `offset` of a slot, passing each
    /// page-bounded chunk and its position within the range to `f`.
    ///
    /// Returns the value `f` stopped the walk with, if any.
    #[inline(always)]
    fn for_each_page<B>(
        &self,
        pages: &BackendPages,
        offset: usize,
        len: usize,
        mut f: impl FnMut(NonNull<u8>, usize, usize) -> ControlFlow<B>,
    ) -> Result<Option<B>, ShmBufError> {
        let page_size = self.chan.page_size();
        let mut done = 0;
        while done < len {
            let pos = offset + done;
            let page_offset = pos & (page_size - 1);
            let chunk = (page_size - page_offset).min(len - done);
            let page = pages.page(&self.handle, pos >> self.chan.page_size_order())?;
            let ptr = self.handle.resolve_bytes(page.add(page_offset), chunk)?;
            if let ControlFlow::Break(b) = f(ptr, done, chunk) {
                return Ok(Some(b));
            }
            done += chunk;
        }
        Ok(None)
    }

    /// Resolves the writer slot for `len` bytes at `offset`. Ownership and
    /// bounds are checked here, before anything is copied.
    #[inline(always)]
    fn prepare_write(
        &self,
        offset: u64,
        len: usize,
    ) -> Result<(&BackendPages, usize), ShmBufError> {
        let sbidx = self.chan.subbuf_index(offset);
        let id = self.write_id(sbidx)?.load(Ordering::Acquire);
        if unlikely(self.chan.mode() == Mode::Overwrite && id.is_noref()) {
            return Err(ShmBufError::ReaderOwned {
                sbidx,
                slot: id.index(),
            });
        }
        let sb_offset = self.chan.subbuf_offset(offset);
        self.check_in_subbuf(sb_offset, len)?;
        Ok((self.slot(id)?, sb_offset))
    }

    #[inline(always)]
    fn prepare_read(&self, offset: u64, len: usize) -> Result<(&BackendPages, usize), ShmBufError> {
        let sb_offset = self.chan.subbuf_offset(offset);
        self.check_in_subbuf(sb_offset, len)?;
        let id = self.header()?.rsb.load(Ordering::Acquire);
        Ok((self.slot(id)?, sb_offset))
    }

    fn copy_in(
        &self,
        pages: &BackendPages,
        sb_offset: usize,
        src: &[u8],
    ) -> Result<(), ShmBufError> {
        self.for_each_page(pages, sb_offset, src.len(), |ptr, done, chunk| {
            let dst = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), chunk) };
            self.copy.copy(dst, &src[done..done + chunk]);
            ControlFlow::<()>::Continue(())
        })?;
        Ok(())
    }

    fn fill_in(
        &self,
        pages: &BackendPages,
        sb_offset: usize,
        value: u8,
        len: usize,
    ) -> Result<(), ShmBufError> {
        self.for_each_page(pages, sb_offset, len, |ptr, _, chunk| {
            let dst = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), chunk) };
            self.copy.fill(dst, value);
            ControlFlow::<()>::Continue(())
        })?;
        Ok(())
    }

    fn write_at(&self, offset: u64, src: &[u8]) -> Result<(), ShmBufError> {
        let (pages, sb_offset) = self.prepare_write(offset, src.len())?;
        backend_trace!(offset, len = src.len(), "backend write");
        self.copy_in(pages, sb_offset, src)
    }

    fn memset_at(&self, offset: u64, value: u8, len: usize) -> Result<(), ShmBufError> {
        let (pages, sb_offset) = self.prepare_write(offset, len)?;
        self.fill_in(pages, sb_offset, value, len)
    }

    fn write_cstr_at(
        &self,
        offset: u64,
        src: &[u8],
        len: usize,
        pad: u8,
    ) -> Result<(), ShmBufError> {
        if len == 0 {
            return Ok(());
        }
        let (pages, sb_offset) = self.prepare_write(offset, len)?;
        let room = len - 1;
        let copied = src
            .iter()
            .take(room)
            .position(|&b| b == 0)
            .unwrap_or(src.len().min(room));
        self.copy_in(pages, sb_offset, &src[..copied])?;
        self.fill_in(pages, sb_offset + copied, pad, room - copied)?;
        self.fill_in(pages, sb_offset + room, 0, 1)
    }

    /// Copies `dest.len()` bytes at `offset` out of the subbuffer held by the reader.
    ///
    /// The range may span pages but not subbuffers.
    pub fn read(&self, offset: u64, dest: &mut [u8]) -> Result<usize, ShmBufError> {
        self.report(self.read_inner(offset, dest))
    }

    fn read_inner(&self, offset: u64, dest: &mut [u8]) -> Result<usize, ShmBufError> {
        let len = dest.len();
        if len == 0 {
            return Ok(0);
        }
        let (pages, sb_offset) = self.prepare_read(offset, len)?;
        self.for_each_page(pages, sb_offset, len, |ptr, done, chunk| {
            let src = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), chunk) };
            dest[done..done + chunk].copy_from_slice(src);
            ControlFlow::<()>::Continue(())
        })?;
        backend_trace!(offset, len, "backend read");
        Ok(len)
    }

    /// Copies a NUL-terminated string at `offset` into `dest`, terminator included.
    ///
    /// Returns the string length. Fails with [`ShmBufError::Unterminated`] if
    /// no terminator occurs within `dest.len()` bytes or before the end of
    /// the subbuffer; nothing past either limit is read.
    pub fn read_cstr(&self, offset: u64, dest: &mut [u8]) -> Result<usize, ShmBufError> {
        self.report(self.read_cstr_inner(offset, dest))
    }

    fn read_cstr_inner(&self, offset: u64, dest: &mut [u8]) -> Result<usize, ShmBufError> {
        let max_len = dest.len();
        let len = max_len.min(self.chan.subbuf_size() - self.chan.subbuf_offset(offset));
        let (pages, sb_offset) = self.prepare_read(offset, len)?;
        let found = self.for_each_page(pages, sb_offset, len, |ptr, done, chunk| {
            let src = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), chunk) };
            match src.iter().position(|&b| b == 0) {
                Some(nul) => {
                    dest[done..=done + nul].copy_from_slice(&src[..=nul]);
                    ControlFlow::Break(done + nul)
                }
                None => {
                    dest[done..done + chunk].copy_from_slice(src);
                    ControlFlow::Continue(())
                }
            }
        })?;
        found.ok_or(ShmBufError::Unterminated(max_len))
    }

    /// Address of `offset` in the subbuffer the writer currently holds.
    ///
    /// The span ends at the page boundary. Subbuffer headers never straddle
    /// a page, so they can be stamped in place through it.
    pub fn offset_address(&self, offset: u64) -> Result<NonNull<[u8]>, ShmBufError> {
        self.report(
            self.prepare_write(offset, 0)
                .and_then(|(pages, sb_offset)| self.page_span(pages, sb_offset)),
        )
    }

    /// Address of `offset` in the subbuffer held by the reader, up to the page end.
    pub fn read_offset_address(&self, offset: u64) -> Result<NonNull<[u8]>, ShmBufError> {
        self.report(
            self.prepare_read(offset, 0)
                .and_then(|(pages, sb_offset)| self.page_span(pages, sb_offset)),
        )
    }

    fn page_span(
        &self,
        pages: &BackendPages,
        sb_offset: usize,
    ) -> Result<NonNull<[u8]>, ShmBufError> {
        let page_offset = sb_offset & (self.chan.page_size() - 1);
        let len = self.chan.page_size() - page_offset;
        let page = pages.page(&self.handle, sb_offset >> self.chan.page_size_order())?;
        let ptr = self.handle.resolve_bytes(page.add(page_offset), len)?;
        Ok(NonNull::slice_from_raw_parts(ptr, len))
    }

    /// Current identifier of logical subbuffer `sbidx` in the writer table.
    pub fn writer_slot(&self, sbidx: usize) -> Result<SubbufId, ShmBufError> {
        self.report(self.write_id(sbidx).map(|id| id.load(Ordering::Acquire)))
    }

    /// Identifier of the subbuffer held by the reader.
    pub fn reader_slot(&self) -> Result<SubbufId, ShmBufError> {
        self.report(
            self.header()
                .map(|header| header.rsb.load(Ordering::Acquire)),
        )
    }

    /// Writer takes back a reference on subbuffer `sbidx` before writing to it.
    ///
    /// Either wins against a concurrent [`update_read_sb_index`] for the same
    /// subbuffer, in which case the reader must retry, or clears the flag on
    /// the spare slot the reader swapped in. No-op in discard mode.
    ///
    /// [`update_read_sb_index`]: Backend::update_read_sb_index
    pub fn clear_noref(&self, sbidx: usize) -> Result<(), ShmBufError> {
        if self.chan.mode() != Mode::Overwrite {
            return Ok(());
        }
        let cell = self.report(self.write_id(sbidx))?;
        let mut id = cell.load(Ordering::Acquire);
        loop {
            if likely(!id.is_noref()) {
                return Ok(());
            }
            match cell.compare_exchange(
                id,
                id.with_noref(false),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    backend_trace!(sbidx, slot = id.index(), "writer reclaimed subbuffer");
                    return Ok(());
                }
                Err(current) => id = current,
            }
        }
    }

    /// Writer delivers subbuffer `sbidx`, stamped with the buffer `generation`
    /// it was filled in. Everything written before is visible to the reader
    /// once it takes the subbuffer. No-op in discard mode.
    pub fn set_noref_offset(&self, sbidx: usize, generation: u64) -> Result<(), ShmBufError> {
        self.report(self.set_noref_offset_inner(sbidx, generation))
    }

    fn set_noref_offset_inner(&self, sbidx: usize, generation: u64) -> Result<(), ShmBufError> {
        if self.chan.mode() != Mode::Overwrite {
            return Ok(());
        }
        let cell = self.write_id(sbidx)?;
        let id = cell.load(Ordering::Relaxed);
        if unlikely(id.is_noref()) {
            return Err(ShmBufError::AlreadyDelivered(sbidx));
        }
        // Release publishes the record bytes and slot counters with the flag.
        cell.store(
            id.with_generation(generation).with_noref(true),
            Ordering::Release,
        );
        backend_trace!(sbidx, generation, slot = id.index(), "subbuffer delivered");
        Ok(())
    }

    /// Reader takes subbuffer `consumed_idx`, delivered in generation `consumed_count`.
    ///
    /// In overwrite mode the reader's spare slot is swapped into the writer
    /// table with a single compare-and-exchange. Returns
    /// [`ShmBufError::Again`] when the subbuffer is not delivered, belongs to
    /// another generation, or the writer reclaimed it meanwhile.
    pub fn update_read_sb_index(
        &self,
        consumed_idx: usize,
        consumed_count: u64,
    ) -> Result<(), ShmBufError> {
        self.report(
            self.update_read_sb_index_inner(consumed_idx, consumed_count),
        )
    }

    fn update_read_sb_index_inner(
        &self,
        consumed_idx: usize,
        consumed_count: u64,
    ) -> Result<(), ShmBufError> {
        let header = self.header()?;
        let cell = self.write_id(consumed_idx)?;
        match self.chan.mode() {
            Mode::Overwrite => {
                let old = cell.load(Ordering::Acquire);
                if unlikely(!old.is_noref() || !old.matches_generation(consumed_count)) {
                    return Err(ShmBufError::Again);
                }
                let spare = header.rsb.load(Ordering::Relaxed);
                if unlikely(!spare.is_noref()) {
                    return Err(ShmBufError::ReaderSlotReferenced(spare.index()));
                }
                match cell.compare_exchange(
                    old,
                    spare.with_generation(consumed_count),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(taken) => {
                        header.rsb.store(taken, Ordering::Release);
                        backend_trace!(
                            consumed_idx,
                            slot = taken.index(),
                            spare = spare.index(),
                            "reader took subbuffer"
                        );
                        Ok(())
                    }
                    Err(_) => Err(ShmBufError::Again),
                }
            }
            Mode::Discard => {
                header.rsb.store(cell.load(Ordering::Acquire), Ordering::Release);
                Ok(())
            }
        }
    }

    /// Counts one committed record in subbuffer `sbidx`.
    pub fn count_record(&self, sbidx: usize) -> Result<(), ShmBufError> {
        self.report(self.write_slot(sbidx)).map(|pages| {
            pages.records_commit.fetch_add(1, Ordering::Relaxed);
        })
    }

    /// Records committed in subbuffer `sbidx` since its last delivery.
    pub fn records_count(&self, sbidx: usize) -> Result<u64, ShmBufError> {
        self.report(self.write_slot(sbidx)).map(BackendPages::records_commit)
    }

    /// Turns the committed records of subbuffer `sbidx` into unread ones.
    ///
    /// Called at delivery while the writer has exclusive access. Returns the
    /// records that were still unread from the slot's previous use, which
    /// overwrite mode has just lost.
    pub fn count_records_overrun(&self, sbidx: usize) -> Result<u64, ShmBufError> {
        let pages = self.report(self.write_slot(sbidx))?;
        let overruns = pages.records_unread();
        pages
            .records_unread
            .store(pages.records_commit(), Ordering::Relaxed);
        pages.records_commit.store(0, Ordering::Relaxed);
        Ok(overruns)
    }

    /// Reader consumed one record of the subbuffer it holds.
    pub fn consume_record(&self) -> Result<(), ShmBufError> {
        self.report(self.consume_record_inner())
    }

    fn consume_record_inner(&self) -> Result<(), ShmBufError> {
        let header = self.header()?;
        let id = header.rsb.load(Ordering::Relaxed);
        let pages = self.slot(id)?;
        if unlikely(pages.records_unread() == 0) {
            return Err(ShmBufError::NoUnreadRecords(id.index()));
        }
        pages.records_unread.fetch_sub(1, Ordering::Relaxed);
        header.records_read.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn records_read(&self) -> Result<u64, ShmBufError> {
        self.report(
            self.header()
                .map(|header| header.records_read.load(Ordering::Relaxed)),
        )
    }

    /// Unread records over every subbuffer, including the one the reader
    /// holds in overwrite mode.
    ///
    /// Only consistent while no reads or writes are in flight.
    pub fn records_unread(&self) -> Result<u64, ShmBufError> {
        self.report(self.records_unread_inner())
    }

    fn records_unread_inner(&self) -> Result<u64, ShmBufError> {
        let mut records_unread = 0;
        for sbidx in 0..self.chan.num_subbuf() {
            records_unread += self.write_slot(sbidx)?.records_unread();
        }
        if self.chan.mode() == Mode::Overwrite {
            records_unread += self.read_slot()?.records_unread();
        }
        Ok(records_unread)
    }

    pub fn set_data_size(&self, sbidx: usize, data_size: u64) -> Result<(), ShmBufError> {
        self.report(self.write_slot(sbidx)).map(|pages| {
            pages.data_size.store(data_size, Ordering::Relaxed);
        })
    }

    pub fn data_size(&self, sbidx: usize) -> Result<u64, ShmBufError> {
        self.report(self.write_slot(sbidx)).map(BackendPages::data_size)
    }

    /// Data size of the subbuffer held by the reader.
    pub fn read_data_size(&self) -> Result<u64, ShmBufError> {
        self.report(self.read_slot()).map(BackendPages::data_size)
    }

    /// Protocol violations reported by any process mapping this segment.
    pub fn violations(&self) -> Result<u64, ShmBufError> {
        Ok(self.header()?.violations.load(Ordering::Relaxed))
    }

    /// Returns identifiers and counters to their initial state.
    ///
    /// Only valid while no writer or reader is active on the channel.
    pub fn reset(&self) -> Result<(), ShmBufError> {
        self.report(self.layout.reset(&self.handle, &self.chan))
    }
}

/// A writer's position in the buffer, allocated and advanced by the frontend.
pub struct Context<'a, C = Memcpy> {
    backend: &'a Backend<C>,
    buf_offset: u64,
}

impl<'a, C: PageCopy> Context<'a, C> {
    pub fn new(backend: &'a Backend<C>, buf_offset: u64) -> Self {
        Context {
            backend,
            buf_offset,
        }
    }

    pub fn offset(&self) -> u64 {
        self.buf_offset
    }

    pub fn backend(&self) -> &'a Backend<C> {
        self.backend
    }

    /// Copies `src` at the current offset and advances past it.
    ///
    /// The copy must stay within one subbuffer; the frontend splits records
    /// at subbuffer boundaries. Nothing is copied and the offset is left
    /// alone if the target subbuffer is not referenced by the writer or the
    /// range would cross its end.
    pub fn write(&mut self, src: &[u8]) -> Result<(), ShmBufError> {
        self.backend
            .report(self.backend.write_at(self.buf_offset, src))?;
        self.buf_offset += src.len() as u64;
        Ok(())
    }

    /// Writes `len` copies of `value`.
    pub fn memset(&mut self, value: u8, len: usize) -> Result<(), ShmBufError> {
        self.backend
            .report(self.backend.memset_at(self.buf_offset, value, len))?;
        self.buf_offset += len as u64;
        Ok(())
    }

    /// Writes exactly `len` bytes: `src` up to its first NUL or `len - 1`
    /// bytes, then `pad` bytes, then a NUL terminator.
    pub fn write_cstr(&mut self, src: &[u8], len: usize, pad: u8) -> Result<(), ShmBufError> {
        self.backend
            .report(self.backend.write_cstr_at(self.buf_offset, src, len, pad))?;
        self.buf_offset += len as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use std::sync::atomic::{AtomicU64 as StdAtomicU64, AtomicUsize};
    use std::sync::Once;

    const SUBBUF_SIZE: usize = 1024;
    const NUM_SUBBUF: usize = 4;
    const PAGE_SIZE: usize = 256;
    const BUF_SIZE: u64 = (SUBBUF_SIZE * NUM_SUBBUF) as u64;

    static INIT: Once = Once::new();

    fn init_tracing() {
        INIT.call_once(|| {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
                )
                .init();
        });
    }

    fn backend(mode: Mode) -> Backend {
        init_tracing();
        Backend::create(&ChannelConfig {
            subbuf_size: SUBBUF_SIZE,
            num_subbuf: NUM_SUBBUF,
            mode,
            page_size: Some(PAGE_SIZE),
        })
        .unwrap()
    }

    #[fixture]
    fn overwrite() -> Backend {
        backend(Mode::Overwrite)
    }

    #[fixture]
    fn discard() -> Backend {
        backend(Mode::Discard)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    /// Delivers the subbuffer holding `offset` and hands it to the reader.
    fn hand_off(backend: &Backend, offset: u64) -> Result<(), ShmBufError> {
        let chan = backend.channel();
        let sbidx = chan.subbuf_index(offset);
        let generation = chan.buf_trunc_val(offset);
        backend.set_noref_offset(sbidx, generation)?;
        backend.update_read_sb_index(sbidx, generation)
    }

    #[rstest]
    #[case::subbuffer_start(0, 16)]
    #[case::across_one_page(200, 100)]
    #[case::across_many_pages(SUBBUF_SIZE as u64 + 10, 1000)]
    #[case::whole_subbuffer(3 * SUBBUF_SIZE as u64, SUBBUF_SIZE)]
    fn test_write_read_round_trip(
        #[values(Mode::Overwrite, Mode::Discard)] mode: Mode,
        #[case] offset: u64,
        #[case] len: usize,
    ) -> Result<(), ShmBufError> {
        let backend = backend(mode);
        let data = pattern(len, 7);

        let mut ctx = Context::new(&backend, offset);
        ctx.write(&data)?;
        assert_eq!(ctx.offset(), offset + len as u64);

        hand_off(&backend, offset)?;
        let mut out = vec![0; len];
        assert_eq!(backend.read(offset, &mut out)?, len);
        assert_eq!(out, data);
        assert_eq!(backend.violations()?, 0);
        Ok(())
    }

    #[rstest]
    #[case::first_byte(0)]
    #[case::last_byte(BUF_SIZE - 1)]
    fn test_wraparound(
        #[values(Mode::Overwrite, Mode::Discard)] mode: Mode,
        #[case] k: u64,
    ) -> Result<(), ShmBufError> {
        let direct = backend(mode);
        let wrapped = backend(mode);

        Context::new(&direct, k).write(&[0xAB])?;
        Context::new(&wrapped, BUF_SIZE + k).write(&[0xAB])?;
        hand_off(&direct, k)?;
        hand_off(&wrapped, BUF_SIZE + k)?;

        assert_eq!(direct.reader_slot()?.index(), wrapped.reader_slot()?.index());
        for (backend, offset) in [(&direct, k), (&wrapped, k), (&wrapped, BUF_SIZE + k)] {
            let mut byte = [0];
            backend.read(offset, &mut byte)?;
            assert_eq!(byte, [0xAB], "offset {}", offset);
        }
        Ok(())
    }

    #[rstest]
    fn test_cross_page_read_matches_split_reads(overwrite: Backend) -> Result<(), ShmBufError> {
        let base = SUBBUF_SIZE as u64;
        let data = pattern(SUBBUF_SIZE, 3);
        Context::new(&overwrite, base).write(&data)?;
        hand_off(&overwrite, base)?;

        let start = base + 200;
        let boundary = base + PAGE_SIZE as u64;
        let mut whole = [0u8; 200];
        overwrite.read(start, &mut whole)?;

        let mut head = vec![0u8; (boundary - start) as usize];
        let mut tail = vec![0u8; whole.len() - head.len()];
        overwrite.read(start, &mut head)?;
        overwrite.read(boundary, &mut tail)?;

        head.extend_from_slice(&tail);
        assert_eq!(&whole[..], &head[..]);
        assert_eq!(&whole[..], &data[200..400]);
        Ok(())
    }

    #[rstest]
    fn test_read_cstr(discard: Backend) -> Result<(), ShmBufError> {
        Context::new(&discard, 253).write(b"hello\0world")?;
        Context::new(&discard, 300).write(&[b'x'; 40])?;
        Context::new(&discard, 1000).write(&[b'y'; 24])?;
        hand_off(&discard, 0)?;

        let mut dest = [0xFFu8; 32];
        assert_eq!(discard.read_cstr(253, &mut dest)?, 5);
        assert_eq!(&dest[..6], b"hello\0");
        assert_eq!(dest[6], 0xFF);

        let mut short = [0u8; 16];
        assert!(matches!(
            discard.read_cstr(300, &mut short),
            Err(ShmBufError::Unterminated(16))
        ));
        assert_eq!(short, [b'x'; 16]);

        let mut tail = [0u8; 64];
        assert!(matches!(
            discard.read_cstr(1000, &mut tail),
            Err(ShmBufError::Unterminated(64))
        ));
        assert_eq!(&tail[..24], &[b'y'; 24]);
        assert_eq!(discard.violations()?, 0);
        Ok(())
    }

    #[rstest]
    fn test_records_unread_discard(discard: Backend) -> Result<(), ShmBufError> {
        for (sbidx, &count) in [2, 0, 5, 1].iter().enumerate() {
            for _ in 0..count {
                discard.count_record(sbidx)?;
            }
            assert_eq!(discard.records_count(sbidx)?, count);
            discard.count_records_overrun(sbidx)?;
        }
        assert_eq!(discard.records_unread()?, 8);
        Ok(())
    }

    #[rstest]
    fn test_records_unread_overwrite(overwrite: Backend) -> Result<(), ShmBufError> {
        for _ in 0..3 {
            overwrite.count_record(0)?;
        }
        overwrite.count_records_overrun(0)?;
        overwrite.set_noref_offset(0, 0)?;
        overwrite.update_read_sb_index(0, 0)?;
        assert_eq!(overwrite.reader_slot()?.index(), 0);
        overwrite.clear_noref(0)?;

        for (sbidx, &count) in [2, 0, 5, 1].iter().enumerate() {
            for _ in 0..count {
                overwrite.count_record(sbidx)?;
            }
            overwrite.count_records_overrun(sbidx)?;
        }
        assert_eq!(overwrite.records_unread()?, 11);
        Ok(())
    }

    #[cfg(not(feature = "abort-on-violation"))]
    #[rstest]
    fn test_write_into_delivered_subbuffer_rejected(overwrite: Backend) -> Result<(), ShmBufError> {
        let offset = 2 * SUBBUF_SIZE as u64;
        let delivered = pattern(300, 1);
        Context::new(&overwrite, offset).write(&delivered)?;
        overwrite.set_noref_offset(2, 0)?;

        let mut ctx = Context::new(&overwrite, offset);
        assert!(matches!(
            ctx.write(&[0u8; 300]),
            Err(ShmBufError::ReaderOwned { sbidx: 2, slot: 2 })
        ));
        assert_eq!(ctx.offset(), offset);
        assert_eq!(overwrite.violations()?, 1);

        overwrite.update_read_sb_index(2, 0)?;
        let mut out = vec![0u8; 300];
        overwrite.read(offset, &mut out)?;
        assert_eq!(out, delivered);

        // The spare swapped into the writer table stays off limits until reclaimed.
        assert!(ctx.write(&[0u8; 300]).is_err());
        overwrite.clear_noref(2)?;
        ctx.write(&[0u8; 300])?;
        assert_eq!(overwrite.writer_slot(2)?.index(), NUM_SUBBUF);

        overwrite.read(offset, &mut out)?;
        assert_eq!(out, delivered);
        Ok(())
    }

    #[cfg(not(feature = "abort-on-violation"))]
    #[rstest]
    fn test_access_crossing_subbuffer_rejected(discard: Backend) -> Result<(), ShmBufError> {
        let mut ctx = Context::new(&discard, 1000);
        assert!(matches!(
            ctx.write(&[1u8; 100]),
            Err(ShmBufError::CrossesSubbuffer {
                offset: 1000,
                len: 100,
                subbuf_size: SUBBUF_SIZE,
            })
        ));
        assert_eq!(ctx.offset(), 1000);

        let mut out = [0u8; 100];
        assert!(discard.read(1000, &mut out).is_err());
        assert!(Context::new(&discard, 1000).memset(0, 25).is_err());
        assert_eq!(discard.violations()?, 3);
        Ok(())
    }

    #[cfg(feature = "abort-on-violation")]
    #[rstest]
    #[should_panic(expected = "ring buffer protocol violation")]
    fn test_violation_aborts(discard: Backend) {
        let _ = Context::new(&discard, 1000).write(&[1u8; 100]);
    }

    #[rstest]
    fn test_offset_address_ends_at_page(overwrite: Backend) -> Result<(), ShmBufError> {
        assert_eq!(overwrite.offset_address(255)?.len(), 1);
        assert_eq!(overwrite.offset_address(256)?.len(), PAGE_SIZE);

        let span = overwrite.offset_address(300)?;
        assert_eq!(span.len(), PAGE_SIZE - 300 % PAGE_SIZE);
        unsafe { span.cast::<u8>().as_ptr().write(0x5A) };

        hand_off(&overwrite, 300)?;
        let read_span = overwrite.read_offset_address(300)?;
        assert_eq!(read_span.len(), span.len());
        assert_eq!(unsafe { read_span.cast::<u8>().as_ptr().read() }, 0x5A);

        let mut byte = [0];
        overwrite.read(300, &mut byte)?;
        assert_eq!(byte, [0x5A]);
        Ok(())
    }

    #[rstest]
    fn test_exchange_requires_delivery_and_generation(
        overwrite: Backend,
    ) -> Result<(), ShmBufError> {
        assert!(matches!(
            overwrite.update_read_sb_index(1, 0),
            Err(ShmBufError::Again)
        ));

        overwrite.set_noref_offset(1, 5)?;
        assert!(matches!(
            overwrite.update_read_sb_index(1, 4),
            Err(ShmBufError::Again)
        ));
        overwrite.update_read_sb_index(1, 5)?;

        let reader = overwrite.reader_slot()?;
        assert_eq!(reader.index(), 1);
        assert!(reader.is_noref());
        assert_eq!(reader.generation(), 5);

        let writer = overwrite.writer_slot(1)?;
        assert_eq!(writer.index(), NUM_SUBBUF);
        assert!(writer.is_noref());
        assert_eq!(overwrite.violations()?, 0);
        Ok(())
    }

    #[rstest]
    fn test_discard_mode_shares_writer_slot(discard: Backend) -> Result<(), ShmBufError> {
        discard.set_noref_offset(3, 1)?;
        assert_eq!(discard.writer_slot(3)?, SubbufId::new(3, false));

        discard.update_read_sb_index(3, 1)?;
        assert_eq!(discard.reader_slot()?, discard.writer_slot(3)?);

        Context::new(&discard, 3 * SUBBUF_SIZE as u64).write(b"still writable")?;
        Ok(())
    }

    #[rstest]
    fn test_write_cstr_and_memset(discard: Backend) -> Result<(), ShmBufError> {
        let mut ctx = Context::new(&discard, 250);
        ctx.write_cstr(b"abc\0zzz", 8, b'#')?;
        ctx.write_cstr(b"abcdefghij", 4, b'#')?;
        ctx.memset(0xEE, 300)?;
        assert_eq!(ctx.offset(), 250 + 8 + 4 + 300);
        hand_off(&discard, 0)?;

        let mut out = [0u8; 12];
        discard.read(250, &mut out)?;
        assert_eq!(&out, b"abc####\0abc\0");

        let mut fill = vec![0u8; 300];
        discard.read(262, &mut fill)?;
        assert!(fill.iter().all(|&b| b == 0xEE));
        Ok(())
    }

    #[rstest]
    fn test_count_records_overrun(overwrite: Backend) -> Result<(), ShmBufError> {
        for _ in 0..3 {
            overwrite.count_record(0)?;
        }
        assert_eq!(overwrite.count_records_overrun(0)?, 0);
        assert_eq!(overwrite.records_count(0)?, 0);
        assert_eq!(overwrite.records_unread()?, 3);

        for _ in 0..2 {
            overwrite.count_record(0)?;
        }
        assert_eq!(overwrite.count_records_overrun(0)?, 3);
        assert_eq!(overwrite.records_unread()?, 2);
        Ok(())
    }

    #[rstest]
    fn test_consume_records(discard: Backend) -> Result<(), ShmBufError> {
        discard.count_record(0)?;
        discard.count_record(0)?;
        discard.count_records_overrun(0)?;
        discard.update_read_sb_index(0, 0)?;

        discard.consume_record()?;
        discard.consume_record()?;
        assert_eq!(discard.records_read()?, 2);
        assert_eq!(discard.records_unread()?, 0);

        #[cfg(not(feature = "abort-on-violation"))]
        assert!(matches!(
            discard.consume_record(),
            Err(ShmBufError::NoUnreadRecords(0))
        ));
        Ok(())
    }

    #[rstest]
    fn test_data_size(overwrite: Backend) -> Result<(), ShmBufError> {
        overwrite.set_data_size(1, 700)?;
        assert_eq!(overwrite.data_size(1)?, 700);
        hand_off(&overwrite, SUBBUF_SIZE as u64)?;
        assert_eq!(overwrite.read_data_size()?, 700);
        assert_eq!(overwrite.data_size(1)?, 0);
        Ok(())
    }

    #[rstest]
    fn test_reset(overwrite: Backend) -> Result<(), ShmBufError> {
        overwrite.count_record(1)?;
        overwrite.count_records_overrun(1)?;
        hand_off(&overwrite, SUBBUF_SIZE as u64)?;
        overwrite.consume_record()?;

        overwrite.reset()?;
        assert_eq!(overwrite.records_unread()?, 0);
        assert_eq!(overwrite.records_read()?, 0);
        for sbidx in 0..NUM_SUBBUF {
            assert_eq!(overwrite.writer_slot(sbidx)?, SubbufId::new(sbidx, false));
        }
        assert_eq!(overwrite.reader_slot()?, SubbufId::new(NUM_SUBBUF, true));
        Ok(())
    }

    #[cfg(not(feature = "abort-on-violation"))]
    #[rstest]
    fn test_subbuffer_ordinal_out_of_range(overwrite: Backend) {
        assert!(matches!(
            overwrite.clear_noref(NUM_SUBBUF),
            Err(ShmBufError::SubbufOutOfRange { sbidx: 4, num_subbuf: 4 })
        ));
        assert!(overwrite.count_record(NUM_SUBBUF).is_err());
    }

    #[derive(Default)]
    struct ChecksumCopy {
        sum: StdAtomicU64,
        largest_chunk: AtomicUsize,
    }

    impl PageCopy for ChecksumCopy {
        fn copy(&self, dst: &mut [u8], src: &[u8]) {
            dst.copy_from_slice(src);
            let sum: u64 = src.iter().map(|&b| b as u64).sum();
            self.sum.fetch_add(sum, std::sync::atomic::Ordering::Relaxed);
            self.largest_chunk
                .fetch_max(src.len(), std::sync::atomic::Ordering::Relaxed);
        }
    }

    #[test]
    fn test_custom_copy_strategy() -> Result<(), ShmBufError> {
        let backend = backend(Mode::Discard).with_copy(ChecksumCopy::default());
        let data = pattern(600, 11);
        Context::new(&backend, 100).write(&data)?;

        let expected: u64 = data.iter().map(|&b| b as u64).sum();
        let copy = &backend.copy;
        assert_eq!(copy.sum.load(std::sync::atomic::Ordering::Relaxed), expected);
        assert!(copy.largest_chunk.load(std::sync::atomic::Ordering::Relaxed) <= PAGE_SIZE);

        backend.update_read_sb_index(0, 0)?;
        let mut out = vec![0u8; 600];
        backend.read(100, &mut out)?;
        assert_eq!(out, data);
        Ok(())
    }
}
