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

//! # ringbuf-backend - Subbuffer Backend for a Shared-Memory Trace Buffer
//!
//! Storage layer of a lock-free tracing ring buffer shared between
//! processes. A buffer of `num_subbuf` subbuffers lives in one `memfd`
//! segment; every process maps it at its own base address and all
//! structures inside refer to each other by offset.
//!
//! The backend does not reserve space. A frontend allocates monotonically
//! increasing offsets to writers, and the backend maps each offset to a
//! subbuffer slot and page, copies bytes in and out, and hands subbuffers
//! between writers and the single reader:
//!
//! - In [`Mode::Overwrite`] each logical subbuffer is backed by a physical
//!   slot the reader can swap out atomically, using one extra spare slot,
//!   so writers never wait for the reader.
//! - In [`Mode::Discard`] the reader reads subbuffers in place.
//!
//! ## Creating a Buffer
//!
//! ```rust
//! use ringbuf_backend::{Backend, ChannelConfig, Mode};
//!
//! let backend = Backend::create(&ChannelConfig {
//!     subbuf_size: 8192,
//!     num_subbuf: 4,
//!     mode: Mode::Overwrite,
//!     page_size: None,
//! })?;
//! assert_eq!(backend.channel().buf_size(), 32768);
//! # Ok::<(), ringbuf_backend::ShmBufError>(())
//! ```
//!
//! Sizes must be powers of two and a subbuffer holds at least one page.
//! Configuration can also be loaded from TOML with [`ChannelConfig::load`].
//!
//! ## Writing and Handing Off
//!
//! ```rust
//! use ringbuf_backend::{Backend, ChannelConfig, Context};
//!
//! # let backend = Backend::create(&ChannelConfig::default())?;
//! let chan = *backend.channel();
//! let offset = 0;
//! let sbidx = chan.subbuf_index(offset);
//!
//! // Writer
//! backend.clear_noref(sbidx)?;
//! let mut ctx = Context::new(&backend, offset);
//! ctx.write(b"event payload")?;
//! backend.count_record(sbidx)?;
//! backend.set_data_size(sbidx, ctx.offset() - offset)?;
//! backend.count_records_overrun(sbidx)?;
//! backend.set_noref_offset(sbidx, chan.buf_trunc_val(offset))?;
//!
//! // Reader
//! backend.update_read_sb_index(sbidx, chan.buf_trunc_val(offset))?;
//! let mut payload = vec![0; backend.read_data_size()? as usize];
//! backend.read(offset, &mut payload)?;
//! backend.consume_record()?;
//! assert_eq!(payload, b"event payload");
//! # Ok::<(), ringbuf_backend::ShmBufError>(())
//! ```
//!
//! [`Backend::update_read_sb_index`] returns [`ShmBufError::Again`] when the
//! writer reclaimed the subbuffer first; the reader retries later.
//!
//! ## Cross-Process Usage
//!
//! The creating process shares the segment's file descriptor, and other
//! processes map it with [`Backend::open`].
//!
//! ```rust
//! # use ringbuf_backend::{Backend, ChannelConfig};
//! let backend = Backend::create(&ChannelConfig::default())?;
//!
//! // Other process (after receiving the fd)
//! # let memory_fd = backend.memory_fd().try_clone_to_owned()?;
//! let peer = Backend::open(memory_fd)?;
//! assert_eq!(peer.channel(), backend.channel());
//! # Ok::<(), ringbuf_backend::ShmBufError>(())
//! ```
//!
//! ## Protocol Violations
//!
//! Accesses that could only result from a caller breaking the protocol,
//! such as writing into a subbuffer the reader owns or crossing a subbuffer
//! boundary, are rejected before any byte is copied. They are logged,
//! counted in the segment ([`Backend::violations`]) and returned as errors,
//! or abort the process with the `abort-on-violation` feature.

pub use backend::{Backend, Context};
pub use config::{ChannelBackend, ChannelConfig, Mode, MIN_PAGE_SIZE};
pub use copy::{Memcpy, PageCopy};
pub use error::ShmBufError;
pub use id::{AtomicSubbufId, SubbufId, MAX_SLOTS};
pub use shm::{ShmHandle, ShmRef, ShmType};

pub mod backend;
pub(crate) mod common;
pub mod config;
pub mod copy;
pub mod error;
pub mod id;
pub(crate) mod layout;
#[cfg(all(test, feature = "loom"))]
pub(crate) mod loom;
pub(crate) mod memory;
pub(crate) mod pages;
pub mod shm;
pub(crate) mod sync;
mod trace_macro;
