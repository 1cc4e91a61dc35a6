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

#[cfg(all(test, feature = "loom"))]
mod tests {
    use crate::{Backend, ChannelConfig, Context, Mode, ShmBufError};
    use loom::{model::Builder, sync::Arc, thread};

    fn flight_recorder() -> Backend {
        Backend::create(&ChannelConfig {
            subbuf_size: 4096,
            num_subbuf: 1,
            mode: Mode::Overwrite,
            page_size: Some(4096),
        })
        .unwrap()
    }

    fn builder() -> Builder {
        let mut builder = Builder::new();
        if builder.preemption_bound.is_none() {
            builder.preemption_bound = Some(3);
        }
        builder
    }

    #[test]
    fn test_reclaim_races_with_exchange() {
        builder().check(|| {
            let backend = Arc::new(flight_recorder());
            Context::new(&backend, 0).write(b"delivered").unwrap();
            backend.count_record(0).unwrap();
            backend.count_records_overrun(0).unwrap();
            backend.set_noref_offset(0, 0).unwrap();

            let writer = {
                let backend = backend.clone();
                thread::spawn(move || backend.clear_noref(0).unwrap())
            };
            let taken = backend.update_read_sb_index(0, 0);
            writer.join().unwrap();

            let writer_id = backend.writer_slot(0).unwrap();
            let reader_id = backend.reader_slot().unwrap();
            assert!(!writer_id.is_noref());
            assert!(reader_id.is_noref());
            assert_ne!(writer_id.index(), reader_id.index());

            match taken {
                Ok(()) => {
                    assert_eq!(reader_id.index(), 0);
                    let mut buf = [0u8; 9];
                    backend.read(0, &mut buf).unwrap();
                    assert_eq!(&buf, b"delivered");
                    backend.consume_record().unwrap();
                }
                Err(ShmBufError::Again) => {
                    assert_eq!(reader_id.index(), 1);
                    assert_eq!(backend.records_count(0).unwrap(), 0);
                }
                Err(err) => panic!("unexpected exchange failure: {err}"),
            }
        });
    }

    #[test]
    fn test_delivery_publishes_bytes() {
        builder().check(|| {
            let backend = Arc::new(flight_recorder());

            let writer = {
                let backend = backend.clone();
                thread::spawn(move || {
                    Context::new(&backend, 4096).write(b"second round").unwrap();
                    backend.set_data_size(0, 12).unwrap();
                    backend.set_noref_offset(0, 1).unwrap();
                })
            };

            loop {
                match backend.update_read_sb_index(0, 1) {
                    Ok(()) => break,
                    Err(ShmBufError::Again) => thread::yield_now(),
                    Err(err) => panic!("unexpected exchange failure: {err}"),
                }
            }

            assert_eq!(backend.read_data_size().unwrap(), 12);
            let mut buf = [0u8; 12];
            backend.read(4096, &mut buf).unwrap();
            assert_eq!(&buf, b"second round");

            writer.join().unwrap();
        });
    }
}
