// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Virtio block device front end.
//!
//! One request queue, a single outstanding request. Requests are dispatched
//! to a [`BlockBackend`]; synchronous backends complete within the notify
//! scan, asynchronous ones suspend the queue until the embedder delivers the
//! completion through [`VirtioBlkDevice::complete_io`].

#![forbid(unsafe_code)]

pub mod protocol;
pub mod resolver;

use crate::protocol::*;
use block_backend::BlockBackend;
use block_backend::BlockError;
use block_backend::IoSubmission;
use block_backend::SECTOR_SIZE;
use virtio::DeviceTraits;
use virtio::RecvResult;
use virtio::VirtioCore;
use virtio::VirtioDevice;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Virtio device type of a block device.
pub const VIRTIO_BLK_DEVICE_ID: u16 = 2;

const SECTOR_BYTES: usize = SECTOR_SIZE as usize;

/// The request being serviced.
#[derive(Debug)]
struct PendingRequest {
    request_type: u32,
    queue_idx: u32,
    head: u16,
    write_size: u32,
    /// IN only: the data-plus-status buffer returned to the guest.
    buf: Vec<u8>,
}

/// Block device front end over any [`BlockBackend`].
pub struct VirtioBlkDevice {
    backend: Box<dyn BlockBackend>,
    req: Option<PendingRequest>,
}

impl VirtioBlkDevice {
    pub fn new(backend: Box<dyn BlockBackend>) -> Self {
        Self { backend, req: None }
    }

    /// Delivers the completion of a request the backend reported as
    /// [`IoSubmission::Submitted`].
    ///
    /// Publishes the used entry, then re-scans the queue for heads the driver
    /// submitted while the device was busy.
    pub fn complete_io(&mut self, core: &mut VirtioCore, result: Result<(), BlockError>) {
        let Some(req) = &self.req else {
            tracing::warn!("block completion with no request in flight");
            return;
        };
        let queue_idx = req.queue_idx;
        self.req_end(core, status_of(result));
        core.queue_notify(self, queue_idx);
    }

    fn dispatch(&mut self, core: &mut VirtioCore, submission: IoSubmission) {
        match submission {
            IoSubmission::Complete(result) => self.req_end(core, status_of(result)),
            // The backend calls back through complete_io; the queue stays
            // suspended until then.
            IoSubmission::Submitted => {}
        }
    }

    /// Finishes the in-flight request: writes the status byte (and for reads
    /// the data), and publishes the used entry.
    fn req_end(&mut self, core: &mut VirtioCore, status: u8) {
        let Some(req) = self.req.take() else {
            return;
        };
        let PendingRequest {
            request_type,
            queue_idx,
            head,
            write_size,
            mut buf,
        } = req;
        match request_type {
            VIRTIO_BLK_T_IN => {
                buf[write_size as usize - 1] = status;
                match core.copy_to_queue(queue_idx, head, 0, &buf) {
                    Ok(()) => core.consume_desc(queue_idx, head, write_size),
                    Err(err) => {
                        tracing::error!(
                            head,
                            error = &err as &dyn std::error::Error,
                            "failed to return read data"
                        );
                        core.consume_desc(queue_idx, head, 0);
                    }
                }
            }
            _ => match core.copy_to_queue(queue_idx, head, 0, &[status]) {
                Ok(()) => core.consume_desc(queue_idx, head, 1),
                Err(err) => {
                    tracing::error!(
                        head,
                        error = &err as &dyn std::error::Error,
                        "failed to write status byte"
                    );
                    core.consume_desc(queue_idx, head, 0);
                }
            },
        }
    }
}

fn status_of(result: Result<(), BlockError>) -> u8 {
    match result {
        Ok(()) => VIRTIO_BLK_S_OK,
        Err(err) => {
            tracing::error!(error = &err as &dyn std::error::Error, "block backend error");
            VIRTIO_BLK_S_IOERR
        }
    }
}

impl VirtioDevice for VirtioBlkDevice {
    fn traits(&self) -> DeviceTraits {
        DeviceTraits {
            device_id: VIRTIO_BLK_DEVICE_ID,
            device_features: 0,
            config_space_size: 8,
        }
    }

    fn init_config(&self, config: &mut [u8]) {
        // Config space is just the capacity in sectors, little-endian.
        config.copy_from_slice(&self.backend.sector_count().to_le_bytes());
    }

    fn recv_request(
        &mut self,
        core: &mut VirtioCore,
        queue_idx: u32,
        head: u16,
        read_size: u32,
        write_size: u32,
    ) -> RecvResult {
        if self.req.is_some() {
            return RecvResult::Busy;
        }

        let mut header = RequestHeader::new_zeroed();
        if let Err(err) = core.copy_from_queue(queue_idx, head, 0, header.as_mut_bytes()) {
            tracing::error!(
                head,
                error = &err as &dyn std::error::Error,
                "malformed block request header"
            );
            core.consume_desc(queue_idx, head, 0);
            return RecvResult::Handled;
        }
        let request_type = header.request_type.get();
        let sector = header.sector.get();
        tracing::debug!(request_type, sector, read_size, write_size, "block request");

        let pending = |buf: Vec<u8>| PendingRequest {
            request_type,
            queue_idx,
            head,
            write_size,
            buf,
        };
        match request_type {
            VIRTIO_BLK_T_IN => {
                // The writable suffix must hold at least the status byte.
                if write_size == 0 {
                    tracing::error!(head, "read request with no writable buffer");
                    core.consume_desc(queue_idx, head, 0);
                    return RecvResult::Handled;
                }
                let mut buf = vec![0; write_size as usize];
                let data_len = (write_size as usize - 1) / SECTOR_BYTES * SECTOR_BYTES;
                let submission = self.backend.read_sectors(sector, &mut buf[..data_len]);
                self.req = Some(pending(buf));
                self.dispatch(core, submission);
            }
            VIRTIO_BLK_T_OUT => {
                if write_size == 0 {
                    tracing::error!(head, "write request with no status buffer");
                    core.consume_desc(queue_idx, head, 0);
                    return RecvResult::Handled;
                }
                let len = read_size.saturating_sub(REQUEST_HEADER_SIZE) as usize;
                let mut buf = vec![0; len];
                if let Err(err) =
                    core.copy_from_queue(queue_idx, head, REQUEST_HEADER_SIZE.into(), &mut buf)
                {
                    tracing::error!(
                        head,
                        error = &err as &dyn std::error::Error,
                        "failed to read write payload"
                    );
                    core.consume_desc(queue_idx, head, 0);
                    return RecvResult::Handled;
                }
                let data_len = len / SECTOR_BYTES * SECTOR_BYTES;
                let submission = self.backend.write_sectors(sector, &buf[..data_len]);
                self.req = Some(pending(Vec::new()));
                self.dispatch(core, submission);
            }
            VIRTIO_BLK_T_FLUSH | VIRTIO_BLK_T_FLUSH_OUT => {
                let submission = self.backend.flush();
                self.req = Some(pending(Vec::new()));
                self.dispatch(core, submission);
            }
            _ => {
                tracing::warn!(request_type, "unsupported block request type");
                self.req = Some(pending(Vec::new()));
                self.req_end(core, VIRTIO_BLK_S_UNSUPP);
            }
        }
        RecvResult::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_file::FileBlock;
    use block_file::FileBlockMode;
    use guestmem::testing::SparseRam;
    use guestmem::GuestMemory;
    use simcore::line_interrupt::test_helpers::TestLineInterruptTarget;
    use simcore::line_interrupt::LineInterrupt;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::Mutex;
    use virtio::spec::queue::Descriptor;
    use virtio::spec::queue::DescriptorFlags;
    use virtio::spec::queue::UsedElement;
    use virtio::VirtioMmioDevice;

    const DESC: u64 = 0x1000;
    const AVAIL: u64 = 0x2000;
    const USED: u64 = 0x3000;
    const HEADER: u64 = 0x4000;
    const STATUS: u64 = 0x5000;
    const DATA: u64 = 0x10000;
    const QUEUE_SIZE: u16 = 16;
    const IRQ: u32 = 7;

    struct TestRing {
        mem: GuestMemory,
        avail_idx: u16,
        next_desc: u16,
        last_used_idx: u16,
    }

    impl TestRing {
        fn new(mem: GuestMemory) -> Self {
            Self {
                mem,
                avail_idx: 0,
                next_desc: 0,
                last_used_idx: 0,
            }
        }

        fn add_chain(&mut self, bufs: &[(u64, u32, bool)]) -> u16 {
            let head = self.next_desc;
            for (i, &(address, length, writable)) in bufs.iter().enumerate() {
                let index = self.next_desc;
                self.next_desc += 1;
                let last = i == bufs.len() - 1;
                let next = if last { 0 } else { self.next_desc };
                self.mem
                    .write_plain(
                        DESC + index as u64 * 16,
                        &Descriptor {
                            address: address.into(),
                            length: length.into(),
                            flags_raw: u16::from(
                                DescriptorFlags::new().with_write(writable).with_next(!last),
                            )
                            .into(),
                            next: next.into(),
                        },
                    )
                    .unwrap();
            }
            let slot = self.avail_idx % QUEUE_SIZE;
            self.mem.write_u16(AVAIL + 4 + slot as u64 * 2, head).unwrap();
            self.avail_idx = self.avail_idx.wrapping_add(1);
            self.mem.write_u16(AVAIL + 2, self.avail_idx).unwrap();
            head
        }

        /// Publishes a request chain: header, optional data buffers, status.
        fn add_request(&mut self, request_type: u32, sector: u64, data: &[(u64, u32, bool)]) -> u16 {
            self.mem
                .write_plain(
                    HEADER,
                    &RequestHeader {
                        request_type: request_type.into(),
                        ioprio: 0.into(),
                        sector: sector.into(),
                    },
                )
                .unwrap();
            let mut bufs = vec![(HEADER, REQUEST_HEADER_SIZE, false)];
            bufs.extend_from_slice(data);
            bufs.push((STATUS, 1, true));
            self.add_chain(&bufs)
        }

        fn used_idx(&self) -> u16 {
            self.mem.read_u16(USED + 2).unwrap()
        }

        fn next_used(&mut self) -> Option<(u16, u32)> {
            if self.last_used_idx == self.used_idx() {
                return None;
            }
            let slot = (self.last_used_idx % QUEUE_SIZE) as u64;
            self.last_used_idx = self.last_used_idx.wrapping_add(1);
            let element: UsedElement = self.mem.read_plain(USED + 4 + slot * 8).unwrap();
            Some((element.id.get() as u16, element.len.get()))
        }

        fn status_byte(&self) -> u8 {
            self.mem.read_u8(STATUS).unwrap()
        }
    }

    fn make_dev(
        backend: Box<dyn BlockBackend>,
    ) -> (
        VirtioMmioDevice<VirtioBlkDevice>,
        TestRing,
        Arc<TestLineInterruptTarget>,
    ) {
        let mem = SparseRam::new().into_guest_memory();
        let target = TestLineInterruptTarget::new_arc();
        let interrupt = LineInterrupt::new("virtio-blk", target.clone(), IRQ);
        let mut dev = VirtioMmioDevice::new(VirtioBlkDevice::new(backend), mem.clone(), interrupt);
        // Driver bring-up: negotiate, program queue 0, run.
        dev.write_u32(0x070, 1);
        dev.write_u32(0x070, 1 | 2);
        dev.write_u32(0x030, 0);
        dev.write_u32(0x038, QUEUE_SIZE.into());
        dev.write_u32(0x080, DESC as u32);
        dev.write_u32(0x090, AVAIL as u32);
        dev.write_u32(0x0a0, USED as u32);
        dev.write_u32(0x044, 1);
        dev.write_u32(0x070, 1 | 2 | 8 | 4);
        (dev, TestRing::new(mem), target)
    }

    fn file_backend(sectors: u64, mode: FileBlockMode) -> Box<FileBlock> {
        let mut file = tempfile::tempfile().unwrap();
        for i in 0..sectors {
            file.write_all(&[i as u8; SECTOR_BYTES]).unwrap();
        }
        Box::new(FileBlock::with_file(file, mode).unwrap())
    }

    #[test]
    fn device_identity_and_capacity() {
        let (dev, _, _) = make_dev(file_backend(2048, FileBlockMode::ReadWrite));
        assert_eq!(dev.read_u32(0x000), 0x74726976);
        assert_eq!(dev.read_u32(0x004), 2);
        assert_eq!(dev.read_u32(0x008), 2);
        assert_eq!(dev.read_u32(0x00c), 0xffff);
        // 1 MiB backing file: capacity 2048 sectors, little-endian u64.
        assert_eq!(dev.read_u32(0x100), 2048);
        assert_eq!(dev.read_u32(0x104), 0);
    }

    #[test]
    fn block_read() {
        let (mut dev, mut ring, target) = make_dev(file_backend(2048, FileBlockMode::ReadWrite));
        let head = ring.add_request(VIRTIO_BLK_T_IN, 0, &[(DATA, 512, true)]);
        dev.write_u32(0x050, 0);

        assert_eq!(ring.used_idx(), 1);
        assert_eq!(ring.next_used(), Some((head, 513)));
        let mut data = [0xff; 512];
        ring.mem.read_at(DATA, &mut data).unwrap();
        assert_eq!(data, [0u8; 512]);
        assert_eq!(ring.status_byte(), VIRTIO_BLK_S_OK);
        assert!(target.is_high(IRQ));

        // Sector 5 has its own fill pattern.
        dev.write_u32(0x064, 1);
        let head = ring.add_request(VIRTIO_BLK_T_IN, 5, &[(DATA, 512, true)]);
        dev.write_u32(0x050, 0);
        assert_eq!(ring.next_used(), Some((head, 513)));
        ring.mem.read_at(DATA, &mut data).unwrap();
        assert_eq!(data, [5u8; 512]);
    }

    #[test]
    fn block_write() {
        let (mut dev, mut ring, _) = make_dev(file_backend(2048, FileBlockMode::ReadWrite));
        ring.mem.write_at(DATA, &[0xaa; 512]).unwrap();
        let head = ring.add_request(VIRTIO_BLK_T_OUT, 5, &[(DATA, 512, false)]);
        dev.write_u32(0x050, 0);

        assert_eq!(ring.next_used(), Some((head, 1)));
        assert_eq!(ring.status_byte(), VIRTIO_BLK_S_OK);

        // Read sector 5 back through the device.
        let head = ring.add_request(VIRTIO_BLK_T_IN, 5, &[(DATA + 0x1000, 512, true)]);
        dev.write_u32(0x050, 0);
        assert_eq!(ring.next_used(), Some((head, 513)));
        let mut data = [0; 512];
        ring.mem.read_at(DATA + 0x1000, &mut data).unwrap();
        assert_eq!(data, [0xaa; 512]);
    }

    #[test]
    fn block_write_read_only_fails() {
        let (mut dev, mut ring, _) = make_dev(file_backend(2048, FileBlockMode::ReadOnly));
        ring.mem.write_at(DATA, &[0xaa; 512]).unwrap();
        let head = ring.add_request(VIRTIO_BLK_T_OUT, 5, &[(DATA, 512, false)]);
        dev.write_u32(0x050, 0);

        assert_eq!(ring.next_used(), Some((head, 1)));
        assert_eq!(ring.status_byte(), VIRTIO_BLK_S_IOERR);

        // The data is unchanged on disk.
        let head = ring.add_request(VIRTIO_BLK_T_IN, 5, &[(DATA + 0x1000, 512, true)]);
        dev.write_u32(0x050, 0);
        assert_eq!(ring.next_used(), Some((head, 513)));
        let mut data = [0; 512];
        ring.mem.read_at(DATA + 0x1000, &mut data).unwrap();
        assert_eq!(data, [5u8; 512]);
    }

    #[test]
    fn read_past_capacity_reports_ioerr() {
        let (mut dev, mut ring, _) = make_dev(file_backend(8, FileBlockMode::ReadWrite));
        let head = ring.add_request(VIRTIO_BLK_T_IN, 8, &[(DATA, 512, true)]);
        dev.write_u32(0x050, 0);
        assert_eq!(ring.next_used(), Some((head, 513)));
        assert_eq!(ring.status_byte(), VIRTIO_BLK_S_IOERR);
    }

    #[test]
    fn flush_is_ok() {
        let (mut dev, mut ring, _) = make_dev(file_backend(8, FileBlockMode::ReadWrite));
        let head = ring.add_request(VIRTIO_BLK_T_FLUSH, 0, &[]);
        dev.write_u32(0x050, 0);
        assert_eq!(ring.next_used(), Some((head, 1)));
        assert_eq!(ring.status_byte(), VIRTIO_BLK_S_OK);
    }

    #[test]
    fn unsupported_type_reports_unsupp() {
        let (mut dev, mut ring, _) = make_dev(file_backend(8, FileBlockMode::ReadWrite));
        let head = ring.add_request(9, 0, &[]);
        dev.write_u32(0x050, 0);
        assert_eq!(ring.next_used(), Some((head, 1)));
        assert_eq!(ring.status_byte(), VIRTIO_BLK_S_UNSUPP);
    }

    #[test]
    fn malformed_read_chain_consumes_zero() {
        let (mut dev, mut ring, _) = make_dev(file_backend(8, FileBlockMode::ReadWrite));
        // A read request whose only descriptor is the read-only header: no
        // room for data or even the status byte.
        ring.mem
            .write_plain(
                HEADER,
                &RequestHeader {
                    request_type: VIRTIO_BLK_T_IN.into(),
                    ioprio: 0.into(),
                    sector: 0.into(),
                },
            )
            .unwrap();
        let head = ring.add_chain(&[(HEADER, REQUEST_HEADER_SIZE, false)]);
        dev.write_u32(0x050, 0);
        assert_eq!(ring.next_used(), Some((head, 0)));
    }

    #[derive(Default)]
    struct SharedState {
        defer: bool,
        flushes: usize,
    }

    /// Fills reads with 0x5a; optionally defers completion.
    #[derive(Clone)]
    struct AsyncBackend(Arc<Mutex<SharedState>>);

    impl BlockBackend for AsyncBackend {
        fn sector_count(&self) -> u64 {
            2048
        }

        fn read_sectors(&mut self, _sector: u64, buf: &mut [u8]) -> IoSubmission {
            buf.fill(0x5a);
            if self.0.lock().unwrap().defer {
                IoSubmission::Submitted
            } else {
                IoSubmission::Complete(Ok(()))
            }
        }

        fn write_sectors(&mut self, _sector: u64, _buf: &[u8]) -> IoSubmission {
            if self.0.lock().unwrap().defer {
                IoSubmission::Submitted
            } else {
                IoSubmission::Complete(Ok(()))
            }
        }

        fn flush(&mut self) -> IoSubmission {
            self.0.lock().unwrap().flushes += 1;
            IoSubmission::Complete(Ok(()))
        }
    }

    #[test]
    fn deferred_completion_drains_queued_heads() {
        let state = Arc::new(Mutex::new(SharedState {
            defer: true,
            ..Default::default()
        }));
        let (mut dev, mut ring, target) = make_dev(Box::new(AsyncBackend(state.clone())));

        let head1 = ring.add_request(VIRTIO_BLK_T_IN, 0, &[(DATA, 512, true)]);
        dev.write_u32(0x050, 0);
        // In flight: nothing published yet, no interrupt.
        assert_eq!(ring.used_idx(), 0);
        assert!(!target.is_high(IRQ));

        // A second head queued while busy is not accepted yet.
        let head2 = ring.add_request(VIRTIO_BLK_T_IN, 1, &[(DATA + 0x1000, 512, true)]);
        dev.write_u32(0x050, 0);
        assert_eq!(ring.used_idx(), 0);

        // Completion publishes the first request and then drains the second
        // without another guest kick.
        state.lock().unwrap().defer = false;
        let (core, blk) = dev.split();
        blk.complete_io(core, Ok(()));
        assert_eq!(ring.next_used(), Some((head1, 513)));
        assert_eq!(ring.next_used(), Some((head2, 513)));
        assert!(target.is_high(IRQ));
        let mut data = [0; 512];
        ring.mem.read_at(DATA, &mut data).unwrap();
        assert_eq!(data, [0x5a; 512]);
    }

    #[test]
    fn deferred_completion_with_error_reports_ioerr() {
        let state = Arc::new(Mutex::new(SharedState {
            defer: true,
            ..Default::default()
        }));
        let (mut dev, mut ring, _) = make_dev(Box::new(AsyncBackend(state.clone())));

        let head = ring.add_request(VIRTIO_BLK_T_IN, 0, &[(DATA, 512, true)]);
        dev.write_u32(0x050, 0);
        let (core, blk) = dev.split();
        blk.complete_io(core, Err(BlockError::OutOfRange));
        assert_eq!(ring.next_used(), Some((head, 513)));
        assert_eq!(ring.status_byte(), VIRTIO_BLK_S_IOERR);
    }

    #[test]
    fn flush_reaches_backend() {
        let state = Arc::new(Mutex::new(SharedState::default()));
        let (mut dev, mut ring, _) = make_dev(Box::new(AsyncBackend(state.clone())));
        ring.add_request(VIRTIO_BLK_T_FLUSH, 0, &[]);
        dev.write_u32(0x050, 0);
        assert_eq!(state.lock().unwrap().flushes, 1);
    }
}
