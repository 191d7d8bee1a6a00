// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Split-virtqueue state and the descriptor-chain engine.
//!
//! The engine is a set of pure algorithms over a [`QueueState`] and a
//! [`GuestMemory`] capability; it keeps no state of its own. All multi-byte
//! transfers in and out of descriptor buffers are split at guest page
//! boundaries by the memory capability.

use crate::spec::queue as spec;
use crate::spec::MAX_QUEUE_NUM;
use guestmem::GuestMemory;
use guestmem::GuestMemoryError;
use std::sync::atomic;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("error accessing queue memory")]
    Memory(#[from] GuestMemoryError),
    #[error("descriptor chain places a readable buffer after a writable one")]
    Misordered,
    #[error("indirect descriptors are not supported")]
    Indirect,
    #[error("descriptor chain is too long or has a cycle")]
    TooLong,
    #[error("descriptor chain exhausted with {0} bytes unserved")]
    Exhausted(usize),
}

impl QueueError {
    /// True for chain-shape errors the driver caused, as opposed to guest
    /// memory faults.
    pub fn is_malformed_chain(&self) -> bool {
        !matches!(self, QueueError::Memory(_))
    }
}

/// Driver-programmed state of one virtqueue.
#[derive(Debug, Clone)]
pub struct QueueState {
    pub ready: bool,
    /// Ring size. Only power-of-two values are ever accepted from the driver.
    pub num: u32,
    /// Free-running 16-bit counter of consumed available-ring entries.
    pub last_avail_idx: u16,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
    /// When set, QUEUE_NOTIFY is a no-op for this queue; the front end scans
    /// the available ring on its own schedule.
    pub manual_recv: bool,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            ready: false,
            num: MAX_QUEUE_NUM,
            last_avail_idx: 0,
            desc_addr: 0,
            avail_addr: 0,
            used_addr: 0,
            manual_recv: false,
        }
    }
}

impl QueueState {
    /// Returns the queue to its post-reset state.
    ///
    /// `manual_recv` is device wiring rather than driver state and survives.
    pub fn reset(&mut self) {
        *self = Self {
            manual_recv: self.manual_recv,
            ..Self::default()
        };
    }

    fn wrap(&self, counter: u16) -> u64 {
        // num is always a power of two once accepted.
        (counter & (self.num as u16).wrapping_sub(1)) as u64
    }

    /// Fetches the descriptor at `index` from the descriptor table.
    pub fn descriptor(
        &self,
        mem: &GuestMemory,
        index: u16,
    ) -> Result<spec::Descriptor, QueueError> {
        Ok(mem.read_plain(
            self.desc_addr + index as u64 * size_of::<spec::Descriptor>() as u64,
        )?)
    }

    /// Reads the driver's available-ring index.
    pub fn avail_idx(&self, mem: &GuestMemory) -> Result<u16, QueueError> {
        Ok(mem.read_u16(self.avail_addr + spec::AVAIL_OFFSET_IDX)?)
    }

    /// Reads the head descriptor index published at position `counter` of the
    /// available ring.
    pub fn avail_entry(&self, mem: &GuestMemory, counter: u16) -> Result<u16, QueueError> {
        Ok(mem.read_u16(
            self.avail_addr + spec::AVAIL_OFFSET_RING + self.wrap(counter) * spec::AVAIL_ELEMENT_SIZE,
        )?)
    }

    /// Publishes `(head, len)` to the used ring and increments the used index.
    ///
    /// Returns the pre-increment index. The element store is ordered before
    /// the index store; on this simulator's single-threaded host the fence is
    /// trivially satisfied but documents the driver-visible contract.
    pub fn publish_used(&self, mem: &GuestMemory, head: u16, len: u32) -> Result<u16, QueueError> {
        let idx_addr = self.used_addr + spec::USED_OFFSET_IDX;
        let index = mem.read_u16(idx_addr)?;
        mem.write_plain(
            self.used_addr + spec::USED_OFFSET_RING + self.wrap(index) * spec::USED_ELEMENT_SIZE,
            &spec::UsedElement {
                id: (head as u32).into(),
                len: len.into(),
            },
        )?;
        atomic::fence(atomic::Ordering::Release);
        mem.write_u16(idx_addr, index.wrapping_add(1))?;
        Ok(index)
    }

    /// Returns an iterator over the descriptor chain starting at `head`.
    pub fn chain<'a>(&'a self, mem: &'a GuestMemory, head: u16) -> ChainReader<'a> {
        ChainReader {
            queue: self,
            mem,
            index: Some(head),
            num_read: 0,
        }
    }
}

/// One descriptor's buffer, as seen by the device.
#[derive(Debug, Copy, Clone)]
pub struct QueuePayload {
    pub writable: bool,
    pub address: u64,
    pub length: u32,
}

/// Iterator over the descriptors of one chain.
pub struct ChainReader<'a> {
    queue: &'a QueueState,
    mem: &'a GuestMemory,
    index: Option<u16>,
    num_read: u8,
}

impl ChainReader<'_> {
    fn next_descriptor(&mut self) -> Result<Option<QueuePayload>, QueueError> {
        let Some(index) = self.index else {
            return Ok(None);
        };
        let descriptor = self.queue.descriptor(self.mem, index)?;
        let flags = descriptor.flags();
        if flags.indirect() {
            return Err(QueueError::Indirect);
        }

        self.num_read += 1;
        if flags.next() {
            // Limit the chain length; the driver may have written a cycle.
            if self.num_read == 128 {
                return Err(QueueError::TooLong);
            }
            self.index = Some(descriptor.next.get());
        } else {
            self.index = None;
        }

        Ok(Some(QueuePayload {
            writable: flags.write(),
            address: descriptor.address.get(),
            length: descriptor.length.get(),
        }))
    }
}

impl Iterator for ChainReader<'_> {
    type Item = Result<QueuePayload, QueueError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_descriptor().transpose()
    }
}

/// A fully walked descriptor chain.
#[derive(Debug)]
pub struct DescChain {
    payload: Vec<QueuePayload>,
}

impl DescChain {
    /// Walks the chain rooted at `head`, validating that every readable
    /// buffer precedes every writable one.
    pub fn walk(queue: &QueueState, mem: &GuestMemory, head: u16) -> Result<Self, QueueError> {
        let payload = queue.chain(mem, head).collect::<Result<Vec<_>, _>>()?;
        let mut seen_write = false;
        for p in &payload {
            if p.writable {
                seen_write = true;
            } else if seen_write {
                return Err(QueueError::Misordered);
            }
        }
        Ok(Self { payload })
    }

    /// Total length of the device-readable prefix.
    pub fn read_size(&self) -> u32 {
        self.size_of(false)
    }

    /// Total length of the device-writable suffix.
    pub fn write_size(&self) -> u32 {
        self.size_of(true)
    }

    fn size_of(&self, writable: bool) -> u32 {
        self.payload
            .iter()
            .filter(|p| p.writable == writable)
            .fold(0, |acc, p| acc.wrapping_add(p.length))
    }

    /// Copies `buf.len()` bytes out of the readable part of the chain,
    /// skipping the first `offset` payload bytes.
    pub fn read(&self, mem: &GuestMemory, offset: u64, buf: &mut [u8]) -> Result<(), QueueError> {
        let mut skip = offset;
        let mut remaining = buf;
        for payload in self.payload.iter().filter(|p| !p.writable) {
            if remaining.is_empty() {
                break;
            }
            let payload_length = payload.length as u64;
            if skip >= payload_length {
                skip -= payload_length;
                continue;
            }
            let take = ((payload_length - skip) as usize).min(remaining.len());
            let (cur, rest) = remaining.split_at_mut(take);
            mem.read_at(payload.address + skip, cur)?;
            remaining = rest;
            skip = 0;
        }
        if remaining.is_empty() {
            Ok(())
        } else {
            Err(QueueError::Exhausted(remaining.len()))
        }
    }

    /// Copies `buf` into the writable part of the chain, skipping the first
    /// `offset` writable payload bytes.
    pub fn write(&self, mem: &GuestMemory, offset: u64, buf: &[u8]) -> Result<(), QueueError> {
        let mut skip = offset;
        let mut remaining = buf;
        for payload in self.payload.iter().filter(|p| p.writable) {
            if remaining.is_empty() {
                break;
            }
            let payload_length = payload.length as u64;
            if skip >= payload_length {
                skip -= payload_length;
                continue;
            }
            let take = ((payload_length - skip) as usize).min(remaining.len());
            let (cur, rest) = remaining.split_at(take);
            mem.write_at(payload.address + skip, cur)?;
            remaining = rest;
            skip = 0;
        }
        if remaining.is_empty() {
            Ok(())
        } else {
            Err(QueueError::Exhausted(remaining.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::queue::Descriptor;
    use crate::spec::queue::DescriptorFlags;
    use crate::spec::queue::UsedElement;
    use guestmem::testing::SparseRam;

    const DESC: u64 = 0x1000;
    const AVAIL: u64 = 0x2000;
    const USED: u64 = 0x3000;
    const DATA: u64 = 0x10000;

    fn test_queue() -> (GuestMemory, QueueState) {
        let mem = SparseRam::new().into_guest_memory();
        let queue = QueueState {
            ready: true,
            num: 16,
            desc_addr: DESC,
            avail_addr: AVAIL,
            used_addr: USED,
            ..Default::default()
        };
        (mem, queue)
    }

    fn write_desc(mem: &GuestMemory, index: u16, address: u64, length: u32, flags: DescriptorFlags, next: u16) {
        mem.write_plain(
            DESC + index as u64 * 16,
            &Descriptor {
                address: address.into(),
                length: length.into(),
                flags_raw: u16::from(flags).into(),
                next: next.into(),
            },
        )
        .unwrap();
    }

    #[test]
    fn walk_accounts_read_and_write_sizes() {
        let (mem, queue) = test_queue();
        write_desc(&mem, 0, DATA, 16, DescriptorFlags::new().with_next(true), 1);
        write_desc(&mem, 1, DATA + 16, 496, DescriptorFlags::new().with_next(true), 2);
        write_desc(&mem, 2, DATA + 0x1000, 513, DescriptorFlags::new().with_write(true), 0);

        let chain = DescChain::walk(&queue, &mem, 0).unwrap();
        assert_eq!(chain.read_size(), 512);
        assert_eq!(chain.write_size(), 513);
    }

    #[test]
    fn walk_rejects_read_after_write() {
        let (mem, queue) = test_queue();
        write_desc(&mem, 0, DATA, 8, DescriptorFlags::new().with_next(true), 1);
        write_desc(&mem, 1, DATA + 8, 8, DescriptorFlags::new().with_write(true).with_next(true), 2);
        write_desc(&mem, 2, DATA + 16, 8, DescriptorFlags::new(), 0);

        assert!(matches!(
            DescChain::walk(&queue, &mem, 0),
            Err(QueueError::Misordered)
        ));
    }

    #[test]
    fn walk_rejects_indirect() {
        let (mem, queue) = test_queue();
        write_desc(&mem, 0, DATA, 16, DescriptorFlags::new().with_indirect(true), 0);
        assert!(matches!(
            DescChain::walk(&queue, &mem, 0),
            Err(QueueError::Indirect)
        ));
    }

    #[test]
    fn walk_rejects_descriptor_cycle() {
        let (mem, queue) = test_queue();
        write_desc(&mem, 0, DATA, 16, DescriptorFlags::new().with_next(true), 1);
        write_desc(&mem, 1, DATA, 16, DescriptorFlags::new().with_next(true), 0);
        assert!(matches!(
            DescChain::walk(&queue, &mem, 0),
            Err(QueueError::TooLong)
        ));
    }

    #[test]
    fn chain_copy_with_offset_spans_descriptors() {
        let (mem, queue) = test_queue();
        write_desc(&mem, 0, DATA, 16, DescriptorFlags::new().with_next(true), 1);
        write_desc(&mem, 1, DATA + 0x100, 32, DescriptorFlags::new(), 0);
        let bytes: Vec<u8> = (0u8..48).collect();
        mem.write_at(DATA, &bytes[..16]).unwrap();
        mem.write_at(DATA + 0x100, &bytes[16..]).unwrap();

        let chain = DescChain::walk(&queue, &mem, 0).unwrap();
        let mut out = [0; 24];
        // Starts mid-first-descriptor and ends mid-second.
        chain.read(&mem, 8, &mut out).unwrap();
        assert_eq!(&out[..], &bytes[8..32]);
    }

    #[test]
    fn chain_write_without_writable_descriptor_is_exhausted() {
        let (mem, queue) = test_queue();
        write_desc(&mem, 0, DATA, 16, DescriptorFlags::new(), 0);
        let chain = DescChain::walk(&queue, &mem, 0).unwrap();
        assert!(matches!(
            chain.write(&mem, 0, &[0u8; 1]),
            Err(QueueError::Exhausted(1))
        ));
    }

    #[test]
    fn publish_used_writes_element_then_index() {
        let (mem, queue) = test_queue();
        mem.write_u16(USED + 2, 7).unwrap();

        let old = queue.publish_used(&mem, 3, 513).unwrap();
        assert_eq!(old, 7);
        assert_eq!(mem.read_u16(USED + 2).unwrap(), 8);
        let element: UsedElement = mem.read_plain(USED + 4 + (7 % 16) * 8).unwrap();
        assert_eq!(element.id.get(), 3);
        assert_eq!(element.len.get(), 513);
    }

    #[test]
    fn used_ring_wraps_at_num() {
        let (mem, queue) = test_queue();
        mem.write_u16(USED + 2, 17).unwrap();
        queue.publish_used(&mem, 5, 1).unwrap();
        // Slot 17 % 16 == 1.
        let element: UsedElement = mem.read_plain(USED + 4 + 8).unwrap();
        assert_eq!(element.id.get(), 5);
    }
}
