// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Run a virtio device over MMIO.

use crate::queue::DescChain;
use crate::queue::QueueError;
use crate::queue::QueueState;
use crate::spec::mmio::Register;
use crate::spec::mmio::CONFIG_OFFSET;
use crate::spec::mmio::REGISTERS_SIZE;
use crate::spec::*;
use crate::DeviceTraits;
use crate::RecvResult;
use crate::VirtioDevice;
use guestmem::GuestMemory;
use sim_device::io::IoError;
use sim_device::io::IoResult;
use sim_device::MmioDevice;
use simcore::line_interrupt::LineInterrupt;

/// Transport-independent virtio device state: the register file, feature
/// negotiation, the device-status FSM, queue configuration, and the config
/// space bytes.
///
/// The core exclusively owns the queue-state array and the config space; the
/// engine in [`crate::queue`] is a pure algorithm over this state plus the
/// guest memory capability.
#[derive(Debug)]
pub struct VirtioCore {
    mem: GuestMemory,
    interrupt: LineInterrupt,

    device_id: u16,
    vendor_id: u32,
    device_features: u32,
    device_features_sel: u32,
    driver_features: [u32; 2],
    driver_features_sel: u32,
    status: u32,
    int_status: u32,
    queue_sel: u32,
    queues: [QueueState; MAX_QUEUE],

    config_space: [u8; MAX_CONFIG_SPACE_SIZE],
    config_space_size: usize,
}

impl VirtioCore {
    pub fn new(traits: DeviceTraits, mem: GuestMemory, interrupt: LineInterrupt) -> Self {
        debug_assert!(traits.config_space_size % 4 == 0);
        debug_assert!(traits.config_space_size <= MAX_CONFIG_SPACE_SIZE);
        Self {
            mem,
            interrupt,
            device_id: traits.device_id,
            vendor_id: VIRTIO_MMIO_VENDOR_ID,
            device_features: traits.device_features,
            device_features_sel: 0,
            driver_features: [0; 2],
            driver_features_sel: 0,
            status: 0,
            int_status: 0,
            queue_sel: 0,
            queues: std::array::from_fn(|_| QueueState::default()),
            config_space: [0; MAX_CONFIG_SPACE_SIZE],
            config_space_size: traits.config_space_size.min(MAX_CONFIG_SPACE_SIZE),
        }
    }

    /// Returns the driver-visible state to its initial value and lowers the
    /// interrupt line.
    pub fn reset(&mut self) {
        self.status = 0;
        self.queue_sel = 0;
        self.device_features_sel = 0;
        self.driver_features = [0; 2];
        self.driver_features_sel = 0;
        for queue in &mut self.queues {
            queue.reset();
        }
        self.update_interrupt(false, !0);
    }

    /// The driver-programmed state of queue `queue_idx`.
    pub fn queue(&self, queue_idx: u32) -> &QueueState {
        &self.queues[queue_idx as usize]
    }

    /// Marks queue `queue_idx` as pulled by the front end: QUEUE_NOTIFY
    /// becomes a no-op for it.
    pub fn set_manual_recv(&mut self, queue_idx: u32, manual: bool) {
        self.queues[queue_idx as usize].manual_recv = manual;
    }

    /// The device config space contents.
    pub fn config_space(&self) -> &[u8] {
        &self.config_space[..self.config_space_size]
    }

    pub(crate) fn config_space_mut(&mut self) -> &mut [u8] {
        &mut self.config_space[..self.config_space_size]
    }

    fn update_interrupt(&mut self, set: bool, bits: u32) {
        if set {
            self.int_status |= bits;
        } else {
            self.int_status &= !bits;
        }
        self.interrupt.set_level(self.int_status != 0);
    }

    /// Raises the config-change interrupt.
    pub fn notify_config_change(&mut self) {
        self.update_interrupt(true, VIRTIO_MMIO_INTERRUPT_STATUS_CONFIG_CHANGE);
    }

    /// Streams `buf.len()` bytes out of the readable part of the chain at
    /// `head`, skipping `offset` payload bytes.
    pub fn copy_from_queue(
        &self,
        queue_idx: u32,
        head: u16,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), QueueError> {
        let chain = DescChain::walk(&self.queues[queue_idx as usize], &self.mem, head)?;
        chain.read(&self.mem, offset, buf)
    }

    /// Streams `buf` into the writable part of the chain at `head`, skipping
    /// `offset` writable payload bytes.
    pub fn copy_to_queue(
        &self,
        queue_idx: u32,
        head: u16,
        offset: u64,
        buf: &[u8],
    ) -> Result<(), QueueError> {
        let chain = DescChain::walk(&self.queues[queue_idx as usize], &self.mem, head)?;
        chain.write(&self.mem, offset, buf)
    }

    /// Publishes `(head, len)` to the used ring of queue `queue_idx`, sets the
    /// used-buffer interrupt bit, and raises the line.
    ///
    /// If the driver reset the queue while the request was in flight the
    /// publication is dropped; the ring no longer belongs to the device.
    pub fn consume_desc(&mut self, queue_idx: u32, head: u16, len: u32) {
        let queue = &self.queues[queue_idx as usize];
        if !queue.ready {
            tracing::debug!(queue_idx, head, "dropping publication for non-ready queue");
            return;
        }
        match queue.publish_used(&self.mem, head, len) {
            Ok(_) => self.update_interrupt(true, VIRTIO_MMIO_INTERRUPT_STATUS_USED_BUFFER),
            Err(err) => {
                tracing::error!(
                    queue_idx,
                    head,
                    error = &err as &dyn std::error::Error,
                    "failed to publish used element"
                );
            }
        }
    }

    /// Scans the available ring of queue `queue_idx`, delivering each new head
    /// to `device` until the ring is drained or the device pushes back.
    pub fn queue_notify(&mut self, device: &mut dyn VirtioDevice, queue_idx: u32) {
        let q = queue_idx as usize;
        if q >= MAX_QUEUE || self.queues[q].manual_recv {
            return;
        }
        let avail_idx = match self.queues[q].avail_idx(&self.mem) {
            Ok(idx) => idx,
            Err(err) => {
                tracing::error!(
                    queue_idx,
                    error = &err as &dyn std::error::Error,
                    "failed to read available index"
                );
                return;
            }
        };
        while self.queues[q].last_avail_idx != avail_idx {
            let counter = self.queues[q].last_avail_idx;
            let head = match self.queues[q].avail_entry(&self.mem, counter) {
                Ok(head) => head,
                Err(err) => {
                    tracing::error!(
                        queue_idx,
                        error = &err as &dyn std::error::Error,
                        "failed to read available ring"
                    );
                    return;
                }
            };
            match DescChain::walk(&self.queues[q], &self.mem, head) {
                Ok(chain) => {
                    let (read_size, write_size) = (chain.read_size(), chain.write_size());
                    tracing::debug!(queue_idx, head, read_size, write_size, "request");
                    match device.recv_request(self, queue_idx, head, read_size, write_size) {
                        RecvResult::Handled => {}
                        RecvResult::Busy => return,
                    }
                }
                Err(err) if err.is_malformed_chain() => {
                    // The head is unusable; skip it so the ring keeps moving.
                    tracing::error!(
                        queue_idx,
                        head,
                        error = &err as &dyn std::error::Error,
                        "skipping malformed descriptor chain"
                    );
                }
                Err(err) => {
                    tracing::error!(
                        queue_idx,
                        head,
                        error = &err as &dyn std::error::Error,
                        "queue memory fault"
                    );
                    return;
                }
            }
            self.queues[q].last_avail_idx = self.queues[q].last_avail_idx.wrapping_add(1);
        }
    }

    fn read_config(&self, offset: u64, len: usize) -> u32 {
        let Ok(offset) = usize::try_from(offset) else {
            return 0;
        };
        let space = &self.config_space;
        match len {
            1 if offset < self.config_space_size => space[offset].into(),
            2 if offset + 2 <= self.config_space_size => {
                u16::from_le_bytes(space[offset..offset + 2].try_into().unwrap()).into()
            }
            4 if offset + 4 <= self.config_space_size => {
                u32::from_le_bytes(space[offset..offset + 4].try_into().unwrap())
            }
            _ => 0,
        }
    }

    /// Returns true if the store landed inside the config space.
    fn write_config(&mut self, offset: u64, val: u32, len: usize) -> bool {
        let Ok(offset) = usize::try_from(offset) else {
            return false;
        };
        match len {
            1 if offset < self.config_space_size => {
                self.config_space[offset] = val as u8;
            }
            2 if offset + 2 <= self.config_space_size => {
                self.config_space[offset..offset + 2].copy_from_slice(&(val as u16).to_le_bytes());
            }
            4 if offset + 4 <= self.config_space_size => {
                self.config_space[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
            }
            _ => return false,
        }
        true
    }

    fn read_reg_u32(&self, offset: u64) -> u32 {
        let queue = &self.queues[self.queue_sel as usize];
        match Register(offset) {
            Register::MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            Register::VERSION => VIRTIO_MMIO_VERSION,
            Register::DEVICE_ID => self.device_id.into(),
            Register::VENDOR_ID => self.vendor_id,
            Register::DEVICE_FEATURES => match self.device_features_sel {
                0 => self.device_features,
                1 => VIRTIO_F_VERSION_1,
                _ => 0,
            },
            Register::DEVICE_FEATURES_SEL => self.device_features_sel,
            Register::QUEUE_SEL => self.queue_sel,
            Register::QUEUE_NUM_MAX => MAX_QUEUE_NUM,
            Register::QUEUE_NUM => queue.num,
            Register::QUEUE_READY => queue.ready.into(),
            Register::QUEUE_DESC_LOW => queue.desc_addr as u32,
            Register::QUEUE_DESC_HIGH => (queue.desc_addr >> 32) as u32,
            Register::QUEUE_AVAIL_LOW => queue.avail_addr as u32,
            Register::QUEUE_AVAIL_HIGH => (queue.avail_addr >> 32) as u32,
            Register::QUEUE_USED_LOW => queue.used_addr as u32,
            Register::QUEUE_USED_HIGH => (queue.used_addr >> 32) as u32,
            Register::INTERRUPT_STATUS => self.int_status,
            Register::STATUS => self.status,
            Register::CONFIG_GENERATION => 0,
            _ => 0,
        }
    }
}

fn set_low32(addr: &mut u64, val: u32) {
    *addr = (*addr & !0xffff_ffff) | val as u64;
}

fn set_high32(addr: &mut u64, val: u32) {
    *addr = (*addr & 0xffff_ffff) | ((val as u64) << 32);
}

/// A virtio device bound to the MMIO transport.
pub struct VirtioMmioDevice<D: VirtioDevice> {
    core: VirtioCore,
    device: D,
}

impl<D: VirtioDevice> VirtioMmioDevice<D> {
    pub fn new(device: D, mem: GuestMemory, interrupt: LineInterrupt) -> Self {
        let mut core = VirtioCore::new(device.traits(), mem, interrupt);
        device.init_config(core.config_space_mut());
        Self { core, device }
    }

    /// Splits the transport into the core and the front end, for delivering
    /// backend completions into the device.
    pub fn split(&mut self) -> (&mut VirtioCore, &mut D) {
        (&mut self.core, &mut self.device)
    }

    pub fn core(&self) -> &VirtioCore {
        &self.core
    }

    /// Performs a word-width register read at `offset` from the window base.
    pub fn read_u32(&self, offset: u64) -> u32 {
        if offset >= CONFIG_OFFSET {
            self.core.read_config(offset - CONFIG_OFFSET, 4)
        } else {
            self.core.read_reg_u32(offset)
        }
    }

    /// Performs a word-width register write at `offset` from the window base.
    pub fn write_u32(&mut self, offset: u64, val: u32) {
        if offset >= CONFIG_OFFSET {
            if self.core.write_config(offset - CONFIG_OFFSET, val, 4) {
                self.device.config_write(&mut self.core);
            }
            return;
        }
        let queue_sel = self.core.queue_sel as usize;
        match Register(offset) {
            Register::DEVICE_FEATURES_SEL => self.core.device_features_sel = val,
            Register::DRIVER_FEATURES => {
                let bank = self.core.driver_features_sel as usize;
                if bank < self.core.driver_features.len() {
                    self.core.driver_features[bank] = val;
                }
            }
            Register::DRIVER_FEATURES_SEL => self.core.driver_features_sel = val,
            Register::QUEUE_SEL => {
                if (val as usize) < MAX_QUEUE {
                    self.core.queue_sel = val;
                }
            }
            Register::QUEUE_NUM => {
                if val.is_power_of_two() && val <= MAX_QUEUE_NUM {
                    self.core.queues[queue_sel].num = val;
                }
            }
            Register::QUEUE_READY => {
                self.core.queues[queue_sel].ready = val & 1 != 0;
            }
            Register::QUEUE_DESC_LOW => set_low32(&mut self.core.queues[queue_sel].desc_addr, val),
            Register::QUEUE_DESC_HIGH => set_high32(&mut self.core.queues[queue_sel].desc_addr, val),
            Register::QUEUE_AVAIL_LOW => set_low32(&mut self.core.queues[queue_sel].avail_addr, val),
            Register::QUEUE_AVAIL_HIGH => {
                set_high32(&mut self.core.queues[queue_sel].avail_addr, val)
            }
            Register::QUEUE_USED_LOW => set_low32(&mut self.core.queues[queue_sel].used_addr, val),
            Register::QUEUE_USED_HIGH => set_high32(&mut self.core.queues[queue_sel].used_addr, val),
            Register::QUEUE_NOTIFY => {
                if (val as usize) < MAX_QUEUE {
                    self.core.queue_notify(&mut self.device, val);
                }
            }
            Register::INTERRUPT_ACK => self.core.update_interrupt(false, val),
            Register::STATUS => {
                self.core.status = val;
                if val == 0 {
                    self.core.reset();
                }
            }
            _ => {}
        }
    }
}

impl<D: VirtioDevice> MmioDevice for VirtioMmioDevice<D> {
    fn load(&mut self, addr: u64, data: &mut [u8]) -> IoResult {
        if addr >= REGISTERS_SIZE {
            return IoResult::Err(IoError::OutsideWindow);
        }
        match data.len() {
            // Sub-word accesses are not decoded by this transport; they read
            // as zero.
            1 | 2 => data.fill(0),
            4 => data.copy_from_slice(&self.read_u32(addr).to_le_bytes()),
            8 => {
                let low = self.read_u32(addr) as u64;
                let high = self.read_u32(addr + 4) as u64;
                data.copy_from_slice(&(low | high << 32).to_le_bytes());
            }
            _ => return IoResult::Err(IoError::InvalidAccessSize),
        }
        IoResult::Ok
    }

    fn store(&mut self, addr: u64, data: &[u8]) -> IoResult {
        if addr >= REGISTERS_SIZE {
            return IoResult::Err(IoError::OutsideWindow);
        }
        match data.len() {
            // Sub-word stores are dropped, matching the width policy above.
            1 | 2 => {}
            4 => self.write_u32(addr, u32::from_le_bytes(data.try_into().unwrap())),
            8 => {
                let val = u64::from_le_bytes(data.try_into().unwrap());
                self.write_u32(addr, val as u32);
                self.write_u32(addr + 4, (val >> 32) as u32);
            }
            _ => return IoResult::Err(IoError::InvalidAccessSize),
        }
        IoResult::Ok
    }

    fn window_len(&self) -> u64 {
        REGISTERS_SIZE
    }
}
