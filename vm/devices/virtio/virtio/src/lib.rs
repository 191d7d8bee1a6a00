// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core virtio device infrastructure.
//!
//! The transport ([`transport::mmio`]) owns the guest-visible register file
//! and the per-queue state; the engine ([`queue`]) walks descriptor chains in
//! guest memory; a device front end implements [`VirtioDevice`] and consumes
//! requests one available-ring head at a time.

#![forbid(unsafe_code)]

pub mod queue;
pub mod spec;
pub mod transport;

pub use transport::mmio::VirtioCore;
pub use transport::mmio::VirtioMmioDevice;

/// Fixed per-device-type properties consumed by the transport.
#[derive(Debug, Copy, Clone)]
pub struct DeviceTraits {
    /// Virtio device type (2 = block, 16 = net, ...).
    pub device_id: u16,
    /// Device feature bits 0..31. Bank 1 is owned by the transport, which
    /// always offers VIRTIO_F_VERSION_1.
    pub device_features: u32,
    /// Bytes of device config space, a multiple of 4, at most
    /// [`spec::MAX_CONFIG_SPACE_SIZE`].
    pub config_space_size: usize,
}

/// Outcome of a [`VirtioDevice::recv_request`] delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecvResult {
    /// The head was accepted and the engine advances past it. The front end
    /// may defer the used-ring publication.
    Handled,
    /// The device cannot take the head now. The scan stops without advancing;
    /// the device re-runs the notify once it frees up.
    Busy,
}

/// A device front end fed by the virtqueue engine.
pub trait VirtioDevice: Send {
    /// Fixed properties of this device.
    fn traits(&self) -> DeviceTraits;

    /// Populates the initial config space contents.
    fn init_config(&self, config: &mut [u8]) {
        let _ = config;
    }

    /// Delivers one available-ring head.
    ///
    /// `read_size` and `write_size` are the total lengths of the chain's
    /// device-readable prefix and device-writable suffix. The front end copies
    /// request data through `core` and eventually publishes a used entry via
    /// [`VirtioCore::consume_desc`], either before returning or from a later
    /// completion.
    fn recv_request(
        &mut self,
        core: &mut VirtioCore,
        queue_idx: u32,
        head: u16,
        read_size: u32,
        write_size: u32,
    ) -> RecvResult;

    /// Called after the driver stores to the device config space.
    fn config_write(&mut self, core: &mut VirtioCore) {
        let _ = core;
    }
}
