// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Constants defined by the virtio spec.

pub use packed_nums::*;

#[allow(non_camel_case_types)]
mod packed_nums {
    pub type u16_le = zerocopy::U16<zerocopy::LittleEndian>;
    pub type u32_le = zerocopy::U32<zerocopy::LittleEndian>;
    pub type u64_le = zerocopy::U64<zerocopy::LittleEndian>;
}

/// "virt", as read back from the MAGIC_VALUE register.
pub const VIRTIO_MMIO_MAGIC: u32 = u32::from_le_bytes(*b"virt");

/// The modern (version 2) MMIO transport.
pub const VIRTIO_MMIO_VERSION: u32 = 2;

/// Vendor ID exposed by this transport.
pub const VIRTIO_MMIO_VENDOR_ID: u32 = 0xffff;

// Device features - second bank
pub const VIRTIO_F_VERSION_1: u32 = 1;

// Device status
pub const VIRTIO_ACKNOWLEDGE: u32 = 1;
pub const VIRTIO_DRIVER: u32 = 2;
pub const VIRTIO_DRIVER_OK: u32 = 4;
pub const VIRTIO_FEATURES_OK: u32 = 8;
pub const VIRTIO_DEVICE_NEEDS_RESET: u32 = 0x40;
pub const VIRTIO_FAILED: u32 = 0x80;

// Interrupt status flags
pub const VIRTIO_MMIO_INTERRUPT_STATUS_USED_BUFFER: u32 = 1;
pub const VIRTIO_MMIO_INTERRUPT_STATUS_CONFIG_CHANGE: u32 = 2;

/// Queues addressable through QUEUE_SEL.
pub const MAX_QUEUE: usize = 8;

/// The ring size reported by QUEUE_NUM_MAX.
pub const MAX_QUEUE_NUM: u32 = 16;

/// Device config space limit; accesses beyond the device's config space size
/// read zero.
pub const MAX_CONFIG_SPACE_SIZE: usize = 256;

/// MMIO register map (offsets from the Linux kernel).
pub mod mmio {
    use open_enum::open_enum;

    /// The size of the device register window.
    pub const REGISTERS_SIZE: u64 = 0x1000;

    /// Start of the device-specific config space within the window.
    pub const CONFIG_OFFSET: u64 = 0x100;

    open_enum! {
        /// Word-width register assignments below [`CONFIG_OFFSET`].
        pub enum Register: u64 {
            MAGIC_VALUE         = 0x000,
            VERSION             = 0x004,
            DEVICE_ID           = 0x008,
            VENDOR_ID           = 0x00c,
            DEVICE_FEATURES     = 0x010,
            DEVICE_FEATURES_SEL = 0x014,
            DRIVER_FEATURES     = 0x020,
            DRIVER_FEATURES_SEL = 0x024,
            QUEUE_SEL           = 0x030,
            QUEUE_NUM_MAX       = 0x034,
            QUEUE_NUM           = 0x038,
            QUEUE_READY         = 0x044,
            QUEUE_NOTIFY        = 0x050,
            INTERRUPT_STATUS    = 0x060,
            INTERRUPT_ACK       = 0x064,
            STATUS              = 0x070,
            QUEUE_DESC_LOW      = 0x080,
            QUEUE_DESC_HIGH     = 0x084,
            QUEUE_AVAIL_LOW     = 0x090,
            QUEUE_AVAIL_HIGH    = 0x094,
            QUEUE_USED_LOW      = 0x0a0,
            QUEUE_USED_HIGH     = 0x0a4,
            CONFIG_GENERATION   = 0x0fc,
        }
    }
}

/// Virtio split-queue definitions.
pub mod queue {
    use super::u16_le;
    use super::u32_le;
    use super::u64_le;
    use bitfield_struct::bitfield;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    #[repr(C)]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct Descriptor {
        pub address: u64_le,
        pub length: u32_le,
        pub flags_raw: u16_le,
        pub next: u16_le,
    }

    impl Descriptor {
        pub fn flags(&self) -> DescriptorFlags {
            self.flags_raw.get().into()
        }
    }

    #[bitfield(u16)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
    pub struct DescriptorFlags {
        pub next: bool,
        pub write: bool,
        pub indirect: bool,
        #[bits(13)]
        _reserved: u16,
    }

    /*
    struct virtq_avail {
        le16 flags;
        le16 idx;
        le16 ring[ /* Queue Size */ ];
    }
    */
    pub const AVAIL_OFFSET_FLAGS: u64 = 0;
    pub const AVAIL_OFFSET_IDX: u64 = 2;
    pub const AVAIL_OFFSET_RING: u64 = 4;
    pub const AVAIL_ELEMENT_SIZE: u64 = size_of::<u16>() as u64;

    /*
    struct virtq_used {
        le16 flags;
        le16 idx;
        struct virtq_used_elem ring[ /* Queue Size */];
    };
    */
    pub const USED_OFFSET_FLAGS: u64 = 0;
    pub const USED_OFFSET_IDX: u64 = 2;
    pub const USED_OFFSET_RING: u64 = 4;
    pub const USED_ELEMENT_SIZE: u64 = size_of::<UsedElement>() as u64;

    #[repr(C)]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct UsedElement {
        pub id: u32_le,
        pub len: u32_le,
    }
}
