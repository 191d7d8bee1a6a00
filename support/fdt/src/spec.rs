// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire format of a flattened DeviceTree blob.

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Big-endian u32, as all FDT cells are stored.
pub type U32b = zerocopy::U32<zerocopy::BigEndian>;
/// Big-endian u64.
pub type U64b = zerocopy::U64<zerocopy::BigEndian>;

pub const MAGIC: u32 = 0xd00dfeed;
pub const CURRENT_VERSION: u32 = 17;
pub const COMPAT_VERSION: u32 = 16;

// Structure block tokens.
pub const BEGIN_NODE: u32 = 1;
pub const END_NODE: u32 = 2;
pub const PROP: u32 = 3;
pub const NOP: u32 = 4;
pub const END: u32 = 9;

/// Cell counts assumed for nodes whose parent does not specify
/// `#address-cells` / `#size-cells`.
pub const DEFAULT_ADDRESS_CELLS: u32 = 2;
pub const DEFAULT_SIZE_CELLS: u32 = 1;

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Header {
    pub magic: U32b,
    pub totalsize: U32b,
    pub off_dt_struct: U32b,
    pub off_dt_strings: U32b,
    pub off_mem_rsvmap: U32b,
    pub version: U32b,
    pub last_comp_version: U32b,
    pub boot_cpuid_phys: U32b,
    pub size_dt_strings: U32b,
    pub size_dt_struct: U32b,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReserveEntry {
    pub address: U64b,
    pub size: U64b,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PropHeader {
    pub len: U32b,
    pub nameoff: U32b,
}
