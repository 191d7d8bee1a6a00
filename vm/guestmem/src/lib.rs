// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest memory access for device models.
//!
//! Devices never hold host pointers into guest RAM. All access goes through
//! [`GuestMemory`], a cheaply clonable capability wrapping the simulator's
//! debug MMU, one fixed-width little-endian access at a time. Bulk transfers
//! are split at page boundaries; a transfer that crosses a page is not atomic.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod testing;

use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// The guest page size used to split bulk transfers.
pub const PAGE_SIZE: u64 = 4096;

const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// A failed guest memory access.
///
/// The debug MMU is expected to satisfy any address the driver programs, so
/// in practice this surfaces only for backings with holes. Device models
/// treat it as terminating the current operation, never the simulator.
#[derive(Debug, Error)]
#[error("guest memory fault at {addr:#x}")]
pub struct GuestMemoryError {
    /// The faulting guest physical address.
    pub addr: u64,
}

impl GuestMemoryError {
    /// Returns a fault at `addr`.
    pub fn new(addr: u64) -> Self {
        Self { addr }
    }
}

/// The simulator's debug-mode MMU: single little-endian accesses at guest
/// physical addresses, bypassing address translation and access faults.
pub trait MmuAccess: Send + Sync {
    /// Loads a byte at `pa`.
    fn load_u8(&self, pa: u64) -> Result<u8, GuestMemoryError>;
    /// Loads a little-endian halfword at `pa`.
    fn load_u16(&self, pa: u64) -> Result<u16, GuestMemoryError>;
    /// Loads a little-endian word at `pa`.
    fn load_u32(&self, pa: u64) -> Result<u32, GuestMemoryError>;
    /// Loads a little-endian doubleword at `pa`.
    fn load_u64(&self, pa: u64) -> Result<u64, GuestMemoryError>;
    /// Stores a byte at `pa`.
    fn store_u8(&self, pa: u64, val: u8) -> Result<(), GuestMemoryError>;
    /// Stores a little-endian halfword at `pa`.
    fn store_u16(&self, pa: u64, val: u16) -> Result<(), GuestMemoryError>;
    /// Stores a little-endian word at `pa`.
    fn store_u32(&self, pa: u64, val: u32) -> Result<(), GuestMemoryError>;
    /// Stores a little-endian doubleword at `pa`.
    fn store_u64(&self, pa: u64, val: u64) -> Result<(), GuestMemoryError>;
}

/// A capability granting access to guest memory.
#[derive(Clone)]
pub struct GuestMemory {
    backing: Arc<dyn MmuAccess>,
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory").finish()
    }
}

impl GuestMemory {
    /// Wraps a debug MMU in a guest memory capability.
    pub fn new(backing: Arc<dyn MmuAccess>) -> Self {
        Self { backing }
    }

    /// Loads a byte at `pa`.
    pub fn read_u8(&self, pa: u64) -> Result<u8, GuestMemoryError> {
        self.backing.load_u8(pa)
    }

    /// Loads a little-endian halfword at `pa`.
    pub fn read_u16(&self, pa: u64) -> Result<u16, GuestMemoryError> {
        self.backing.load_u16(pa)
    }

    /// Loads a little-endian word at `pa`.
    pub fn read_u32(&self, pa: u64) -> Result<u32, GuestMemoryError> {
        self.backing.load_u32(pa)
    }

    /// Loads a little-endian doubleword at `pa`.
    pub fn read_u64(&self, pa: u64) -> Result<u64, GuestMemoryError> {
        self.backing.load_u64(pa)
    }

    /// Stores a byte at `pa`.
    pub fn write_u8(&self, pa: u64, val: u8) -> Result<(), GuestMemoryError> {
        self.backing.store_u8(pa, val)
    }

    /// Stores a little-endian halfword at `pa`.
    pub fn write_u16(&self, pa: u64, val: u16) -> Result<(), GuestMemoryError> {
        self.backing.store_u16(pa, val)
    }

    /// Stores a little-endian word at `pa`.
    pub fn write_u32(&self, pa: u64, val: u32) -> Result<(), GuestMemoryError> {
        self.backing.store_u32(pa, val)
    }

    /// Stores a little-endian doubleword at `pa`.
    pub fn write_u64(&self, pa: u64, val: u64) -> Result<(), GuestMemoryError> {
        self.backing.store_u64(pa, val)
    }

    /// Reads `buf.len()` bytes starting at `addr`, splitting the transfer at
    /// page boundaries.
    pub fn read_at(&self, addr: u64, buf: &mut [u8]) -> Result<(), GuestMemoryError> {
        let mut addr = addr;
        let mut buf = buf;
        while !buf.is_empty() {
            let len = intrapage_len(addr, buf.len());
            let (cur, rest) = buf.split_at_mut(len);
            for (i, byte) in cur.iter_mut().enumerate() {
                *byte = self.backing.load_u8(addr + i as u64)?;
            }
            addr += len as u64;
            buf = rest;
        }
        Ok(())
    }

    /// Writes `buf` starting at `addr`, splitting the transfer at page
    /// boundaries.
    pub fn write_at(&self, addr: u64, buf: &[u8]) -> Result<(), GuestMemoryError> {
        let mut addr = addr;
        let mut buf = buf;
        while !buf.is_empty() {
            let len = intrapage_len(addr, buf.len());
            let (cur, rest) = buf.split_at(len);
            for (i, byte) in cur.iter().enumerate() {
                self.backing.store_u8(addr + i as u64, *byte)?;
            }
            addr += len as u64;
            buf = rest;
        }
        Ok(())
    }

    /// Reads a plain (fixed-layout) structure at `addr`.
    pub fn read_plain<T: FromBytes + IntoBytes>(&self, addr: u64) -> Result<T, GuestMemoryError> {
        let mut val = T::new_zeroed();
        self.read_at(addr, val.as_mut_bytes())?;
        Ok(val)
    }

    /// Writes a plain (fixed-layout) structure at `addr`.
    pub fn write_plain<T: IntoBytes + Immutable>(
        &self,
        addr: u64,
        val: &T,
    ) -> Result<(), GuestMemoryError> {
        self.write_at(addr, val.as_bytes())
    }
}

fn intrapage_len(addr: u64, remaining: usize) -> usize {
    remaining.min((PAGE_SIZE - (addr & PAGE_MASK)) as usize)
}

#[cfg(test)]
mod tests {
    use super::testing::SparseRam;
    use super::*;

    #[test]
    fn typed_access_round_trip() {
        let mem = SparseRam::new().into_guest_memory();
        mem.write_u64(0x1000, 0x0123_4567_89ab_cdef).unwrap();
        assert_eq!(mem.read_u64(0x1000).unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(mem.read_u32(0x1000).unwrap(), 0x89ab_cdef);
        assert_eq!(mem.read_u16(0x1006).unwrap(), 0x0123);
        assert_eq!(mem.read_u8(0x1007).unwrap(), 0x01);
    }

    #[test]
    fn bulk_copy_crosses_pages() {
        let mem = SparseRam::new().into_guest_memory();
        let data: Vec<u8> = (0..=255).cycle().take(3 * PAGE_SIZE as usize).map(|v| v as u8).collect();
        // Deliberately misaligned so every page boundary splits the copy.
        let base = PAGE_SIZE - 7;
        mem.write_at(base, &data).unwrap();
        let mut out = vec![0; data.len()];
        mem.read_at(base, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn unbacked_reads_are_zero() {
        let mem = SparseRam::new().into_guest_memory();
        assert_eq!(mem.read_u32(0xdead_0000).unwrap(), 0);
    }
}
