// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Defines the [`BlockBackend`] trait, the interface between block-device
//! front ends (such as the virtio-blk emulator) and backing stores.
//!
//! Backing store implementations live in their own crates; the in-tree file
//! store is `block_file`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use thiserror::Error;

/// The fixed sector size of the block layer.
pub const SECTOR_SIZE: u32 = 512;

/// A block operation error.
#[derive(Debug, Error)]
pub enum BlockError {
    /// The sector range extends beyond the end of the store.
    #[error("sector range out of bounds")]
    OutOfRange,
    /// The store is read-only.
    #[error("attempt to write to read-only store")]
    ReadOnly,
    /// The underlying host I/O failed.
    #[error("i/o error")]
    Io(#[from] std::io::Error),
}

/// How a backend disposed of a request.
///
/// Backends are free to complete synchronously. A backend returning
/// [`Submitted`](IoSubmission::Submitted) delivers its result later through
/// the front end's completion entry point, marshalled onto the simulator
/// thread by the embedder; the front end suspends further descriptor
/// processing until then.
#[derive(Debug)]
#[must_use]
pub enum IoSubmission {
    /// The request finished within the call.
    Complete(Result<(), BlockError>),
    /// The request is in flight; a completion will follow.
    Submitted,
}

/// Sector-addressed storage backing a block device front end.
pub trait BlockBackend: Send {
    /// Returns the store's capacity in sectors.
    fn sector_count(&self) -> u64;

    /// Reads `buf.len() / 512` sectors starting at `sector` into `buf`.
    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> IoSubmission;

    /// Writes the sectors in `buf` starting at `sector`.
    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> IoSubmission;

    /// Commits previously written data to durable storage.
    fn flush(&mut self) -> IoSubmission;
}
