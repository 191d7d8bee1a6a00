// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! File-backed block store.
//!
//! All requests complete synchronously. Three modes are supported:
//!
//! - `ReadWrite`: reads and writes pass through to the backing file.
//! - `ReadOnly`: writes fail with [`BlockError::ReadOnly`].
//! - `Snapshot`: copy-on-write. Writes land in an in-memory overlay keyed by
//!   sector index; reads prefer the overlay and fall through to the file; the
//!   file is never modified.

#![forbid(unsafe_code)]

use block_backend::BlockBackend;
use block_backend::BlockError;
use block_backend::IoSubmission;
use block_backend::SECTOR_SIZE;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::FileExt;
use std::path::Path;

const SECTOR_BYTES: usize = SECTOR_SIZE as usize;

/// Write disposition of a [`FileBlock`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileBlockMode {
    ReadOnly,
    ReadWrite,
    Snapshot,
}

impl FileBlockMode {
    /// Parses a `mode=` device argument. Unrecognized values fall back to
    /// read-write.
    pub fn from_arg(arg: &str) -> Self {
        match arg {
            "ro" => FileBlockMode::ReadOnly,
            "snapshot" => FileBlockMode::Snapshot,
            _ => FileBlockMode::ReadWrite,
        }
    }
}

/// A sector-addressed view of a host file.
pub struct FileBlock {
    file: fs::File,
    sector_count: u64,
    mode: FileBlockMode,
    overlay: BTreeMap<u64, [u8; SECTOR_BYTES]>,
}

impl std::fmt::Debug for FileBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBlock")
            .field("sector_count", &self.sector_count)
            .field("mode", &self.mode)
            .field("overlay_sectors", &self.overlay.len())
            .finish()
    }
}

impl FileBlock {
    /// Opens `path` as a block store. The file is opened for writing only in
    /// [`FileBlockMode::ReadWrite`].
    pub fn open(path: &Path, mode: FileBlockMode) -> Result<Self, std::io::Error> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(mode == FileBlockMode::ReadWrite)
            .open(path)?;
        Self::with_file(file, mode)
    }

    /// Wraps an already opened file.
    pub fn with_file(file: fs::File, mode: FileBlockMode) -> Result<Self, std::io::Error> {
        let sector_count = file.metadata()?.len() / SECTOR_SIZE as u64;
        tracing::debug!(sector_count, ?mode, "file block store");
        Ok(Self {
            file,
            sector_count,
            mode,
            overlay: BTreeMap::new(),
        })
    }

    fn check_range(&self, sector: u64, len: usize) -> Result<(), BlockError> {
        let sectors = (len / SECTOR_BYTES) as u64;
        match sector.checked_add(sectors) {
            Some(end) if end <= self.sector_count => Ok(()),
            _ => Err(BlockError::OutOfRange),
        }
    }

    fn read_inner(&self, sector: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_range(sector, buf.len())?;
        if self.mode == FileBlockMode::Snapshot {
            for (i, chunk) in buf.chunks_mut(SECTOR_BYTES).enumerate() {
                let sector = sector + i as u64;
                if let Some(data) = self.overlay.get(&sector) {
                    chunk.copy_from_slice(&data[..chunk.len()]);
                } else {
                    self.file.read_exact_at(chunk, sector * SECTOR_SIZE as u64)?;
                }
            }
        } else {
            self.file.read_exact_at(buf, sector * SECTOR_SIZE as u64)?;
        }
        Ok(())
    }

    fn write_inner(&mut self, sector: u64, buf: &[u8]) -> Result<(), BlockError> {
        match self.mode {
            FileBlockMode::ReadOnly => Err(BlockError::ReadOnly),
            FileBlockMode::ReadWrite => {
                self.check_range(sector, buf.len())?;
                self.file.write_all_at(buf, sector * SECTOR_SIZE as u64)?;
                Ok(())
            }
            FileBlockMode::Snapshot => {
                self.check_range(sector, buf.len())?;
                for (i, chunk) in buf.chunks(SECTOR_BYTES).enumerate() {
                    match self.overlay.entry(sector + i as u64) {
                        Entry::Vacant(entry) => {
                            let mut data = [0; SECTOR_BYTES];
                            data[..chunk.len()].copy_from_slice(chunk);
                            entry.insert(data);
                        }
                        Entry::Occupied(mut entry) => {
                            entry.get_mut()[..chunk.len()].copy_from_slice(chunk);
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

impl BlockBackend for FileBlock {
    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> IoSubmission {
        IoSubmission::Complete(self.read_inner(sector, buf))
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> IoSubmission {
        IoSubmission::Complete(self.write_inner(sector, buf))
    }

    fn flush(&mut self) -> IoSubmission {
        // Writes go straight to the file; there is nothing buffered to push.
        IoSubmission::Complete(Ok(()))
    }
}
