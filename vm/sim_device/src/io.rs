// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MMIO access results.

/// An error related to the suitability of an access for the device. Device
/// specific failures (bad request contents, backend I/O errors) are handled
/// inside the device and still return [`IoResult::Ok`].
#[derive(Debug)]
pub enum IoError {
    /// The address falls outside the device's register window.
    OutsideWindow,
    /// The access is wider than the bus supports.
    InvalidAccessSize,
}

/// The result of a device MMIO operation.
///
/// The bus maps `Err` to a guest bus fault: reads are completed with an
/// all-ones value and writes are dropped.
#[derive(Debug)]
#[must_use]
pub enum IoResult {
    /// The access succeeded.
    Ok,
    /// The access could not be claimed by the device.
    Err(IoError),
}

impl IoResult {
    /// Asserts that `self` is [`IoResult::Ok`].
    #[track_caller]
    pub fn unwrap(self) {
        match self {
            IoResult::Ok => {}
            IoResult::Err(err) => panic!("unexpected IO result {:?}", err),
        }
    }

    /// Returns `true` if the access was claimed by the device.
    pub fn is_ok(&self) -> bool {
        matches!(self, IoResult::Ok)
    }
}
