// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host-side console backends for the UART.

use std::io;
use std::io::Write;

/// Byte-at-a-time host console.
pub trait Console: Send {
    /// Writes one byte of guest output to the host.
    fn put_byte(&mut self, byte: u8);

    /// Polls for one byte of host input. Never blocks.
    fn poll_byte(&mut self) -> Option<u8>;
}

/// Console over the process stdio.
///
/// Construction switches stdin to non-blocking mode so the per-tick poll
/// cannot stall the simulator.
pub struct HostConsole(());

impl HostConsole {
    pub fn new() -> io::Result<Self> {
        // SAFETY: fcntl with F_GETFL/F_SETFL on the process stdin fd.
        let flags = unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above.
        if unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(()))
    }
}

impl Console for HostConsole {
    fn put_byte(&mut self, byte: u8) {
        let mut stdout = io::stdout();
        if stdout.write_all(&[byte]).and_then(|()| stdout.flush()).is_err() {
            tracing::warn!("dropped uart output byte");
        }
    }

    fn poll_byte(&mut self) -> Option<u8> {
        let mut byte = 0u8;
        // SAFETY: reads at most one byte into a valid local buffer.
        let n = unsafe {
            libc::read(
                libc::STDIN_FILENO,
                std::ptr::from_mut(&mut byte).cast::<libc::c_void>(),
                1,
            )
        };
        (n == 1).then_some(byte)
    }
}
