// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Emulator for the SiFive UART.
//!
//! UNSAFETY: the host console backend needs raw fcntl/read calls for
//! non-blocking stdin access.

pub mod console;
pub mod resolver;
mod spec;

use crate::console::Console;
use crate::spec::InterruptRegister;
use crate::spec::Register;
use crate::spec::REGISTERS_SIZE;
use crate::spec::RXFIFO_EMPTY;
use crate::spec::RX_FIFO_SIZE;
use sim_device::io::IoError;
use sim_device::io::IoResult;
use sim_device::MmioDevice;
use simcore::line_interrupt::LineInterrupt;
use std::collections::VecDeque;

/// A SiFive UART emulator.
pub struct SifiveUart {
    interrupt: LineInterrupt,
    console: Box<dyn Console>,
    state: State,
}

#[derive(Debug, Default)]
struct State {
    txctrl: u32,
    rxctrl: u32,
    ie: u32,
    div: u32,
    rx_fifo: VecDeque<u8>,
}

/// Merges the low `data.len()` bytes of a store into a register.
fn merge_le(reg: &mut u32, data: &[u8]) {
    let mut bytes = reg.to_le_bytes();
    bytes[..data.len()].copy_from_slice(data);
    *reg = u32::from_le_bytes(bytes);
}

impl SifiveUart {
    pub fn new(interrupt: LineInterrupt, console: Box<dyn Console>) -> Self {
        let mut this = Self {
            interrupt,
            console,
            state: State::default(),
        };
        this.sync();
        this
    }

    fn read_ip(&self) -> u32 {
        // Transmit never backs up in this model, so the TX watermark is
        // permanently asserted. RX asserts while the software FIFO holds data.
        InterruptRegister::new()
            .with_txwm(true)
            .with_rxwm(!self.state.rx_fifo.is_empty())
            .into()
    }

    fn read_rxfifo(&mut self) -> u32 {
        let val = match self.state.rx_fifo.pop_front() {
            Some(byte) => byte.into(),
            None => RXFIFO_EMPTY,
        };
        self.sync();
        val
    }

    /// Recomputes the interrupt line from IE and IP.
    fn sync(&mut self) {
        self.interrupt.set_level(self.state.ie & self.read_ip() != 0);
    }
}

impl MmioDevice for SifiveUart {
    fn load(&mut self, addr: u64, data: &mut [u8]) -> IoResult {
        if addr >= REGISTERS_SIZE {
            return IoResult::Err(IoError::OutsideWindow);
        }
        if data.len() > 4 {
            return IoResult::Err(IoError::InvalidAccessSize);
        }
        let val = match Register(addr) {
            // Transmit FIFO full flag (bit 31) never set.
            Register::TXFIFO => 0,
            Register::RXFIFO => self.read_rxfifo(),
            Register::TXCTRL => self.state.txctrl,
            Register::RXCTRL => self.state.rxctrl,
            Register::IE => self.state.ie,
            Register::IP => self.read_ip(),
            Register::DIV => self.state.div,
            _ => {
                tracing::warn!(addr = format_args!("{addr:#x}"), "load from undefined uart register");
                0
            }
        };
        data.copy_from_slice(&val.to_le_bytes()[..data.len()]);
        IoResult::Ok
    }

    fn store(&mut self, addr: u64, data: &[u8]) -> IoResult {
        if addr >= REGISTERS_SIZE {
            return IoResult::Err(IoError::OutsideWindow);
        }
        if data.len() > 4 || data.is_empty() {
            return IoResult::Err(IoError::InvalidAccessSize);
        }
        match Register(addr) {
            Register::TXFIFO => self.console.put_byte(data[0]),
            Register::TXCTRL => merge_le(&mut self.state.txctrl, data),
            Register::RXCTRL => merge_le(&mut self.state.rxctrl, data),
            Register::IE => {
                merge_le(&mut self.state.ie, data);
                self.sync();
            }
            Register::DIV => merge_le(&mut self.state.div, data),
            _ => {
                tracing::warn!(
                    addr = format_args!("{addr:#x}"),
                    "store to undefined uart register"
                );
            }
        }
        IoResult::Ok
    }

    fn tick(&mut self) {
        if self.state.rx_fifo.len() >= RX_FIFO_SIZE {
            return;
        }
        if let Some(byte) = self.console.poll_byte() {
            self.state.rx_fifo.push_back(byte);
            self.sync();
        }
    }

    fn window_len(&self) -> u64 {
        REGISTERS_SIZE
    }
}
