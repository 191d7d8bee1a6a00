// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SiFive UART register layout.
//! <https://sifive.cdn.prismic.io/sifive/898b5153-4c06-4085-8d6a-64dbc719e3a4_fu740-c000-manual-v1p6.pdf>

use bitfield_struct::bitfield;
use open_enum::open_enum;

/// Size of the software receive FIFO.
pub const RX_FIFO_SIZE: usize = 8;

open_enum! {
    /// MMIO register assignments.
    pub enum Register: u64 {
        TXFIFO = 0x00,
        RXFIFO = 0x04,
        TXCTRL = 0x08,
        RXCTRL = 0x0c,
        IE     = 0x10,
        IP     = 0x14,
        DIV    = 0x18,
    }
}

/// The size of the device register window.
pub const REGISTERS_SIZE: u64 = 0x1000;

/// Bit 31 of an RXFIFO read: the FIFO was empty.
pub const RXFIFO_EMPTY: u32 = 0x8000_0000;

/// Layout shared by the IE and IP registers.
#[bitfield(u32)]
pub struct InterruptRegister {
    /// Transmit watermark.
    pub txwm: bool,
    /// Receive watermark.
    pub rxwm: bool,
    #[bits(30)]
    _reserved: u32,
}
