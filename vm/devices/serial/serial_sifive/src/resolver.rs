// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! FDT discovery of the SiFive UART.

use crate::console::HostConsole;
use crate::SifiveUart;
use device_registry::DeviceArgs;
use device_registry::DeviceFactory;
use device_registry::DiscoveredDevice;
use device_registry::SimServices;
use fdt::parser::Parser;
use simcore::line_interrupt::LineInterrupt;

/// FDT compatible string of the UART.
pub const COMPATIBLE: &str = "sifive,uart0";

/// Interrupt used when the FDT node carries no `interrupts` property.
pub const DEFAULT_IRQ: u32 = 1;

/// Returns the registry factory for the UART.
pub fn factory() -> DeviceFactory {
    DeviceFactory {
        name: "sifive_uart",
        parse_fdt,
        generate_dts,
    }
}

fn parse_fdt(blob: &[u8], services: &SimServices, _args: &DeviceArgs) -> Option<DiscoveredDevice> {
    let parser = Parser::new(blob).ok()?;
    let node = parser.find_compatible(COMPATIBLE).ok()??;
    let (base, _len) = node.reg()?;
    let irq = node.interrupts().unwrap_or(DEFAULT_IRQ);

    let console = match HostConsole::new() {
        Ok(console) => console,
        Err(err) => {
            eprintln!("sifive uart init error: cannot open host console: {err}");
            std::process::exit(1);
        }
    };
    let interrupt = LineInterrupt::new("sifive-uart", services.intc.clone(), irq);
    let device = SifiveUart::new(interrupt, Box::new(console));
    Some(DiscoveredDevice {
        base,
        irq,
        device: Box::new(device),
    })
}

fn generate_dts() -> String {
    // The platform's own DTS already carries the UART node.
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdt::builder::Builder;

    #[test]
    fn absent_node_yields_none() {
        let mut builder = Builder::new();
        builder.begin_node("");
        builder.end_node();
        let blob = builder.build();

        let services = SimServices {
            mem: guestmem::testing::SparseRam::new().into_guest_memory(),
            intc: simcore::line_interrupt::test_helpers::TestLineInterruptTarget::new_arc(),
        };
        assert!(parse_fdt(&blob, &services, &DeviceArgs::default()).is_none());
        assert_eq!(generate_dts(), "");
    }
}
