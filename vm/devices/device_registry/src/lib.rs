// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The device factory registry.
//!
//! Simulator startup code registers one [`DeviceFactory`] per supported
//! device model, then offers the platform FDT to all of them. A factory whose
//! compatible string is present in the tree constructs its device at the
//! discovered base address. Free-form `key=value` arguments from the command
//! line are routed to the factory by name.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use guestmem::GuestMemory;
use sim_device::MmioDevice;
use simcore::line_interrupt::LineSetTarget;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Simulator services handed to device constructors.
pub struct SimServices {
    /// Guest memory, via the debug MMU.
    pub mem: GuestMemory,
    /// The platform interrupt controller.
    pub intc: Arc<dyn LineSetTarget>,
}

/// `key=value` arguments for one device instance.
///
/// Entries without `=` and unrecognized keys are ignored.
#[derive(Debug, Default)]
pub struct DeviceArgs(BTreeMap<String, String>);

impl DeviceArgs {
    /// Parses a list of `key=value` strings.
    pub fn parse(args: &[String]) -> Self {
        let mut map = BTreeMap::new();
        for arg in args {
            if let Some(eq_idx) = arg.find('=') {
                map.insert(arg[..eq_idx].to_owned(), arg[eq_idx + 1..].to_owned());
            }
        }
        Self(map)
    }

    /// Returns the value of `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// A device constructed by a factory, placed at its discovered base address.
pub struct DiscoveredDevice {
    /// Guest physical base of the MMIO window.
    pub base: u64,
    /// The interrupt-controller input the device drives.
    pub irq: u32,
    /// The device model.
    pub device: Box<dyn MmioDevice>,
}

/// A named device model constructor pair.
pub struct DeviceFactory {
    /// The name device arguments are routed by (e.g. `virtioblk`).
    pub name: &'static str,
    /// Offers the FDT to the factory. Returns `None` if the tree has no node
    /// for this device.
    pub parse_fdt: fn(&[u8], &SimServices, &DeviceArgs) -> Option<DiscoveredDevice>,
    /// Returns the device-tree source fragment for this device, or an empty
    /// string if it contributes none.
    pub generate_dts: fn() -> String,
}

/// The table of registered device factories.
#[derive(Default)]
pub struct DeviceRegistry {
    factories: Vec<DeviceFactory>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a factory. Later registrations probe later.
    pub fn register(&mut self, factory: DeviceFactory) {
        self.factories.push(factory);
    }

    /// Offers `fdt_blob` to every factory, constructing each device whose
    /// node is present. `args` maps factory names to their `key=value`
    /// argument lists.
    pub fn probe(
        &self,
        fdt_blob: &[u8],
        services: &SimServices,
        args: &BTreeMap<String, Vec<String>>,
    ) -> Vec<DiscoveredDevice> {
        let mut devices = Vec::new();
        for factory in &self.factories {
            let device_args = args
                .get(factory.name)
                .map(|list| DeviceArgs::parse(list))
                .unwrap_or_default();
            match (factory.parse_fdt)(fdt_blob, services, &device_args) {
                Some(discovered) => {
                    tracing::info!(
                        name = factory.name,
                        base = format_args!("{:#x}", discovered.base),
                        len = format_args!("{:#x}", discovered.device.window_len()),
                        irq = discovered.irq,
                        "found device"
                    );
                    devices.push(discovered);
                }
                None => {
                    tracing::debug!(name = factory.name, "device not present");
                }
            }
        }
        devices
    }

    /// Concatenates the DTS fragments of every registered factory.
    pub fn generate_dts(&self) -> String {
        self.factories
            .iter()
            .map(|factory| (factory.generate_dts)())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdt::builder::Builder;
    use fdt::parser::Parser;
    use guestmem::testing::SparseRam;
    use sim_device::io::IoResult;
    use simcore::line_interrupt::test_helpers::TestLineInterruptTarget;

    struct StubDevice;

    impl MmioDevice for StubDevice {
        fn load(&mut self, _addr: u64, data: &mut [u8]) -> IoResult {
            data.fill(0);
            IoResult::Ok
        }

        fn store(&mut self, _addr: u64, _data: &[u8]) -> IoResult {
            IoResult::Ok
        }

        fn window_len(&self) -> u64 {
            0x1000
        }
    }

    fn stub_parse(blob: &[u8], _services: &SimServices, args: &DeviceArgs) -> Option<DiscoveredDevice> {
        let parser = Parser::new(blob).ok()?;
        let node = parser.find_compatible("acme,stub").ok()??;
        let (base, _len) = node.reg()?;
        assert_eq!(args.get("knob"), Some("7"));
        Some(DiscoveredDevice {
            base,
            irq: node.interrupts().unwrap_or(5),
            device: Box::new(StubDevice),
        })
    }

    fn stub_dts() -> String {
        "    stub {};\n".to_owned()
    }

    fn services() -> SimServices {
        SimServices {
            mem: SparseRam::new().into_guest_memory(),
            intc: TestLineInterruptTarget::new_arc(),
        }
    }

    #[test]
    fn probe_constructs_discovered_devices() {
        let mut registry = DeviceRegistry::new();
        registry.register(DeviceFactory {
            name: "stub",
            parse_fdt: stub_parse,
            generate_dts: stub_dts,
        });

        let mut builder = Builder::new();
        builder.begin_node("");
        builder.prop_u32("#address-cells", 2);
        builder.prop_u32("#size-cells", 2);
        builder.begin_node("stub@20000000");
        builder.prop_str("compatible", "acme,stub");
        builder.prop_cells("reg", &[0, 0x2000_0000, 0, 0x1000]);
        builder.end_node();
        builder.end_node();
        let blob = builder.build();

        let args = [(
            "stub".to_owned(),
            vec!["knob=7".to_owned(), "ignored".to_owned()],
        )]
        .into_iter()
        .collect();
        let devices = registry.probe(&blob, &services(), &args);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].base, 0x2000_0000);
        assert_eq!(devices[0].irq, 5);
        assert_eq!(registry.generate_dts(), "    stub {};\n");
    }

    #[test]
    fn probe_skips_absent_devices() {
        let mut registry = DeviceRegistry::new();
        registry.register(DeviceFactory {
            name: "stub",
            parse_fdt: stub_parse,
            generate_dts: stub_dts,
        });

        let mut builder = Builder::new();
        builder.begin_node("");
        builder.end_node();
        let blob = builder.build();

        let devices = registry.probe(&blob, &services(), &BTreeMap::new());
        assert!(devices.is_empty());
    }

    #[test]
    fn device_args_split_at_first_equals() {
        let args = DeviceArgs::parse(&[
            "img=/path/with=equals".to_owned(),
            "mode=ro".to_owned(),
            "bare".to_owned(),
        ]);
        assert_eq!(args.get("img"), Some("/path/with=equals"));
        assert_eq!(args.get("mode"), Some("ro"));
        assert_eq!(args.get("bare"), None);
    }
}
