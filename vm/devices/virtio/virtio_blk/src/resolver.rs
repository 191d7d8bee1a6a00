// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! FDT discovery and command-line construction of the block device.

use crate::VirtioBlkDevice;
use block_file::FileBlock;
use block_file::FileBlockMode;
use device_registry::DeviceArgs;
use device_registry::DeviceFactory;
use device_registry::DiscoveredDevice;
use device_registry::SimServices;
use fdt::parser::Parser;
use simcore::line_interrupt::LineInterrupt;
use std::path::Path;
use virtio::spec::mmio::REGISTERS_SIZE;
use virtio::VirtioMmioDevice;

/// FDT compatible string of the MMIO transport.
pub const COMPATIBLE: &str = "virtio,mmio";

/// Interrupt used when the FDT node carries no `interrupts` property.
pub const DEFAULT_IRQ: u32 = 1;

/// Placement advertised in generated device tree source.
pub const DEFAULT_BASE_ADDR: u64 = 0x1000_1000;

/// Returns the registry factory for the virtio block device.
pub fn factory() -> DeviceFactory {
    DeviceFactory {
        name: "virtioblk",
        parse_fdt,
        generate_dts,
    }
}

fn parse_fdt(blob: &[u8], services: &SimServices, args: &DeviceArgs) -> Option<DiscoveredDevice> {
    let parser = Parser::new(blob).ok()?;
    let node = parser.find_compatible(COMPATIBLE).ok()??;
    let (base, _len) = node.reg()?;
    let irq = node.interrupts().unwrap_or(DEFAULT_IRQ);

    let Some(img) = args.get("img") else {
        eprintln!(
            "virtio block device init error: `img` argument not specified.\n\
             Use --device=virtioblk,img=<file> to attach an existing image."
        );
        std::process::exit(1);
    };
    let mode = args
        .get("mode")
        .map_or(FileBlockMode::ReadWrite, FileBlockMode::from_arg);
    let backend = match FileBlock::open(Path::new(img), mode) {
        Ok(backend) => backend,
        Err(err) => {
            eprintln!("virtio block device init error: {img}: {err}");
            std::process::exit(1);
        }
    };

    let interrupt = LineInterrupt::new("virtio-blk", services.intc.clone(), irq);
    let device = VirtioMmioDevice::new(
        VirtioBlkDevice::new(Box::new(backend)),
        services.mem.clone(),
        interrupt,
    );
    Some(DiscoveredDevice {
        base,
        irq,
        device: Box::new(device),
    })
}

fn generate_dts() -> String {
    format!(
        "    virtioblk: virtio@{base:x} {{\n\
         \x20     compatible = \"{COMPATIBLE}\";\n\
         \x20     interrupt-parent = <&PLIC>;\n\
         \x20     interrupts = <{DEFAULT_IRQ}>;\n\
         \x20     reg = <{:#x} {:#x} {:#x} {:#x}>;\n\
         \x20   }};\n",
        DEFAULT_BASE_ADDR >> 32,
        DEFAULT_BASE_ADDR & 0xffff_ffff,
        REGISTERS_SIZE >> 32,
        REGISTERS_SIZE & 0xffff_ffff,
        base = DEFAULT_BASE_ADDR,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdt::builder::Builder;
    use guestmem::testing::SparseRam;
    use sim_device::MmioDevice;
    use simcore::line_interrupt::test_helpers::TestLineInterruptTarget;

    fn blk_fdt(irq: Option<u32>) -> Vec<u8> {
        let mut builder = Builder::new();
        builder.begin_node("");
        builder.prop_u32("#address-cells", 2);
        builder.prop_u32("#size-cells", 2);
        builder.begin_node("virtio@10001000");
        builder.prop_str("compatible", COMPATIBLE);
        builder.prop_cells("reg", &[0, 0x1000_1000, 0, 0x1000]);
        if let Some(irq) = irq {
            builder.prop_u32("interrupts", irq);
        }
        builder.end_node();
        builder.end_node();
        builder.build()
    }

    fn services() -> SimServices {
        SimServices {
            mem: SparseRam::new().into_guest_memory(),
            intc: TestLineInterruptTarget::new_arc(),
        }
    }

    #[test]
    fn constructs_device_from_fdt() {
        let img = tempfile::NamedTempFile::new().unwrap();
        img.as_file().set_len(8 * 512).unwrap();
        let args = DeviceArgs::parse(&[
            format!("img={}", img.path().display()),
            "mode=snapshot".to_owned(),
            "bogus=ignored".to_owned(),
        ]);

        let discovered = parse_fdt(&blk_fdt(Some(8)), &services(), &args).unwrap();
        assert_eq!(discovered.base, 0x1000_1000);
        assert_eq!(discovered.irq, 8);

        let mut device = discovered.device;
        let mut word = [0; 4];
        device.load(0x008, &mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word), 2);
        device.load(0x100, &mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word), 8);
    }

    #[test]
    fn missing_interrupts_property_uses_default() {
        let img = tempfile::NamedTempFile::new().unwrap();
        img.as_file().set_len(512).unwrap();
        let args = DeviceArgs::parse(&[format!("img={}", img.path().display())]);
        let discovered = parse_fdt(&blk_fdt(None), &services(), &args).unwrap();
        assert_eq!(discovered.irq, DEFAULT_IRQ);
    }

    #[test]
    fn absent_node_yields_none() {
        let mut builder = Builder::new();
        builder.begin_node("");
        builder.end_node();
        let blob = builder.build();
        assert!(parse_fdt(&blob, &services(), &DeviceArgs::default()).is_none());
    }

    #[test]
    fn dts_fragment_names_the_device() {
        let dts = generate_dts();
        assert!(dts.contains("virtio@10001000"));
        assert!(dts.contains("compatible = \"virtio,mmio\""));
        assert!(dts.contains("interrupts = <1>"));
        assert!(dts.contains("reg = <0x0 0x10001000 0x0 0x1000>"));
    }
}
