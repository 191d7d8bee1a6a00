// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Code to parse a Flattened DeviceTree binary blob.

use crate::spec;
use crate::spec::U32b;
use thiserror::Error;
use zerocopy::FromBytes;

/// Errors returned when parsing a FDT.
#[derive(Debug, Error)]
pub enum Error {
    #[error("buffer too small for fixed FDT header")]
    NoHeader,
    #[error("FDT header magic field invalid")]
    HeaderMagic,
    #[error("FDT header total size greater than provided buffer")]
    HeaderTotalSize,
    #[error("FDT header version invalid")]
    HeaderVersion,
    #[error("structure block not contained within buffer")]
    StructureBlock,
    #[error("strings block not contained within buffer")]
    StringsBlock,
    #[error("structure block truncated")]
    Truncated,
    #[error("unexpected FDT token {0}")]
    UnexpectedToken(u32),
    #[error("node or property name is not a valid string")]
    BadString,
    #[error("FDT end token not present at end of structure block")]
    FdtEnd,
}

/// A parser over an FDT blob.
pub struct Parser<'a> {
    structure_block: &'a [u8],
    strings_block: &'a [u8],
    /// The bsp reg field.
    pub boot_cpuid_phys: u32,
}

impl<'a> Parser<'a> {
    /// Create a new instance of a FDT parser.
    pub fn new(blob: &'a [u8]) -> Result<Self, Error> {
        let header = spec::Header::read_from_prefix(blob)
            .map_err(|_| Error::NoHeader)?
            .0;

        if u32::from(header.magic) != spec::MAGIC {
            return Err(Error::HeaderMagic);
        }
        if u32::from(header.totalsize) as usize > blob.len() {
            return Err(Error::HeaderTotalSize);
        }
        if u32::from(header.version) < spec::CURRENT_VERSION
            || u32::from(header.last_comp_version) > spec::COMPAT_VERSION
        {
            return Err(Error::HeaderVersion);
        }

        let struct_offset = u32::from(header.off_dt_struct) as usize;
        let struct_len = u32::from(header.size_dt_struct) as usize;
        let structure_block = blob
            .get(struct_offset..struct_offset + struct_len)
            .ok_or(Error::StructureBlock)?;

        let strings_offset = u32::from(header.off_dt_strings) as usize;
        let strings_len = u32::from(header.size_dt_strings) as usize;
        let strings_block = blob
            .get(strings_offset..strings_offset + strings_len)
            .ok_or(Error::StringsBlock)?;

        Ok(Self {
            structure_block,
            strings_block,
            boot_cpuid_phys: header.boot_cpuid_phys.into(),
        })
    }

    /// Returns every node in the tree, in document order.
    pub fn nodes(&self) -> Result<Vec<Node<'a>>, Error> {
        let mut walker = Walker {
            buf: self.structure_block,
            strings_block: self.strings_block,
        };
        walker.walk()
    }

    /// Returns the first node whose `compatible` property matches.
    pub fn find_compatible(&self, compatible: &str) -> Result<Option<Node<'a>>, Error> {
        Ok(self
            .nodes()?
            .into_iter()
            .find(|node| node.compatible_matches(compatible)))
    }
}

/// A node of the tree, with the cell counts inherited from its parent.
#[derive(Debug)]
pub struct Node<'a> {
    /// The node name, including the unit address suffix.
    pub name: &'a str,
    properties: Vec<Property<'a>>,
    address_cells: u32,
    size_cells: u32,
}

/// A property of a [`Node`].
#[derive(Debug)]
pub struct Property<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
}

impl<'a> Node<'a> {
    /// Finds the property named `name`.
    pub fn property(&self, name: &str) -> Option<&Property<'a>> {
        self.properties.iter().find(|prop| prop.name == name)
    }

    /// True if the `compatible` string list contains `compatible`.
    pub fn compatible_matches(&self, compatible: &str) -> bool {
        let Some(prop) = self.property("compatible") else {
            return false;
        };
        prop.data
            .split(|&b| b == 0)
            .any(|entry| entry == compatible.as_bytes())
    }

    /// Reads the first `(address, size)` pair of the `reg` property, using the
    /// cell counts inherited from the parent node.
    pub fn reg(&self) -> Option<(u64, u64)> {
        let prop = self.property("reg")?;
        let mut cells = prop
            .data
            .chunks_exact(4)
            .map(|chunk| u32::from_be_bytes(chunk.try_into().unwrap()));
        let address = read_cells(&mut cells, self.address_cells)?;
        let size = read_cells(&mut cells, self.size_cells)?;
        Some((address, size))
    }

    /// Reads the first cell of the `interrupts` property.
    pub fn interrupts(&self) -> Option<u32> {
        let prop = self.property("interrupts")?;
        Some(u32::from_be_bytes(prop.data.get(..4)?.try_into().unwrap()))
    }

    fn prop_u32(&self, name: &str) -> Option<u32> {
        let prop = self.property(name)?;
        Some(u32::from_be_bytes(prop.data.get(..4)?.try_into().unwrap()))
    }
}

fn read_cells(cells: &mut impl Iterator<Item = u32>, count: u32) -> Option<u64> {
    // Addresses wider than two cells do not fit the bus.
    if count > 2 {
        return None;
    }
    let mut val = 0u64;
    for _ in 0..count {
        val = val << 32 | cells.next()? as u64;
    }
    Some(val)
}

/// Per-node state while scanning the structure block.
struct Frame<'a> {
    node: Node<'a>,
    child_address_cells: u32,
    child_size_cells: u32,
}

struct Walker<'a> {
    buf: &'a [u8],
    strings_block: &'a [u8],
}

impl<'a> Walker<'a> {
    fn token(&mut self) -> Result<u32, Error> {
        let (token, rest) = U32b::read_from_prefix(self.buf).map_err(|_| Error::Truncated)?;
        self.buf = rest;
        Ok(token.into())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        // The structure block pads everything to token alignment.
        let padded = len.checked_next_multiple_of(4).ok_or(Error::Truncated)?;
        let data = self.buf.get(..len).ok_or(Error::Truncated)?;
        self.buf = self.buf.get(padded..).unwrap_or(&[]);
        Ok(data)
    }

    fn node_name(&mut self) -> Result<&'a str, Error> {
        let len = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::Truncated)?;
        let name = std::str::from_utf8(&self.buf[..len]).map_err(|_| Error::BadString)?;
        self.take(len + 1)?;
        Ok(name)
    }

    fn prop_name(&self, nameoff: U32b) -> Result<&'a str, Error> {
        let start = self
            .strings_block
            .get(u32::from(nameoff) as usize..)
            .ok_or(Error::BadString)?;
        let len = start.iter().position(|&b| b == 0).ok_or(Error::BadString)?;
        std::str::from_utf8(&start[..len]).map_err(|_| Error::BadString)
    }

    fn walk(&mut self) -> Result<Vec<Node<'a>>, Error> {
        let mut nodes = Vec::new();
        let mut stack: Vec<Frame<'a>> = Vec::new();
        loop {
            match self.token()? {
                spec::BEGIN_NODE => {
                    let name = self.node_name()?;
                    let (address_cells, size_cells) = match stack.last() {
                        Some(parent) => (parent.child_address_cells, parent.child_size_cells),
                        None => (spec::DEFAULT_ADDRESS_CELLS, spec::DEFAULT_SIZE_CELLS),
                    };
                    stack.push(Frame {
                        node: Node {
                            name,
                            properties: Vec::new(),
                            address_cells,
                            size_cells,
                        },
                        child_address_cells: spec::DEFAULT_ADDRESS_CELLS,
                        child_size_cells: spec::DEFAULT_SIZE_CELLS,
                    });
                }
                spec::PROP => {
                    let (header, rest) =
                        spec::PropHeader::read_from_prefix(self.buf).map_err(|_| Error::Truncated)?;
                    self.buf = rest;
                    let data = self.take(u32::from(header.len) as usize)?;
                    let name = self.prop_name(header.nameoff)?;
                    let frame = stack.last_mut().ok_or(Error::UnexpectedToken(spec::PROP))?;
                    frame.node.properties.push(Property { name, data });
                    if name == "#address-cells" {
                        frame.child_address_cells =
                            frame.node.prop_u32(name).unwrap_or(spec::DEFAULT_ADDRESS_CELLS);
                    } else if name == "#size-cells" {
                        frame.child_size_cells =
                            frame.node.prop_u32(name).unwrap_or(spec::DEFAULT_SIZE_CELLS);
                    }
                }
                spec::END_NODE => {
                    let frame = stack.pop().ok_or(Error::UnexpectedToken(spec::END_NODE))?;
                    nodes.push(frame.node);
                }
                spec::NOP => {}
                spec::END => {
                    if !stack.is_empty() {
                        return Err(Error::FdtEnd);
                    }
                    return Ok(nodes);
                }
                token => return Err(Error::UnexpectedToken(token)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;

    fn sample_blob() -> Vec<u8> {
        let mut builder = Builder::new();
        builder.begin_node("");
        builder.prop_u32("#address-cells", 2);
        builder.prop_u32("#size-cells", 2);
        builder.begin_node("soc");
        builder.prop_u32("#address-cells", 2);
        builder.prop_u32("#size-cells", 2);
        builder.begin_node("virtio@10001000");
        builder.prop_str("compatible", "virtio,mmio");
        builder.prop_cells("reg", &[0, 0x1000_1000, 0, 0x1000]);
        builder.prop_u32("interrupts", 8);
        builder.end_node();
        builder.begin_node("uart@10010000");
        builder.prop_str("compatible", "sifive,uart0");
        builder.prop_cells("reg", &[0, 0x1001_0000, 0, 0x1000]);
        builder.end_node();
        builder.end_node();
        builder.end_node();
        builder.build()
    }

    #[test]
    fn finds_node_by_compatible() {
        let blob = sample_blob();
        let parser = Parser::new(&blob).unwrap();
        let node = parser.find_compatible("virtio,mmio").unwrap().unwrap();
        assert_eq!(node.name, "virtio@10001000");
        assert_eq!(node.reg(), Some((0x1000_1000, 0x1000)));
        assert_eq!(node.interrupts(), Some(8));

        let uart = parser.find_compatible("sifive,uart0").unwrap().unwrap();
        assert_eq!(uart.reg(), Some((0x1001_0000, 0x1000)));
        assert_eq!(uart.interrupts(), None);

        assert!(parser.find_compatible("virtio,pci").unwrap().is_none());
    }

    #[test]
    fn single_cell_addresses() {
        let mut builder = Builder::new();
        builder.begin_node("");
        builder.prop_u32("#address-cells", 1);
        builder.prop_u32("#size-cells", 1);
        builder.begin_node("test@80000000");
        builder.prop_str("compatible", "acme,test");
        builder.prop_cells("reg", &[0x8000_0000, 0x2000]);
        builder.end_node();
        builder.end_node();
        let blob = builder.build();

        let parser = Parser::new(&blob).unwrap();
        let node = parser.find_compatible("acme,test").unwrap().unwrap();
        assert_eq!(node.reg(), Some((0x8000_0000, 0x2000)));
    }

    #[test]
    fn compatible_string_lists_match_any_entry() {
        let mut builder = Builder::new();
        builder.begin_node("");
        builder.begin_node("dev");
        builder.prop("compatible", b"acme,new\0acme,old\0");
        builder.end_node();
        builder.end_node();
        let blob = builder.build();

        let parser = Parser::new(&blob).unwrap();
        assert!(parser.find_compatible("acme,old").unwrap().is_some());
        assert!(parser.find_compatible("acme,new").unwrap().is_some());
        assert!(parser.find_compatible("acme").unwrap().is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut blob = sample_blob();
        blob[0] = 0;
        assert!(matches!(Parser::new(&blob), Err(Error::HeaderMagic)));
    }
}
