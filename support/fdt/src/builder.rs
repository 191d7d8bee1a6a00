// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Code to build a Flattened DeviceTree binary blob.
//!
//! Only what the discovery tests need: nodes, raw/string/cell properties.

use crate::spec;
use std::collections::BTreeMap;
use zerocopy::IntoBytes;

/// An FDT blob under construction.
#[derive(Default)]
pub struct Builder {
    structure: Vec<u8>,
    strings: Vec<u8>,
    string_offsets: BTreeMap<String, u32>,
    depth: u32,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    fn token(&mut self, token: u32) {
        self.structure.extend_from_slice(&token.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        if let Some(&offset) = self.string_offsets.get(name) {
            return offset;
        }
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        self.string_offsets.insert(name.to_owned(), offset);
        offset
    }

    /// Opens a node. The root node's name is the empty string.
    pub fn begin_node(&mut self, name: &str) -> &mut Self {
        self.token(spec::BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad();
        self.depth += 1;
        self
    }

    /// Closes the most recently opened node.
    pub fn end_node(&mut self) -> &mut Self {
        assert!(self.depth > 0, "end_node without begin_node");
        self.token(spec::END_NODE);
        self.depth -= 1;
        self
    }

    /// Adds a property with raw contents.
    pub fn prop(&mut self, name: &str, data: &[u8]) -> &mut Self {
        let nameoff = self.string_offset(name);
        self.token(spec::PROP);
        self.structure
            .extend_from_slice((data.len() as u32).to_be_bytes().as_slice());
        self.structure.extend_from_slice(&nameoff.to_be_bytes());
        self.structure.extend_from_slice(data);
        self.pad();
        self
    }

    /// Adds a single-cell property.
    pub fn prop_u32(&mut self, name: &str, val: u32) -> &mut Self {
        self.prop(name, &val.to_be_bytes())
    }

    /// Adds a string property.
    pub fn prop_str(&mut self, name: &str, val: &str) -> &mut Self {
        let mut data = val.as_bytes().to_vec();
        data.push(0);
        self.prop(name, &data)
    }

    /// Adds a property of big-endian cells.
    pub fn prop_cells(&mut self, name: &str, cells: &[u32]) -> &mut Self {
        let data: Vec<u8> = cells.iter().flat_map(|cell| cell.to_be_bytes()).collect();
        self.prop(name, &data)
    }

    /// Finishes the blob.
    pub fn build(mut self) -> Vec<u8> {
        assert_eq!(self.depth, 0, "unclosed node");
        self.token(spec::END);

        let header_len = size_of::<spec::Header>();
        let rsvmap_off = header_len;
        let rsvmap_len = size_of::<spec::ReserveEntry>();
        let struct_off = rsvmap_off + rsvmap_len;
        let strings_off = struct_off + self.structure.len();
        let totalsize = strings_off + self.strings.len();

        let header = spec::Header {
            magic: spec::MAGIC.into(),
            totalsize: (totalsize as u32).into(),
            off_dt_struct: (struct_off as u32).into(),
            off_dt_strings: (strings_off as u32).into(),
            off_mem_rsvmap: (rsvmap_off as u32).into(),
            version: spec::CURRENT_VERSION.into(),
            last_comp_version: spec::COMPAT_VERSION.into(),
            boot_cpuid_phys: 0.into(),
            size_dt_strings: (self.strings.len() as u32).into(),
            size_dt_struct: (self.structure.len() as u32).into(),
        };

        let mut blob = Vec::with_capacity(totalsize);
        blob.extend_from_slice(header.as_bytes());
        blob.extend_from_slice(
            spec::ReserveEntry {
                address: 0.into(),
                size: 0.into(),
            }
            .as_bytes(),
        );
        blob.extend_from_slice(&self.structure);
        blob.extend_from_slice(&self.strings);
        blob
    }
}
