// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Flattened DeviceTree support for device discovery.
//!
//! This is not a general-purpose FDT implementation: the parser exposes just
//! what device factories need (locating a node by `compatible` and reading its
//! `reg` and `interrupts` properties), and the builder exists to construct
//! blobs in tests.

#![forbid(unsafe_code)]

pub mod builder;
pub mod parser;
pub mod spec;
