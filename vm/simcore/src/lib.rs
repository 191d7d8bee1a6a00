// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core services shared by the simulator's device models.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod line_interrupt;
