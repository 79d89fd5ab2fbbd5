// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

//! SLE agent crate: configuration loading, the error taxonomy and the
//! supervisor wiring the `sle-pipeline` components together.

pub mod config;
pub mod error;
pub mod services;
