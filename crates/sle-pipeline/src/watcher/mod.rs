// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

pub mod discovery;
pub mod file;
pub mod journald;

pub use discovery::{Discovery, SourceProvider};
pub use file::FileWatcher;
pub use journald::JournaldWatcher;
