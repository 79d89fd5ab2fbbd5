// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

/// Top-level agent failures, mapped to process exit codes.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl AgentError {
    /// `1` for configuration errors at startup, `2` for unrecoverable
    /// runtime errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::Config(_) => 1,
            AgentError::Runtime(_) => 2,
        }
    }
}
