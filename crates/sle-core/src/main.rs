// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use sle_core::services::Services;

/// SLE - Simple Log Exporter: tail local log sources and push them to remote
/// log-ingestion backends.
#[derive(Parser)]
#[command(name = "sle", version)]
struct Cli {
    /// Enable verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(err) = Services::default().run().await {
        error!("{err}");
        std::process::exit(err.exit_code());
    }
}
