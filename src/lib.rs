// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! freja: the conversation backend runtime embedded by the desktop
//! client.
//!
//! There is no CLI surface here: the parent application constructs an
//! [`App`], bridges [`freja_bridge::LocalBus`] onto its own IPC, and
//! supplies a generator for the integrated agent. Everything else
//! (storage, streaming, workers, MCP) is wired internally.

mod app;

pub use app::{App, AppOptions};
pub use freja_bridge::{BusEvent, LocalBus, Reply, Services};
pub use freja_config::Paths;
pub use freja_workers::generate::{GenEvent, GenRequest, Generator, GeneratorFactory};

use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Install the process-wide tracing subscriber.
///
/// The embedding shell decides where logs go:
///   • Set FREJA_LOG_FILE=/path/to/file → logs append to that file
///   • Set RUST_LOG=...                 → respects the env filter
///   • `verbose`                        → debug level on stderr
///
/// Safe to call more than once; only the first installation wins.
pub fn init_logging(verbose: bool) {
    if let Ok(log_path) = std::env::var("FREJA_LOG_FILE") {
        use std::sync::Mutex;
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
            let _ = tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .with(filter)
                .try_init();
            return;
        }
    }

    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
