// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! One API over every place MCP servers are configured.
//!
//! Each external agent CLI (claude, gemini, …) owns its own MCP config
//! surface, reachable only through that tool's `mcp list/add/remove`
//! subcommands; the desktop app additionally keeps an in-process config
//! blob. A [`source::McpSource`] wraps each surface, a per-source FIFO
//! queue serializes mutations, and the [`mux::McpMultiplexer`] fans
//! detection and sync across all of them in parallel.

mod ansi;
pub mod cli;
pub mod local;
pub mod mux;
pub mod probe;
pub mod source;
mod types;

pub use mux::{AgentServers, AgentTarget, McpMultiplexer};
pub use probe::{Prober, TransportProber};
pub use source::{McpSource, SerializedSource};
pub use types::{
    AgentReport, ConnectionTest, InstallReport, McpServer, McpTransport, ServerStatus,
    TransportKind,
};
