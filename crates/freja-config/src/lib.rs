// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Directory layout and opaque JSON config stores.
//!
//! The desktop shell persists a handful of JSON key-value files (model
//! config, MCP config, ACP agents config) next to the SQLite database.
//! The core treats their contents as opaque; this crate only knows how to
//! locate, read, and atomically rewrite them.

mod paths;
mod store;

pub use paths::{Paths, SystemInfo};
pub use store::JsonStore;
