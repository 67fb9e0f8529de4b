// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The streaming message pipeline's two halves:
//!
//! - [`StreamBuffer`] coalesces token-by-token text deltas in front of the
//!   storage layer so a 400-token stream costs a handful of row writes
//!   instead of 400.
//! - [`compose`] merges tool-flavored messages into an ordered message
//!   list by call identifier. Pure functions; the caller persists the
//!   outcome.

mod buffer;
pub mod compose;

pub use buffer::{AppendMode, BufferOptions, StreamBuffer};
