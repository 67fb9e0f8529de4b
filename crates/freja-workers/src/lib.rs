// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The agent runtime: one worker per live conversation.
//!
//! Three worker variants share one contract: an in-process generator
//! loop, and two subprocess variants driven over line-delimited JSON-RPC
//! (ACP and Codex dialects). Every variant owns a single-slot inbound
//! turn, a cancellation token per turn, and emits typed events that the
//! [`pipeline::Pipeline`] persists and mirrors to the UI event bus.
//!
//! The [`manager::WorkerManager`] is the process-wide registry: it lazily
//! rebuilds workers after restart (SQL first, legacy JSON second), kills
//! them on config-significant updates, and serializes builds per id.

pub mod acp;
pub mod codex;
mod error;
pub mod events;
pub mod generate;
pub mod integrated;
pub mod manager;
pub mod pipeline;
pub mod rpc;
mod worker;

pub use error::WorkerError;
pub use events::{EventBus, EventKind, WorkerEvent};
pub use manager::{RuntimeBuilder, WorkerBuilder, WorkerManager};
pub use pipeline::Pipeline;
pub use worker::{Confirmation, SendRequest, Worker, WorkerStatus};

pub type Result<T> = std::result::Result<T, WorkerError>;
