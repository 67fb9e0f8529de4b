// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use freja_storage::StorageError;

/// Runtime failure taxonomy. The bridge flattens these into
/// `{success: false, msg}` at the UI boundary; inside the core they stay
/// typed so callers can branch (`Busy` → surface, `Protocol` → drop the
/// worker, …).
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("a turn is already in flight")]
    Busy,

    #[error("operation not supported for {0} workers")]
    Unsupported(&'static str),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication required: {0}")]
    Auth(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("canceled")]
    Canceled,
}

impl WorkerError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
