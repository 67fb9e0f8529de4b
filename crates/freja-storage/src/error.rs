// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

/// Storage failures. Nothing in this crate panics across the API boundary;
/// every operation returns `Result<_, StorageError>`.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("no such row: {0}")]
    NotFound(String),

    #[error("database at {path} is corrupt and could not be recovered")]
    Corrupt { path: PathBuf },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}
