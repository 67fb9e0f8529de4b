// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Resolved directory layout for one process.
///
/// Constructed once at startup and handed to every service that touches
/// disk. Tests construct it over a tempdir instead of the user's home.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Durable state: the SQLite database and legacy history files.
    pub data_dir: PathBuf,
    /// JSON key-value config files owned by the UI.
    pub config_dir: PathBuf,
    /// Scratch space (download caches, probe artifacts).
    pub cache_dir: PathBuf,
}

const APP_DIR: &str = "freja";

impl Paths {
    /// Standard per-user layout under the platform directories.
    pub fn resolve() -> anyhow::Result<Self> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("no platform data directory"))?
            .join(APP_DIR);
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("no platform config directory"))?
            .join(APP_DIR);
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("no platform cache directory"))?
            .join(APP_DIR);
        Ok(Self {
            data_dir,
            config_dir,
            cache_dir,
        })
    }

    /// All three directories rooted under `base`. Used by tests and by
    /// embedders that sandbox their state.
    pub fn under(base: &Path) -> Self {
        Self {
            data_dir: base.join("data"),
            config_dir: base.join("config"),
            cache_dir: base.join("cache"),
        }
    }

    /// Create all directories that do not yet exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }

    /// Path of the SQLite database file.
    pub fn database_file(&self) -> PathBuf {
        self.data_dir.join("freja.db")
    }

    /// Directory holding per-conversation legacy JSON history files.
    pub fn legacy_history_dir(&self) -> PathBuf {
        self.data_dir.join("history")
    }
}

/// Static facts about the host, reported over the `systemInfo` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(rename = "cacheDir")]
    pub cache_dir: PathBuf,
    #[serde(rename = "workDir")]
    pub work_dir: PathBuf,
    pub platform: String,
    pub arch: String,
}

impl SystemInfo {
    pub fn gather(paths: &Paths) -> Self {
        Self {
            cache_dir: paths.cache_dir.clone(),
            work_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
