// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use rusqlite::params;

use crate::db::{millis, Storage};
use crate::Result;

/// The single local user every conversation belongs to. The desktop client
/// is single-user; the column exists so the schema does not need a
/// migration if that ever changes.
pub const SYSTEM_USER_ID: &str = "system";

impl Storage {
    /// Seed the default user row. Safe to call on every startup.
    pub fn ensure_system_user(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO users (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![SYSTEM_USER_ID, "Local User", millis(chrono::Utc::now())],
        )?;
        Ok(())
    }

    pub fn has_users(&self) -> Result<bool> {
        let conn = self.lock();
        let exists: bool = conn.query_row("SELECT EXISTS(SELECT 1 FROM users)", [], |row| {
            row.get(0)
        })?;
        Ok(exists)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
