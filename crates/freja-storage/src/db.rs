// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::StorageError;
use crate::migrations::{target_version, MIGRATIONS};
use crate::Result;

/// Process-wide durable store. One handle per process; all access funnels
/// through the inner connection, which serializes writes.
pub struct Storage {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Storage {
    /// Open (or create) the database at `path`, applying pending migrations.
    ///
    /// If the file cannot be opened or migrated (the classic symptom of a
    /// torn or overwritten file), it is moved aside to
    /// `<file>.backup.<epoch>` and a fresh database is created in its
    /// place. A second failure is fatal.
    pub fn open(path: &Path) -> Result<Self> {
        match Self::open_at(path) {
            Ok(conn) => Ok(Self {
                conn: Mutex::new(conn),
                path: Some(path.to_path_buf()),
            }),
            Err(first) => {
                warn!(
                    path = %path.display(),
                    error = %first,
                    "database unusable, backing up and reopening fresh"
                );
                Self::backup_aside(path)?;
                match Self::open_at(path) {
                    Ok(conn) => Ok(Self {
                        conn: Mutex::new(conn),
                        path: Some(path.to_path_buf()),
                    }),
                    Err(second) => {
                        warn!(path = %path.display(), error = %second, "reopen failed");
                        Err(StorageError::Corrupt {
                            path: path.to_path_buf(),
                        })
                    }
                }
            }
        }
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Self::migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    fn open_at(path: &Path) -> Result<Connection> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;
        Self::configure(&conn)?;
        Self::migrate(&mut conn)?;
        Ok(conn)
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // Prefer WAL for concurrent readers; some filesystems (network
        // mounts) refuse it, in which case the default journal is fine.
        let wal: std::result::Result<String, _> =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0));
        match wal {
            Ok(mode) if mode.eq_ignore_ascii_case("wal") => {}
            Ok(mode) => info!(%mode, "WAL unavailable, using default journal"),
            Err(e) => info!(error = %e, "WAL unavailable, using default journal"),
        }
        Ok(())
    }

    fn migrate(conn: &mut Connection) -> Result<()> {
        // This doubles as the corruption probe: reading user_version from a
        // file that is not a SQLite database fails here.
        let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        let target = target_version();
        if current >= target {
            return Ok(());
        }
        let tx = conn.transaction()?;
        for m in MIGRATIONS.iter().filter(|m| m.version > current) {
            tx.execute_batch(m.up)?;
            info!(version = m.version, "applied schema migration");
        }
        tx.pragma_update(None, "user_version", target)?;
        tx.commit()?;
        Ok(())
    }

    fn backup_aside(path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let epoch = Utc::now().timestamp();
        let backup = PathBuf::from(format!("{}.backup.{epoch}", path.display()));
        std::fs::rename(path, &backup)?;
        // WAL sidecars refer to the old file; drop them with it.
        for suffix in ["-wal", "-shm"] {
            let sidecar = PathBuf::from(format!("{}{suffix}", path.display()));
            if sidecar.exists() {
                let _ = std::fs::remove_file(&sidecar);
            }
        }
        warn!(backup = %backup.display(), "corrupt database moved aside");
        Ok(())
    }

    /// Current schema version.
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.lock();
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Reclaim free pages.
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    /// Path of the backing file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock means another thread panicked mid-operation; the
        // connection itself stays consistent (SQLite transactions), so
        // recover the guard rather than propagating the panic.
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
