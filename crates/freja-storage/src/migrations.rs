// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Versioned schema migrations, tracked through `PRAGMA user_version`.
//!
//! Each step's DDL is idempotent (`IF NOT EXISTS`) so replaying at the
//! current version is a no-op. `rollback` is recorded for operators; it is
//! never executed automatically.

/// One schema step. Applied in ascending `version` order inside a single
/// transaction; either every pending step lands or none do.
pub struct Migration {
    pub version: i64,
    pub up: &'static str,
    #[allow(dead_code)]
    pub rollback: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up: "
            CREATE TABLE IF NOT EXISTS users (
                id         TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS conversations (
                id         TEXT PRIMARY KEY,
                user_id    TEXT NOT NULL,
                name       TEXT NOT NULL,
                kind       TEXT NOT NULL,
                extra      TEXT NOT NULL,
                model      TEXT,
                status     TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL
                    REFERENCES conversations(id) ON DELETE CASCADE,
                msg_id          TEXT,
                type            TEXT NOT NULL,
                content         TEXT NOT NULL,
                position        TEXT NOT NULL,
                status          TEXT NOT NULL,
                created_at      INTEGER NOT NULL
            );
        ",
        rollback: "
            DROP TABLE IF EXISTS messages;
            DROP TABLE IF EXISTS conversations;
            DROP TABLE IF EXISTS users;
        ",
    },
    Migration {
        version: 2,
        up: "
            CREATE INDEX IF NOT EXISTS idx_conversations_user_updated
                ON conversations(user_id, updated_at DESC);
            CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
                ON messages(conversation_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_msg_id
                ON messages(conversation_id, msg_id);
        ",
        rollback: "
            DROP INDEX IF EXISTS idx_messages_msg_id;
            DROP INDEX IF EXISTS idx_messages_conversation_created;
            DROP INDEX IF EXISTS idx_conversations_user_updated;
        ",
    },
];

/// Highest version the binary knows about.
pub fn target_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}
