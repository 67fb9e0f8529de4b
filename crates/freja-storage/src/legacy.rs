// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Read-only view of the legacy per-conversation JSON history files.
//!
//! Older client versions persisted each conversation as
//! `history/<conversation_id>.json`. SQL is authoritative; these files are
//! only a one-time migration source. The read path backfills SQL and
//! leaves the JSON in place; deletion is an explicit compaction concern
//! owned by the embedder, never this module.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::types::{
    Conversation, ConversationExtra, ConversationKind, ConversationStatus, MessageContent,
    MessageStatus, Position, StoredMessage,
};
use crate::db::from_millis;

/// The on-disk shape written by the legacy client (camelCase keys).
#[derive(Debug, Deserialize)]
struct LegacyFile {
    conversation: LegacyConversation,
    #[serde(default)]
    messages: Vec<LegacyMessage>,
}

#[derive(Debug, Deserialize)]
struct LegacyConversation {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    extra: Value,
    #[serde(default)]
    model: Option<Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "createTime", default)]
    create_time: i64,
    #[serde(rename = "modifyTime", default)]
    modify_time: i64,
}

#[derive(Debug, Deserialize)]
struct LegacyMessage {
    id: String,
    #[serde(default)]
    msg_id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    position: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "createdAt", default)]
    created_at: i64,
}

/// A fully decoded legacy conversation ready for backfill.
#[derive(Debug)]
pub struct LegacyRecord {
    pub conversation: Conversation,
    pub messages: Vec<StoredMessage>,
}

/// Accessor over the legacy history directory.
#[derive(Debug, Clone)]
pub struct LegacyStore {
    dir: PathBuf,
}

impl LegacyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Conversation ids present in the legacy directory.
    pub fn list_ids(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    path.file_stem().map(|s| s.to_string_lossy().into_owned())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Load one conversation and its messages. `None` when the file does
    /// not exist; decode failures are logged and also return `None` (a
    /// broken legacy file must not block the SQL path).
    pub fn load(&self, id: &str) -> Option<LegacyRecord> {
        let path = self.dir.join(format!("{id}.json"));
        let text = std::fs::read_to_string(&path).ok()?;
        let file: LegacyFile = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable legacy history file");
                return None;
            }
        };
        debug!(conversation_id = %id, messages = file.messages.len(), "legacy record loaded");
        Some(decode(file))
    }
}

fn decode(file: LegacyFile) -> LegacyRecord {
    let lc = file.conversation;
    let extra: ConversationExtra = serde_json::from_value(lc.extra).unwrap_or_default();
    let conversation = Conversation {
        id: lc.id.clone(),
        user_id: crate::users::SYSTEM_USER_ID.to_string(),
        name: lc.name,
        kind: ConversationKind::parse(&lc.kind).unwrap_or(ConversationKind::Integrated),
        extra,
        model: lc.model,
        status: lc
            .status
            .as_deref()
            .and_then(ConversationStatus::parse)
            .unwrap_or(ConversationStatus::Finished),
        create_time: from_millis(lc.create_time),
        modify_time: from_millis(lc.modify_time),
    };

    let messages = file
        .messages
        .into_iter()
        .filter_map(|m| decode_message(&conversation.id, m))
        .collect();

    LegacyRecord {
        conversation,
        messages,
    }
}

fn decode_message(conversation_id: &str, m: LegacyMessage) -> Option<StoredMessage> {
    // Recombine the split (type, content) pair into the tagged sum. Rows
    // whose type the current schema no longer knows are dropped with a
    // warning rather than failing the whole migration.
    let mut tagged = match m.content {
        Value::Object(map) => Value::Object(map),
        other => serde_json::json!({ "content": other }),
    };
    tagged["type"] = Value::String(m.kind.clone());
    let content: MessageContent = match serde_json::from_value(tagged) {
        Ok(c) => c,
        Err(e) => {
            warn!(message_id = %m.id, kind = %m.kind, error = %e, "skipping legacy message");
            return None;
        }
    };
    Some(StoredMessage {
        id: m.id,
        conversation_id: conversation_id.to_string(),
        msg_id: m.msg_id,
        content,
        position: m
            .position
            .as_deref()
            .and_then(Position::parse)
            .unwrap_or(Position::Left),
        status: m
            .status
            .as_deref()
            .and_then(MessageStatus::parse)
            .unwrap_or(MessageStatus::Finish),
        created_at: from_millis(m.created_at),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
