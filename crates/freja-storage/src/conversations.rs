// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use crate::db::{from_millis, millis, Storage};
use crate::error::StorageError;
use crate::types::{
    Conversation, ConversationExtra, ConversationKind, ConversationStatus, ConversationUpdate,
    Page,
};
use crate::Result;

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<(Conversation, String, String)> {
    // Returns the parsed blobs separately so serde errors surface as
    // StorageError::Serde instead of being shoehorned into rusqlite's.
    Ok((
        Conversation {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            kind: ConversationKind::Integrated, // patched below
            extra: ConversationExtra::default(),
            model: None,
            status: ConversationStatus::Pending, // patched below
            create_time: from_millis(row.get("created_at")?),
            modify_time: from_millis(row.get("updated_at")?),
        },
        row.get("kind")?,
        row.get("status")?,
    ))
}

fn hydrate(
    mut parts: (Conversation, String, String),
    extra: String,
    model: Option<String>,
) -> Result<Conversation> {
    parts.0.kind = ConversationKind::parse(&parts.1)
        .ok_or_else(|| StorageError::not_found(format!("conversation kind {}", parts.1)))?;
    parts.0.status = ConversationStatus::parse(&parts.2)
        .ok_or_else(|| StorageError::not_found(format!("conversation status {}", parts.2)))?;
    parts.0.extra = serde_json::from_str(&extra)?;
    parts.0.model = match model {
        Some(text) => Some(serde_json::from_str(&text)?),
        None => None,
    };
    Ok(parts.0)
}

impl Storage {
    pub fn create_conversation(&self, c: &Conversation) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO conversations
                 (id, user_id, name, kind, extra, model, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                c.id,
                c.user_id,
                c.name,
                c.kind.as_str(),
                serde_json::to_string(&c.extra)?,
                c.model
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                c.status.as_str(),
                millis(c.create_time),
                millis(c.modify_time),
            ],
        )?;
        debug!(conversation_id = %c.id, kind = c.kind.as_str(), "conversation created");
        Ok(())
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.lock();
        let found = conn
            .query_row(
                "SELECT id, user_id, name, kind, extra, model, status, created_at, updated_at
                 FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    let parts = row_to_conversation(row)?;
                    let extra: String = row.get("extra")?;
                    let model: Option<String> = row.get("model")?;
                    Ok((parts, extra, model))
                },
            )
            .optional()?;
        match found {
            Some((parts, extra, model)) => Ok(Some(hydrate(parts, extra, model)?)),
            None => Ok(None),
        }
    }

    /// Conversations for one user, newest activity first. `page` is 1-based.
    pub fn get_user_conversations(
        &self,
        user_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Page<Conversation>> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let conn = self.lock();
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM conversations WHERE user_id = ?1",
            params![user_id],
            |row| row.get::<_, i64>(0).map(|n| n as u64),
        )?;

        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, kind, extra, model, status, created_at, updated_at
             FROM conversations WHERE user_id = ?1
             ORDER BY updated_at DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let offset = (page as i64 - 1) * page_size as i64;
        let rows = stmt.query_map(params![user_id, page_size as i64, offset], |row| {
            let parts = row_to_conversation(row)?;
            let extra: String = row.get("extra")?;
            let model: Option<String> = row.get("model")?;
            Ok((parts, extra, model))
        })?;

        let mut data = Vec::new();
        for row in rows {
            let (parts, extra, model) = row?;
            data.push(hydrate(parts, extra, model)?);
        }
        let has_more = (offset as u64) + (data.len() as u64) < total;
        Ok(Page {
            data,
            total,
            page,
            page_size,
            has_more,
        })
    }

    /// Patch columns named in `updates`, then advance `updated_at`.
    ///
    /// `modify_time` is strictly monotonic: even an empty patch moves it
    /// forward, and a clock step backwards cannot move it back.
    pub fn update_conversation(&self, id: &str, updates: &ConversationUpdate) -> Result<Conversation> {
        let existing = self
            .get_conversation(id)?
            .ok_or_else(|| StorageError::not_found(format!("conversation {id}")))?;

        let name = updates.name.clone().unwrap_or(existing.name);
        let extra = updates.extra.clone().unwrap_or(existing.extra);
        let model = match &updates.model {
            Some(new_model) => new_model.clone(),
            None => existing.model,
        };
        let status = updates.status.unwrap_or(existing.status);
        let updated_at = millis(Utc::now()).max(millis(existing.modify_time) + 1);

        {
            let conn = self.lock();
            conn.execute(
                "UPDATE conversations
                 SET name = ?2, extra = ?3, model = ?4, status = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![
                    id,
                    name,
                    serde_json::to_string(&extra)?,
                    model.as_ref().map(serde_json::to_string).transpose()?,
                    status.as_str(),
                    updated_at,
                ],
            )?;
        }
        self.get_conversation(id)?
            .ok_or_else(|| StorageError::not_found(format!("conversation {id}")))
    }

    /// Bump `updated_at` only. Called on message appends.
    pub fn touch_conversation(&self, id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE conversations
             SET updated_at = MAX(?2, updated_at + 1)
             WHERE id = ?1",
            params![id, millis(Utc::now())],
        )?;
        Ok(())
    }

    /// Delete the conversation; its messages cascade.
    pub fn delete_conversation(&self, id: &str) -> Result<()> {
        let conn = self.lock();
        let n = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        debug!(conversation_id = %id, deleted = n, "conversation deleted");
        Ok(())
    }

    /// All conversations whose workspace equals `workspace`, newest first.
    pub fn get_conversations_by_workspace(&self, workspace: &Path) -> Result<Vec<Conversation>> {
        // `extra` is opaque to SQL, so filter in memory. Conversation
        // counts are small (one desktop user).
        let all = self.get_user_conversations(crate::users::SYSTEM_USER_ID, 1, u32::MAX)?;
        Ok(all
            .data
            .into_iter()
            .filter(|c| c.extra.workspace == workspace)
            .collect())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
