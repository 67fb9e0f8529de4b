// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use crate::db::{from_millis, millis, Storage};
use crate::error::StorageError;
use crate::types::{MessageStatus, Page, Position, StoredMessage};
use crate::Result;

struct RawMessage {
    id: String,
    conversation_id: String,
    msg_id: Option<String>,
    content: String,
    position: String,
    status: String,
    created_at: i64,
}

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok(RawMessage {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        msg_id: row.get("msg_id")?,
        content: row.get("content")?,
        position: row.get("position")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
    })
}

fn hydrate(raw: RawMessage) -> Result<StoredMessage> {
    Ok(StoredMessage {
        content: serde_json::from_str(&raw.content)?,
        position: Position::parse(&raw.position)
            .ok_or_else(|| StorageError::not_found(format!("position {}", raw.position)))?,
        status: MessageStatus::parse(&raw.status)
            .ok_or_else(|| StorageError::not_found(format!("status {}", raw.status)))?,
        id: raw.id,
        conversation_id: raw.conversation_id,
        msg_id: raw.msg_id,
        created_at: from_millis(raw.created_at),
    })
}

const SELECT_COLS: &str =
    "id, conversation_id, msg_id, type, content, position, status, created_at";

impl Storage {
    /// Insert a message row and touch the owning conversation.
    pub fn insert_message(&self, m: &StoredMessage) -> Result<()> {
        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO messages
                     (id, conversation_id, msg_id, type, content, position, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    m.id,
                    m.conversation_id,
                    m.msg_id,
                    m.content.type_tag(),
                    serde_json::to_string(&m.content)?,
                    m.position.as_str(),
                    m.status.as_str(),
                    millis(m.created_at),
                ],
            )?;
        }
        self.touch_conversation(&m.conversation_id)?;
        Ok(())
    }

    /// Replace the mutable columns of an existing row.
    pub fn update_message(&self, id: &str, m: &StoredMessage) -> Result<()> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE messages
             SET msg_id = ?2, type = ?3, content = ?4, position = ?5, status = ?6
             WHERE id = ?1",
            params![
                id,
                m.msg_id,
                m.content.type_tag(),
                serde_json::to_string(&m.content)?,
                m.position.as_str(),
                m.status.as_str(),
            ],
        )?;
        if n == 0 {
            return Err(StorageError::not_found(format!("message {id}")));
        }
        Ok(())
    }

    pub fn delete_message(&self, id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn delete_conversation_messages(&self, conversation_id: &str) -> Result<u64> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        debug!(%conversation_id, deleted = n, "conversation messages deleted");
        Ok(n as u64)
    }

    /// One page of a conversation's log in arrival order. `page` is 1-based.
    pub fn get_conversation_messages(
        &self,
        conversation_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Page<StoredMessage>> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let conn = self.lock();
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get::<_, i64>(0).map(|n| n as u64),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let offset = (page as i64 - 1) * page_size as i64;
        let rows = stmt.query_map(params![conversation_id, page_size as i64, offset], read_raw)?;

        let mut data = Vec::new();
        for row in rows {
            data.push(hydrate(row?)?);
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

    /// Most recent row carrying this logical chunk id: the streaming
    /// upsert read path.
    pub fn get_message_by_msg_id(
        &self,
        conversation_id: &str,
        msg_id: &str,
    ) -> Result<Option<StoredMessage>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLS} FROM messages
                     WHERE conversation_id = ?1 AND msg_id = ?2
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT 1"
                ),
                params![conversation_id, msg_id],
                read_raw,
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(hydrate(raw)?)),
            None => Ok(None),
        }
    }

    pub fn count_conversation_messages(&self, conversation_id: &str) -> Result<u64> {
        let conn = self.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
