// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Event → message pipeline.
//!
//! Every worker emission passes through here exactly once, in emission
//! order per conversation. The event is mirrored onto the UI bus first
//! (fire-and-forget), then persisted:
//!
//! - `content` rides the coalescing buffer's `msg_id` upsert path;
//! - tool-flavored types go through the composer's merge;
//! - `start` / `thought` persist nothing; `finish` seals the stream
//!   buffer entry and marks the row finished.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use freja_storage::{
    MessageContent, MessageStatus, Position, Storage, StoredMessage, TipsKind,
};
use freja_stream::{compose, AppendMode, StreamBuffer};

use crate::events::{EventBus, EventKind, WorkerEvent};
use crate::{Result, WorkerError};

pub struct Pipeline {
    storage: Arc<Storage>,
    buffer: Arc<StreamBuffer>,
    bus: EventBus,
}

impl Pipeline {
    pub fn new(storage: Arc<Storage>, buffer: Arc<StreamBuffer>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            storage,
            buffer,
            bus,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Route one event. The bus sees every event, including the
    /// non-persisted lifecycle kinds; storage sees only the mapped ones.
    pub async fn ingest(&self, event: WorkerEvent) -> Result<()> {
        self.bus.emit(event.clone());

        let WorkerEvent {
            kind,
            data,
            msg_id,
            conversation_id,
        } = event;

        match kind {
            EventKind::Start | EventKind::Thought => Ok(()),

            EventKind::Finish => {
                self.buffer.finish(&msg_id).await;
                if let Some(mut row) = self
                    .storage
                    .get_message_by_msg_id(&conversation_id, &msg_id)?
                {
                    row.status = MessageStatus::Finish;
                    self.storage.update_message(&row.id.clone(), &row)?;
                }
                Ok(())
            }

            EventKind::Content => {
                // Plain string → delta append. Object form lets a worker
                // push a full snapshot (`{"content": "...", "mode":
                // "replace"}`) over the same msg_id; the Codex dialect
                // ends a streamed answer with the canonical full text.
                let (chunk, mode) = match &data {
                    Value::String(s) => (s.clone(), AppendMode::Accumulate),
                    Value::Object(map) => {
                        let chunk = map
                            .get("content")
                            .and_then(Value::as_str)
                            .ok_or_else(|| {
                                WorkerError::protocol("content event object without content")
                            })?
                            .to_string();
                        let mode = match map.get("mode").and_then(Value::as_str) {
                            Some("replace") => AppendMode::Replace,
                            _ => AppendMode::Accumulate,
                        };
                        (chunk, mode)
                    }
                    other => {
                        return Err(WorkerError::protocol(format!(
                            "content event carries {other}"
                        )))
                    }
                };
                self.buffer
                    .append(
                        &uuid::Uuid::new_v4().to_string(),
                        &msg_id,
                        &conversation_id,
                        &chunk,
                        mode,
                    )
                    .await;
                Ok(())
            }

            EventKind::UserContent => {
                let content = MessageContent::Text {
                    content: as_text(&data)?.to_string(),
                };
                self.insert(
                    &conversation_id,
                    Some(msg_id),
                    content,
                    Position::Right,
                    MessageStatus::Finish,
                )
            }

            EventKind::Error => {
                let content = MessageContent::Tips {
                    content: as_text(&data)?.to_string(),
                    kind: TipsKind::Error,
                };
                self.insert(
                    &conversation_id,
                    Some(msg_id),
                    content,
                    Position::Center,
                    MessageStatus::Error,
                )
            }

            EventKind::AgentStatus => {
                let content: MessageContent =
                    serde_json::from_value(with_tag(data, "agent_status"))
                        .map_err(|e| WorkerError::protocol(format!("agent_status event: {e}")))?;
                self.insert(
                    &conversation_id,
                    Some(msg_id),
                    content,
                    Position::Center,
                    MessageStatus::Finish,
                )
            }

            EventKind::AcpPermission => self.insert(
                &conversation_id,
                Some(msg_id),
                MessageContent::AcpPermission { request: data },
                Position::Left,
                MessageStatus::Pending,
            ),

            EventKind::CodexPermission => self.insert(
                &conversation_id,
                Some(msg_id),
                MessageContent::CodexPermission { request: data },
                Position::Left,
                MessageStatus::Pending,
            ),

            EventKind::ToolCall => {
                let content: MessageContent = serde_json::from_value(with_tag(data, "tool_call"))
                    .map_err(|e| WorkerError::protocol(format!("tool_call event: {e}")))?;
                self.merge(&conversation_id, Some(msg_id), content).await
            }

            EventKind::ToolGroup => {
                let items = match data {
                    Value::Array(items) => Value::Array(items),
                    Value::Object(map) if map.contains_key("items") => {
                        map.get("items").cloned().unwrap_or(Value::Array(vec![]))
                    }
                    other => {
                        return Err(WorkerError::protocol(format!(
                            "tool_group event carries {other}"
                        )))
                    }
                };
                let content: MessageContent =
                    serde_json::from_value(json!({"type": "tool_group", "items": items}))
                        .map_err(|e| WorkerError::protocol(format!("tool_group event: {e}")))?;
                self.merge(&conversation_id, Some(msg_id), content).await
            }

            EventKind::AcpToolCall => {
                let content = MessageContent::AcpToolCall { update: data };
                self.merge(&conversation_id, Some(msg_id), content).await
            }

            EventKind::CodexToolCall => {
                let content: MessageContent =
                    serde_json::from_value(with_tag(data, "codex_tool_call"))
                        .map_err(|e| WorkerError::protocol(format!("codex_tool_call event: {e}")))?;
                self.merge(&conversation_id, Some(msg_id), content).await
            }
        }
    }

    fn insert(
        &self,
        conversation_id: &str,
        msg_id: Option<String>,
        content: MessageContent,
        position: Position,
        status: MessageStatus,
    ) -> Result<()> {
        let message = StoredMessage::new(conversation_id, msg_id, content, position, status);
        self.storage.insert_message(&message)?;
        Ok(())
    }

    /// Composer path: merge into the conversation's current list and
    /// persist exactly the rows the merge touched.
    async fn merge(
        &self,
        conversation_id: &str,
        msg_id: Option<String>,
        content: MessageContent,
    ) -> Result<()> {
        let existing = self
            .storage
            .get_conversation_messages(conversation_id, 1, u32::MAX)?
            .data;
        let incoming = StoredMessage::new(
            conversation_id,
            msg_id,
            content,
            Position::Left,
            MessageStatus::Work,
        );
        let outcome = compose::merge_into(&existing, incoming);

        for row in &outcome.updated {
            if let Err(e) = self.storage.update_message(&row.id, row) {
                warn!(message_id = %row.id, error = %e, "merge update failed");
            }
        }
        if let Some(row) = &outcome.appended {
            self.storage.insert_message(row)?;
        }
        debug!(
            %conversation_id,
            updated = outcome.updated.len(),
            appended = outcome.appended.is_some(),
            "tool message merged"
        );
        Ok(())
    }
}

fn as_text(data: &Value) -> Result<&str> {
    data.as_str()
        .ok_or_else(|| WorkerError::protocol(format!("expected string payload, got {data}")))
}

/// Attach the serde tag so the event body parses as [`MessageContent`].
fn with_tag(data: Value, tag: &str) -> Value {
    match data {
        Value::Object(mut map) => {
            map.insert("type".into(), Value::String(tag.into()));
            Value::Object(map)
        }
        other => other,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
