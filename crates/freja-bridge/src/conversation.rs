// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `conversation:*` channels: lifecycle, sends, confirmations, and the
//! workspace helpers.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use freja_storage::{
    Conversation, ConversationExtra, ConversationKind, ConversationStatus, ConversationUpdate,
    StoredMessage,
};
use freja_workers::{Confirmation, EventKind, SendRequest, WorkerEvent};

use crate::bus::{LocalBus, Reply};
use crate::Services;

fn parse<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, Reply> {
    serde_json::from_value(payload).map_err(|e| Reply::err(format!("invalid payload: {e}")))
}

macro_rules! try_parse {
    ($payload:expr) => {
        match parse($payload) {
            Ok(v) => v,
            Err(reply) => return reply,
        }
    };
}

#[derive(Debug, Deserialize)]
struct CreatePayload {
    name: String,
    #[serde(rename = "type")]
    kind: ConversationKind,
    #[serde(default)]
    extra: ConversationExtra,
    #[serde(default)]
    model: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CreateWithPayload {
    conversation: CreatePayload,
    #[serde(rename = "sourceConversationId", default)]
    source_conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdPayload {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ResetPayload {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkspacePayload {
    workspace: std::path::PathBuf,
}

#[derive(Debug, Deserialize)]
struct UpdatePayload {
    id: String,
    #[serde(default)]
    updates: UpdateFields,
    #[serde(rename = "mergeExtra", default)]
    merge_extra: bool,
}

#[derive(Debug, Default, Deserialize)]
struct UpdateFields {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    extra: Option<ConversationExtra>,
    /// `null` clears the model; absent leaves it alone.
    #[serde(default, with = "double_option")]
    model: Option<Option<Value>>,
    #[serde(default)]
    status: Option<ConversationStatus>,
}

/// Distinguishes "absent" from "present but null" for patch semantics.
mod double_option {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<Value>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(de)?;
        Ok(Some(match value {
            Some(Value::Null) | None => None,
            Some(v) => Some(v),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct SendPayload {
    id: String,
    input: String,
    #[serde(default)]
    msg_id: Option<String>,
    #[serde(default)]
    files: Option<Vec<std::path::PathBuf>>,
    #[serde(rename = "loadingId", default)]
    loading_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfirmPayload {
    id: String,
    #[serde(rename = "confirmKey")]
    confirm_key: String,
    msg_id: String,
    #[serde(rename = "callId")]
    call_id: String,
}

fn build_conversation(payload: CreatePayload) -> Conversation {
    let mut conversation = Conversation::new(payload.name, payload.kind, payload.extra);
    conversation.model = payload.model;
    conversation
}

async fn create(services: &Services, payload: CreatePayload) -> anyhow::Result<Conversation> {
    let conversation = build_conversation(payload);
    services.storage.create_conversation(&conversation)?;
    services.manager.build_conversation(&conversation).await?;
    Ok(conversation)
}

/// Copy the source's message log onto `target`, returning whether the
/// copy is count-complete.
fn migrate_messages(
    services: &Services,
    source_id: &str,
    target_id: &str,
) -> anyhow::Result<bool> {
    let source_total = services.storage.count_conversation_messages(source_id)?;
    let mut page = 1u32;
    loop {
        let batch = services
            .storage
            .get_conversation_messages(source_id, page, 200)?;
        for message in &batch.data {
            let copy = StoredMessage {
                id: uuid::Uuid::new_v4().to_string(),
                conversation_id: target_id.to_string(),
                ..message.clone()
            };
            services.storage.insert_message(&copy)?;
        }
        if !batch.has_more {
            break;
        }
        page += 1;
    }
    let copied = services.storage.count_conversation_messages(target_id)?;
    Ok(copied == source_total)
}

pub async fn register(bus: &Arc<LocalBus>, services: Arc<Services>) {
    let s = Arc::clone(&services);
    bus.register("conversation:create", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: CreatePayload = try_parse!(payload);
            Reply::from_result(create(&s, payload).await)
        }
    })
    .await;

    let s = Arc::clone(&services);
    bus.register("conversation:createWithConversation", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: CreateWithPayload = try_parse!(payload);
            let conversation = match create(&s, payload.conversation).await {
                Ok(c) => c,
                Err(e) => return Reply::err(e.to_string()),
            };

            // Workspace migration: copy the old log, then delete the
            // source, but only when the copy passes the count parity
            // check. A short copy leaves the source intact so nothing is
            // lost.
            let mut source_deleted = false;
            let mut inconsistency = None;
            if let Some(source_id) = payload.source_conversation_id {
                match migrate_messages(&s, &source_id, &conversation.id) {
                    Ok(true) => {
                        s.manager.kill(&source_id).await;
                        if let Err(e) = s.storage.delete_conversation(&source_id) {
                            inconsistency = Some(format!("source delete failed: {e}"));
                        } else {
                            source_deleted = true;
                        }
                    }
                    Ok(false) => {
                        inconsistency =
                            Some("message counts differ after migration; source kept".to_string());
                        warn!(source = %source_id, target = %conversation.id, "migration parity check failed");
                    }
                    Err(e) => {
                        inconsistency = Some(format!("migration failed: {e}"));
                    }
                }
            }
            Reply::ok(json!({
                "conversation": conversation,
                "sourceDeleted": source_deleted,
                "inconsistency": inconsistency,
            }))
        }
    })
    .await;

    let s = Arc::clone(&services);
    bus.register("conversation:get", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: IdPayload = try_parse!(payload);
            match s.storage.get_conversation(&payload.id) {
                Ok(Some(c)) => Reply::ok(c),
                Ok(None) => Reply::err(format!("conversation {} not found", payload.id)),
                Err(e) => Reply::err(e.to_string()),
            }
        }
    })
    .await;

    let s = Arc::clone(&services);
    bus.register("conversation:getAssociateConversation", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: WorkspacePayload = try_parse!(payload);
            Reply::from_result(s.storage.get_conversations_by_workspace(&payload.workspace))
        }
    })
    .await;

    let s = Arc::clone(&services);
    bus.register("conversation:remove", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: IdPayload = try_parse!(payload);
            s.manager.kill(&payload.id).await;
            Reply::from_result(s.storage.delete_conversation(&payload.id))
        }
    })
    .await;

    let s = Arc::clone(&services);
    bus.register("conversation:update", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: UpdatePayload = try_parse!(payload);
            let before = match s.storage.get_conversation(&payload.id) {
                Ok(Some(c)) => c,
                Ok(None) => return Reply::err(format!("conversation {} not found", payload.id)),
                Err(e) => return Reply::err(e.to_string()),
            };

            let extra = match (payload.updates.extra, payload.merge_extra) {
                (Some(new_extra), true) => Some(merge_extra(&before.extra, &new_extra)),
                (Some(new_extra), false) => Some(new_extra),
                (None, _) => None,
            };
            let update = ConversationUpdate {
                name: payload.updates.name,
                extra,
                model: payload.updates.model.clone(),
                status: payload.updates.status,
            };

            let after = match s.storage.update_conversation(&payload.id, &update) {
                Ok(c) => c,
                Err(e) => return Reply::err(e.to_string()),
            };
            s.manager
                .on_conversation_updated(before.model.as_ref(), after.model.as_ref(), &payload.id)
                .await;
            Reply::ok(after)
        }
    })
    .await;

    let s = Arc::clone(&services);
    bus.register("conversation:reset", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: ResetPayload = try_parse!(payload);
            s.manager.reset(payload.id.as_deref()).await;
            Reply::ok_empty()
        }
    })
    .await;

    let s = Arc::clone(&services);
    bus.register("conversation:stop", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: IdPayload = try_parse!(payload);
            match s.manager.get_task_by_id(&payload.id).await {
                Some(worker) => {
                    worker.stop().await;
                    Reply::ok_empty()
                }
                None => Reply::err(format!("no live worker for {}", payload.id)),
            }
        }
    })
    .await;

    let s = Arc::clone(&services);
    bus.register("conversation:sendMessage", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: SendPayload = try_parse!(payload);
            let worker = match s.manager.get_task_by_id_rollback_build(&payload.id).await {
                Ok(Some(w)) => w,
                Ok(None) => return Reply::err(format!("conversation {} not found", payload.id)),
                Err(e) => return Reply::err(e.to_string()),
            };
            let msg_id = payload
                .msg_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let request = SendRequest {
                input: payload.input,
                msg_id: msg_id.clone(),
                files: payload.files,
                loading_id: payload.loading_id,
            };
            match worker.send_message(request).await {
                Ok(()) => Reply::ok(json!({"msg_id": msg_id})),
                Err(e) => {
                    // Failed sends are never silent: one center tips row
                    // lands in the conversation alongside the error reply.
                    let _ = s
                        .pipeline
                        .ingest(WorkerEvent::new(
                            EventKind::Error,
                            json!(e.to_string()),
                            msg_id,
                            &payload.id,
                        ))
                        .await;
                    Reply::err(e.to_string())
                }
            }
        }
    })
    .await;

    let s = Arc::clone(&services);
    bus.register("conversation:confirmMessage", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: ConfirmPayload = try_parse!(payload);
            let worker = match s.manager.get_task_by_id(&payload.id).await {
                Some(w) => w,
                None => return Reply::err(format!("no live worker for {}", payload.id)),
            };
            Reply::from_result(
                worker
                    .confirm_message(Confirmation {
                        confirm_key: payload.confirm_key,
                        msg_id: payload.msg_id,
                        call_id: payload.call_id,
                    })
                    .await
                    .map(|_| json!({})),
            )
        }
    })
    .await;

    let s = Arc::clone(&services);
    bus.register("conversation:getWorkspace", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: IdPayload = try_parse!(payload);
            match s.storage.get_conversation(&payload.id) {
                Ok(Some(c)) => Reply::ok(json!({"workspace": c.extra.workspace})),
                Ok(None) => Reply::err(format!("conversation {} not found", payload.id)),
                Err(e) => Reply::err(e.to_string()),
            }
        }
    })
    .await;

    let s = Arc::clone(&services);
    bus.register("conversation:reloadContext", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: IdPayload = try_parse!(payload);
            let worker = match s.manager.get_task_by_id_rollback_build(&payload.id).await {
                Ok(Some(w)) => w,
                Ok(None) => return Reply::err(format!("conversation {} not found", payload.id)),
                Err(e) => return Reply::err(e.to_string()),
            };
            Reply::from_result(worker.reload_context().await.map(|_| json!({})))
        }
    })
    .await;
}

/// Overlay `patch` on `base` key by key (JS spread semantics), keeping
/// unknown keys from both sides.
fn merge_extra(base: &ConversationExtra, patch: &ConversationExtra) -> ConversationExtra {
    let base_v = serde_json::to_value(base).unwrap_or(Value::Null);
    let patch_v = serde_json::to_value(patch).unwrap_or(Value::Null);
    let merged = match (base_v, patch_v) {
        (Value::Object(mut dst), Value::Object(src)) => {
            for (k, v) in src {
                if !v.is_null() {
                    dst.insert(k, v);
                }
            }
            Value::Object(dst)
        }
        (_, patch_v) => patch_v,
    };
    serde_json::from_value(merged).unwrap_or_else(|_| patch.clone())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_extra_overlays_and_preserves() {
        let mut base = ConversationExtra::default();
        base.workspace = "/old".into();
        base.rules = Some("be kind".into());

        let mut patch = ConversationExtra::default();
        patch.workspace = "/new".into();

        let merged = merge_extra(&base, &patch);
        assert_eq!(merged.workspace, std::path::PathBuf::from("/new"));
        assert_eq!(merged.rules.as_deref(), Some("be kind"));
    }

    #[test]
    fn update_fields_distinguish_null_from_absent() {
        let absent: UpdateFields = serde_json::from_value(json!({})).unwrap();
        assert!(absent.model.is_none());

        let cleared: UpdateFields = serde_json::from_value(json!({"model": null})).unwrap();
        assert_eq!(cleared.model, Some(None));

        let set: UpdateFields = serde_json::from_value(json!({"model": {"id": "x"}})).unwrap();
        assert_eq!(set.model, Some(Some(json!({"id": "x"}))));
    }
}
