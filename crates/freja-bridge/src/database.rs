// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `database:*` channels: paged reads straight off the storage layer.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::bus::{LocalBus, Reply};
use crate::Services;

const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Deserialize)]
struct MessagesPayload {
    #[serde(rename = "conversationId")]
    conversation_id: String,
    #[serde(default)]
    page: Option<u32>,
    #[serde(rename = "pageSize", default)]
    page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ConversationsPayload {
    #[serde(default)]
    page: Option<u32>,
    #[serde(rename = "pageSize", default)]
    page_size: Option<u32>,
}

fn parse<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, Reply> {
    serde_json::from_value(payload).map_err(|e| Reply::err(format!("invalid payload: {e}")))
}

pub async fn register(bus: &Arc<LocalBus>, services: Arc<Services>) {
    let s = Arc::clone(&services);
    bus.register("database:getConversationMessages", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: MessagesPayload = match parse(payload) {
                Ok(p) => p,
                Err(reply) => return reply,
            };
            Reply::from_result(s.storage.get_conversation_messages(
                &payload.conversation_id,
                payload.page.unwrap_or(1),
                payload.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            ))
        }
    })
    .await;

    let s = Arc::clone(&services);
    bus.register("database:getUserConversations", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: ConversationsPayload = match parse(payload) {
                Ok(p) => p,
                Err(reply) => return reply,
            };
            Reply::from_result(s.storage.get_user_conversations(
                freja_storage::SYSTEM_USER_ID,
                payload.page.unwrap_or(1),
                payload.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            ))
        }
    })
    .await;
}
