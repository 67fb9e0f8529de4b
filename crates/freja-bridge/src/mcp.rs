// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `mcp:*` channels: thin adapters over the multiplexer.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use freja_mcp::{AgentTarget, McpServer};

use crate::bus::{LocalBus, Reply};
use crate::Services;

#[derive(Debug, Deserialize)]
struct AgentsPayload {
    agents: Vec<AgentTarget>,
}

#[derive(Debug, Deserialize)]
struct SyncPayload {
    servers: Vec<McpServer>,
    agents: Vec<AgentTarget>,
}

#[derive(Debug, Deserialize)]
struct RemovePayload {
    name: String,
    agents: Vec<AgentTarget>,
}

#[derive(Debug, Deserialize)]
struct TestPayload {
    server: McpServer,
}

fn parse<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, Reply> {
    serde_json::from_value(payload).map_err(|e| Reply::err(format!("invalid payload: {e}")))
}

pub async fn register(bus: &Arc<LocalBus>, services: Arc<Services>) {
    let s = Arc::clone(&services);
    bus.register("mcp:getAgentMcpConfigs", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: AgentsPayload = match parse(payload) {
                Ok(p) => p,
                Err(reply) => return reply,
            };
            Reply::ok(s.mcp.get_agent_mcp_configs(&payload.agents).await)
        }
    })
    .await;

    let s = Arc::clone(&services);
    bus.register("mcp:testMcpConnection", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: TestPayload = match parse(payload) {
                Ok(p) => p,
                Err(reply) => return reply,
            };
            Reply::ok(s.mcp.test_connection(&payload.server).await)
        }
    })
    .await;

    let s = Arc::clone(&services);
    bus.register("mcp:syncMcpToAgents", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: SyncPayload = match parse(payload) {
                Ok(p) => p,
                Err(reply) => return reply,
            };
            Reply::ok(
                s.mcp
                    .sync_mcp_to_agents(&payload.servers, &payload.agents)
                    .await,
            )
        }
    })
    .await;

    let s = Arc::clone(&services);
    bus.register("mcp:removeMcpFromAgents", move |payload| {
        let s = Arc::clone(&s);
        async move {
            let payload: RemovePayload = match parse(payload) {
                Ok(p) => p,
                Err(reply) => return reply,
            };
            Reply::ok(
                s.mcp
                    .remove_mcp_from_agents(&payload.name, &payload.agents)
                    .await,
            )
        }
    })
    .await;
}
