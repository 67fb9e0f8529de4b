// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transport flavor, without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Sse,
    Http,
    StreamableHttp,
}

/// How to reach an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl McpTransport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Sse { .. } => TransportKind::Sse,
            Self::Http { .. } => TransportKind::Http,
            Self::StreamableHttp { .. } => TransportKind::StreamableHttp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Connected,
    Disconnected,
}

/// One detected or configured MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServer {
    pub id: String,
    pub name: String,
    pub transport: McpTransport,
    /// Tool names enumerated from a live probe; empty when unreachable.
    #[serde(default)]
    pub tools: Vec<String>,
    pub enabled: bool,
    pub status: ServerStatus,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    /// The raw config entry as the owning tool stores it.
    #[serde(rename = "originalJson", default, skip_serializing_if = "Option::is_none")]
    pub original_json: Option<Value>,
}

impl McpServer {
    pub fn new(name: impl Into<String>, transport: McpTransport) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            transport,
            tools: Vec::new(),
            enabled: true,
            status: ServerStatus::Disconnected,
            created_at: now,
            updated_at: now,
            description: String::new(),
            original_json: None,
        }
    }
}

/// Outcome of probing one server's transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionTest {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The endpoint answered 401 with a challenge; OAuth is required
    /// before tools can be listed.
    #[serde(rename = "needsAuth", default, skip_serializing_if = "Option::is_none")]
    pub needs_auth: Option<bool>,
    #[serde(rename = "authMethod", default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
    #[serde(
        rename = "wwwAuthenticate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub www_authenticate: Option<String>,
}

impl ConnectionTest {
    pub fn ok(tools: Vec<String>) -> Self {
        Self {
            success: true,
            tools: Some(tools),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn unauthorized(challenge: impl Into<String>) -> Self {
        let challenge = challenge.into();
        let auth_method = challenge
            .split_whitespace()
            .next()
            .unwrap_or("Bearer")
            .to_string();
        Self {
            success: false,
            error: Some("authentication required".into()),
            needs_auth: Some(true),
            auth_method: Some(auth_method),
            www_authenticate: Some(challenge),
            ..Default::default()
        }
    }
}

/// Per-server outcome of a batch install.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallReport {
    pub name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True when the server was skipped (unsupported transport), not
    /// attempted and failed.
    #[serde(default)]
    pub skipped: bool,
}

/// Per-agent outcome of a fan-out operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub installs: Vec<InstallReport>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
