// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which runtime drives a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// In-process generator loop.
    Integrated,
    /// External CLI agent over the Agent-Client Protocol.
    Acp,
    /// External Codex CLI agent.
    Codex,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integrated => "integrated",
            Self::Acp => "acp",
            Self::Codex => "codex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "integrated" => Some(Self::Integrated),
            "acp" => Some(Self::Acp),
            "codex" => Some(Self::Codex),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Pending,
    Running,
    Finished,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }
}

/// Per-conversation settings the workers need at build time.
///
/// Persisted as an opaque JSON blob; only `workspace` is load-bearing for
/// the core, the rest rides along for the worker variants and the UI.
/// Unknown keys written by newer UI versions survive round-trips via the
/// flattened remainder.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversationExtra {
    #[serde(default)]
    pub workspace: PathBuf,
    /// Preset rule text injected into the integrated agent's context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<String>,
    /// Enabled skill names for the integrated agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skills: Option<Vec<String>>,
    /// Preset context injected ahead of the first turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset_context: Option<String>,
    /// Backend selector for ACP conversations (which agent CLI to drive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Override path of the agent CLI executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<PathBuf>,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

/// A durable conversation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub kind: ConversationKind,
    pub extra: ConversationExtra,
    /// Model selection blob, integrated conversations only. Opaque to the
    /// storage layer; the worker manager compares it for rebuild decisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<Value>,
    pub status: ConversationStatus,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
}

impl Conversation {
    /// Fresh pending conversation with generated id and current timestamps.
    pub fn new(name: impl Into<String>, kind: ConversationKind, extra: ConversationExtra) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: crate::users::SYSTEM_USER_ID.to_string(),
            name: name.into(),
            kind,
            extra,
            model: None,
            status: ConversationStatus::Pending,
            create_time: now,
            modify_time: now,
        }
    }
}

/// Field patch for `update_conversation`. `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct ConversationUpdate {
    pub name: Option<String>,
    pub extra: Option<ConversationExtra>,
    pub model: Option<Option<Value>>,
    pub status: Option<ConversationStatus>,
}

/// Where the UI renders a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    Left,
    Right,
    Center,
    Pop,
}

impl Position {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Center => "center",
            Self::Pop => "pop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            "center" => Some(Self::Center),
            "pop" => Some(Self::Pop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Work,
    Finish,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Work => "work",
            Self::Finish => "finish",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "work" => Some(Self::Work),
            "finish" => Some(Self::Finish),
            "error" => Some(Self::Error),
        _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TipsKind {
    Error,
    Success,
    Warning,
}

/// One element of a tool group. `call_id` is the merge key; later updates
/// for the same call shallow-merge over earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolGroupItem {
    #[serde(rename = "callId")]
    pub call_id: String,
    #[serde(default)]
    pub description: String,
    pub name: String,
    #[serde(rename = "renderOutputAsMarkdown", default)]
    pub render_output_as_markdown: bool,
    #[serde(rename = "resultDisplay", default, skip_serializing_if = "Option::is_none")]
    pub result_display: Option<Value>,
    pub status: String,
    #[serde(
        rename = "confirmationDetails",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub confirmation_details: Option<Value>,
}

/// The closed message payload sum. Extension happens by adding a variant.
///
/// Internally tagged so the discriminant travels with the body; every
/// variant is a map (required by the tagged representation).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        content: String,
    },
    Tips {
        content: String,
        kind: TipsKind,
    },
    ToolCall {
        #[serde(rename = "callId")]
        call_id: String,
        name: String,
        args: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    ToolGroup {
        items: Vec<ToolGroupItem>,
    },
    AgentStatus {
        backend: String,
        status: String,
    },
    AcpPermission {
        request: Value,
    },
    AcpToolCall {
        update: Value,
    },
    CodexPermission {
        request: Value,
    },
    CodexToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        kind: String,
        subtype: String,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
}

impl MessageContent {
    /// The persisted discriminant, mirrored into the `type` column.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Tips { .. } => "tips",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolGroup { .. } => "tool_group",
            Self::AgentStatus { .. } => "agent_status",
            Self::AcpPermission { .. } => "acp_permission",
            Self::AcpToolCall { .. } => "acp_tool_call",
            Self::CodexPermission { .. } => "codex_permission",
            Self::CodexToolCall { .. } => "codex_tool_call",
        }
    }

    /// Identifier used for merge by the composer, when one exists.
    pub fn call_identifier(&self) -> Option<&str> {
        match self {
            Self::ToolCall { call_id, .. } => Some(call_id),
            Self::CodexToolCall { tool_call_id, .. } => Some(tool_call_id),
            Self::AcpToolCall { update } => update
                .get("toolCallId")
                .and_then(Value::as_str),
            _ => None,
        }
    }
}

/// A persisted message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    /// Logical chunk id linking streamed updates of the same turn segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    pub content: MessageContent,
    pub position: Position,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn new(
        conversation_id: impl Into<String>,
        msg_id: Option<String>,
        content: MessageContent,
        position: Position,
        status: MessageStatus,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            msg_id,
            content,
            position,
            status,
            created_at: Utc::now(),
        }
    }
}

/// One page of an ordered listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub page: u32,
    #[serde(rename = "pageSize")]
    pub page_size: u32,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_content_tag_round_trips_through_json() {
        let content = MessageContent::Text {
            content: "hello".into(),
        };
        let text = serde_json::to_string(&content).unwrap();
        assert!(text.contains("\"type\":\"text\""));
        let back: MessageContent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn tool_group_items_keep_camel_case_keys() {
        let item = ToolGroupItem {
            call_id: "a".into(),
            description: "run".into(),
            name: "shell".into(),
            render_output_as_markdown: true,
            result_display: Some(json!("ok")),
            status: "Success".into(),
            confirmation_details: None,
        };
        let v = serde_json::to_value(&item).unwrap();
        assert_eq!(v["callId"], "a");
        assert_eq!(v["renderOutputAsMarkdown"], true);
        assert_eq!(v["resultDisplay"], "ok");
    }

    #[test]
    fn call_identifier_covers_all_tool_shapes() {
        let tc = MessageContent::ToolCall {
            call_id: "c1".into(),
            name: "edit".into(),
            args: json!({}),
            error: None,
            status: None,
        };
        assert_eq!(tc.call_identifier(), Some("c1"));

        let cx = MessageContent::CodexToolCall {
            tool_call_id: "c2".into(),
            kind: "exec".into(),
            subtype: "begin".into(),
            data: json!({}),
            status: None,
        };
        assert_eq!(cx.call_identifier(), Some("c2"));

        let acp = MessageContent::AcpToolCall {
            update: json!({"toolCallId": "c3", "status": "pending"}),
        };
        assert_eq!(acp.call_identifier(), Some("c3"));

        let text = MessageContent::Text {
            content: "x".into(),
        };
        assert_eq!(text.call_identifier(), None);
    }

    #[test]
    fn extra_preserves_unknown_keys() {
        let raw = json!({
            "workspace": "/tmp/ws",
            "backend": "gemini",
            "uiTheme": "dark"
        });
        let extra: ConversationExtra = serde_json::from_value(raw).unwrap();
        assert_eq!(extra.backend.as_deref(), Some("gemini"));
        assert_eq!(extra.rest["uiTheme"], "dark");
        let back = serde_json::to_value(&extra).unwrap();
        assert_eq!(back["uiTheme"], "dark");
    }

    #[test]
    fn conversation_new_sets_pending_and_ids() {
        let c = Conversation::new("demo", ConversationKind::Acp, ConversationExtra::default());
        assert!(!c.id.is_empty());
        assert_eq!(c.status, ConversationStatus::Pending);
        assert_eq!(c.create_time, c.modify_time);
    }
}
