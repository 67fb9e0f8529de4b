// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Pure merge of a newly produced message into an ordered list.
//!
//! Used for the message types that cannot ride the `msg_id` upsert path:
//! `tool_group`, `tool_call`, `acp_tool_call`, `codex_tool_call`. Merges
//! always build new containers; callers rely on identity changes for
//! change detection.

use serde_json::Value;

use freja_storage::{MessageContent, StoredMessage, ToolGroupItem};

/// What a merge did, so the caller can persist exactly the touched rows.
#[derive(Debug)]
pub struct MergeOutcome {
    /// The full merged list, in order.
    pub list: Vec<StoredMessage>,
    /// Existing rows whose content changed.
    pub updated: Vec<StoredMessage>,
    /// A new row appended at the tail, if any.
    pub appended: Option<StoredMessage>,
}

/// Merge `incoming` into `existing`.
///
/// - `tool_group`: each incoming element replaces (shallow-merges over)
///   the element with the same `callId` in any existing group; leftovers
///   append as one new group at the tail.
/// - `tool_call` / `acp_tool_call` / `codex_tool_call`: shallow-merge into
///   the first element with a matching call identifier, else append.
/// - consecutive `text` sharing `msg_id`: concatenate onto the tail.
/// - anything else: plain append.
pub fn merge_into(existing: &[StoredMessage], incoming: StoredMessage) -> MergeOutcome {
    match &incoming.content {
        MessageContent::ToolGroup { .. } => merge_tool_group(existing, incoming),
        MessageContent::ToolCall { .. }
        | MessageContent::AcpToolCall { .. }
        | MessageContent::CodexToolCall { .. } => merge_tool_call(existing, incoming),
        MessageContent::Text { .. } => merge_text(existing, incoming),
        _ => append(existing, incoming),
    }
}

fn append(existing: &[StoredMessage], incoming: StoredMessage) -> MergeOutcome {
    let mut list = existing.to_vec();
    list.push(incoming.clone());
    MergeOutcome {
        list,
        updated: Vec::new(),
        appended: Some(incoming),
    }
}

fn merge_tool_group(existing: &[StoredMessage], incoming: StoredMessage) -> MergeOutcome {
    let MessageContent::ToolGroup { items: incoming_items } = incoming.content.clone() else {
        return append(existing, incoming);
    };

    let mut pending: Vec<ToolGroupItem> = incoming_items;
    let mut list = Vec::with_capacity(existing.len() + 1);
    let mut updated = Vec::new();

    for message in existing {
        let MessageContent::ToolGroup { items } = &message.content else {
            list.push(message.clone());
            continue;
        };

        let mut changed = false;
        let merged_items: Vec<ToolGroupItem> = items
            .iter()
            .map(|old| {
                match pending.iter().position(|new| new.call_id == old.call_id) {
                    Some(idx) => {
                        let new = pending.remove(idx);
                        changed = true;
                        shallow_merge_items(old, &new)
                    }
                    None => old.clone(),
                }
            })
            .collect();

        if changed {
            let mut m = message.clone();
            m.content = MessageContent::ToolGroup {
                items: merged_items,
            };
            updated.push(m.clone());
            list.push(m);
        } else {
            list.push(message.clone());
        }
    }

    let appended = if pending.is_empty() {
        None
    } else {
        let mut tail = incoming;
        tail.content = MessageContent::ToolGroup { items: pending };
        list.push(tail.clone());
        Some(tail)
    };

    MergeOutcome {
        list,
        updated,
        appended,
    }
}

fn merge_tool_call(existing: &[StoredMessage], incoming: StoredMessage) -> MergeOutcome {
    let Some(call_id) = incoming.content.call_identifier().map(str::to_owned) else {
        return append(existing, incoming);
    };
    let tag = incoming.content.type_tag();

    let position = existing.iter().position(|m| {
        m.content.type_tag() == tag && m.content.call_identifier() == Some(call_id.as_str())
    });

    match position {
        None => append(existing, incoming),
        Some(idx) => {
            let mut list = existing.to_vec();
            let merged_content = shallow_merge_content(&list[idx].content, &incoming.content);
            let mut m = list[idx].clone();
            m.content = merged_content;
            list[idx] = m.clone();
            MergeOutcome {
                list,
                updated: vec![m],
                appended: None,
            }
        }
    }
}

fn merge_text(existing: &[StoredMessage], incoming: StoredMessage) -> MergeOutcome {
    // Streaming text normally goes through the buffer's upsert; this path
    // only serves composition from an external emission source, where
    // consecutive chunks of the same msg_id concatenate onto the tail.
    let concatenated = existing.last().and_then(|tail| {
        let same_stream = tail.msg_id.is_some() && tail.msg_id == incoming.msg_id;
        match (&tail.content, &incoming.content) {
            (MessageContent::Text { content: old }, MessageContent::Text { content: new })
                if same_stream =>
            {
                Some(format!("{old}{new}"))
            }
            _ => None,
        }
    });
    let Some(text) = concatenated else {
        return append(existing, incoming);
    };

    let mut list = existing.to_vec();
    let last = list.len() - 1;
    let mut merged = list[last].clone();
    merged.content = MessageContent::Text { content: text };
    list[last] = merged.clone();
    MergeOutcome {
        list,
        updated: vec![merged],
        appended: None,
    }
}

/// JS-spread style shallow merge of two group items: fields present on the
/// newer item win, absent fields keep the older value.
fn shallow_merge_items(old: &ToolGroupItem, new: &ToolGroupItem) -> ToolGroupItem {
    let old_v = serde_json::to_value(old).unwrap_or(Value::Null);
    let new_v = serde_json::to_value(new).unwrap_or(Value::Null);
    let merged = shallow_merge_values(old_v, new_v);
    serde_json::from_value(merged).unwrap_or_else(|_| new.clone())
}

fn shallow_merge_content(old: &MessageContent, new: &MessageContent) -> MessageContent {
    let old_v = serde_json::to_value(old).unwrap_or(Value::Null);
    let new_v = serde_json::to_value(new).unwrap_or(Value::Null);
    let merged = shallow_merge_values(old_v, new_v);
    serde_json::from_value(merged).unwrap_or_else(|_| new.clone())
}

fn shallow_merge_values(old: Value, new: Value) -> Value {
    match (old, new) {
        (Value::Object(mut dst), Value::Object(src)) => {
            for (k, v) in src {
                dst.insert(k, v);
            }
            Value::Object(dst)
        }
        (_, new) => new,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use freja_storage::{MessageStatus, Position};
    use serde_json::json;

    fn msg(content: MessageContent, msg_id: Option<&str>) -> StoredMessage {
        StoredMessage::new(
            "conv",
            msg_id.map(str::to_owned),
            content,
            Position::Left,
            MessageStatus::Work,
        )
    }

    fn group_item(call_id: &str, status: &str) -> ToolGroupItem {
        ToolGroupItem {
            call_id: call_id.into(),
            description: String::new(),
            name: "shell".into(),
            render_output_as_markdown: false,
            result_display: None,
            status: status.into(),
            confirmation_details: None,
        }
    }

    #[test]
    fn tool_group_merges_by_call_id_and_appends_leftovers() {
        // The §8 scenario: [{a: Executing}, {b: Success}] merged with
        // [{a: Success, resultDisplay: ok}, {c: Pending}].
        let existing = vec![msg(
            MessageContent::ToolGroup {
                items: vec![group_item("a", "Executing"), group_item("b", "Success")],
            },
            Some("g1"),
        )];

        let mut incoming_a = group_item("a", "Success");
        incoming_a.result_display = Some(json!("ok"));
        let incoming = msg(
            MessageContent::ToolGroup {
                items: vec![incoming_a, group_item("c", "Pending")],
            },
            Some("g1"),
        );

        let out = merge_into(&existing, incoming);
        assert_eq!(out.list.len(), 2);

        let MessageContent::ToolGroup { items } = &out.list[0].content else {
            panic!("expected tool group");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].call_id, "a");
        assert_eq!(items[0].status, "Success");
        assert_eq!(items[0].result_display, Some(json!("ok")));
        assert_eq!(items[1].call_id, "b");
        assert_eq!(items[1].status, "Success");

        let MessageContent::ToolGroup { items: tail } = &out.list[1].content else {
            panic!("expected appended tool group");
        };
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].call_id, "c");
        assert_eq!(tail[0].status, "Pending");

        assert_eq!(out.updated.len(), 1);
        assert!(out.appended.is_some());
    }

    #[test]
    fn tool_group_call_id_set_is_union_of_inputs() {
        let existing = vec![msg(
            MessageContent::ToolGroup {
                items: vec![group_item("a", "Executing")],
            },
            Some("g1"),
        )];
        let incoming = msg(
            MessageContent::ToolGroup {
                items: vec![group_item("a", "Success"), group_item("b", "Pending")],
            },
            Some("g1"),
        );

        let out = merge_into(&existing, incoming);
        let mut ids: Vec<String> = out
            .list
            .iter()
            .flat_map(|m| match &m.content {
                MessageContent::ToolGroup { items } => {
                    items.iter().map(|i| i.call_id.clone()).collect::<Vec<_>>()
                }
                _ => Vec::new(),
            })
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn tool_call_updates_first_match_in_place() {
        let existing = vec![msg(
            MessageContent::ToolCall {
                call_id: "c1".into(),
                name: "edit".into(),
                args: json!({"path": "a.rs"}),
                error: None,
                status: Some("Executing".into()),
            },
            None,
        )];
        let incoming = msg(
            MessageContent::ToolCall {
                call_id: "c1".into(),
                name: "edit".into(),
                args: json!({"path": "a.rs"}),
                error: None,
                status: Some("Success".into()),
            },
            None,
        );

        let out = merge_into(&existing, incoming);
        assert_eq!(out.list.len(), 1);
        assert!(out.appended.is_none());
        let MessageContent::ToolCall { status, .. } = &out.list[0].content else {
            panic!("expected tool call");
        };
        assert_eq!(status.as_deref(), Some("Success"));
    }

    #[test]
    fn tool_call_without_match_appends() {
        let existing: Vec<StoredMessage> = Vec::new();
        let incoming = msg(
            MessageContent::CodexToolCall {
                tool_call_id: "x1".into(),
                kind: "exec".into(),
                subtype: "begin".into(),
                data: json!({"command": "ls"}),
                status: None,
            },
            None,
        );
        let out = merge_into(&existing, incoming);
        assert_eq!(out.list.len(), 1);
        assert!(out.appended.is_some());
    }

    #[test]
    fn acp_tool_call_merges_update_payload() {
        let existing = vec![msg(
            MessageContent::AcpToolCall {
                update: json!({"toolCallId": "t1", "status": "pending", "title": "read"}),
            },
            None,
        )];
        let incoming = msg(
            MessageContent::AcpToolCall {
                update: json!({"toolCallId": "t1", "status": "completed"}),
            },
            None,
        );

        let out = merge_into(&existing, incoming);
        assert_eq!(out.list.len(), 1);
        let MessageContent::AcpToolCall { update } = &out.list[0].content else {
            panic!("expected acp tool call");
        };
        assert_eq!(update["status"], "completed");
        // Shallow merge is per-field of the variant: the newer update
        // object replaces the older wholesale.
        assert_eq!(update.get("title"), None);
    }

    #[test]
    fn consecutive_text_with_shared_msg_id_concatenates() {
        let existing = vec![msg(
            MessageContent::Text {
                content: "Hello, ".into(),
            },
            Some("m1"),
        )];
        let incoming = msg(
            MessageContent::Text {
                content: "world".into(),
            },
            Some("m1"),
        );

        let out = merge_into(&existing, incoming);
        assert_eq!(out.list.len(), 1);
        assert_eq!(
            out.list[0].content,
            MessageContent::Text {
                content: "Hello, world".into()
            }
        );
    }

    #[test]
    fn text_with_different_msg_id_appends() {
        let existing = vec![msg(
            MessageContent::Text {
                content: "first".into(),
            },
            Some("m1"),
        )];
        let incoming = msg(
            MessageContent::Text {
                content: "second".into(),
            },
            Some("m2"),
        );

        let out = merge_into(&existing, incoming);
        assert_eq!(out.list.len(), 2);
    }

    #[test]
    fn merge_builds_new_containers() {
        let existing = vec![msg(
            MessageContent::ToolGroup {
                items: vec![group_item("a", "Executing")],
            },
            Some("g1"),
        )];
        let incoming = msg(
            MessageContent::ToolGroup {
                items: vec![group_item("a", "Success")],
            },
            Some("g1"),
        );
        let out = merge_into(&existing, incoming);
        // The merged row is a new object; the input list is untouched.
        let MessageContent::ToolGroup { items } = &existing[0].content else {
            panic!();
        };
        assert_eq!(items[0].status, "Executing");
        let MessageContent::ToolGroup { items } = &out.list[0].content else {
            panic!();
        };
        assert_eq!(items[0].status, "Success");
    }
}
