// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// Closed set of event types a worker can emit. Adding a variant is the
/// only extension path; the pipeline's match is exhaustive so a new
/// variant fails to compile until it is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Error,
    Content,
    UserContent,
    ToolCall,
    ToolGroup,
    AgentStatus,
    AcpPermission,
    AcpToolCall,
    CodexPermission,
    CodexToolCall,
    Start,
    Finish,
    Thought,
}

/// The envelope every worker emission travels in, both to the persistence
/// pipeline and to the UI over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
    pub msg_id: String,
    pub conversation_id: String,
}

impl WorkerEvent {
    pub fn new(
        kind: EventKind,
        data: Value,
        msg_id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            data,
            msg_id: msg_id.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

/// Fire-and-forget fan-out to UI subscribers.
///
/// Persistence never depends on anyone listening: when no subscriber is
/// attached, events are dropped on the floor by design. Per-conversation
/// ordering holds because each conversation has exactly one emitting
/// worker task.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: WorkerEvent) {
        trace!(kind = ?event.kind, conversation_id = %event.conversation_id, "event emitted");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_kind_serializes_snake_case() {
        let kind = serde_json::to_value(EventKind::AcpToolCall).unwrap();
        assert_eq!(kind, "acp_tool_call");
        let back: EventKind = serde_json::from_value(json!("codex_permission")).unwrap();
        assert_eq!(back, EventKind::CodexPermission);
    }

    #[test]
    fn envelope_uses_type_key() {
        let ev = WorkerEvent::new(EventKind::Content, json!("hi"), "m1", "c1");
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "content");
        assert_eq!(v["msg_id"], "m1");
        assert_eq!(v["conversation_id"], "c1");
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_dropped_not_an_error() {
        let bus = EventBus::new(8);
        bus.emit(WorkerEvent::new(EventKind::Start, json!(null), "m", "c"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        for i in 0..3 {
            bus.emit(WorkerEvent::new(
                EventKind::Content,
                json!(format!("chunk{i}")),
                "m1",
                "c1",
            ));
        }
        for i in 0..3 {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.data, json!(format!("chunk{i}")));
        }
    }
}
