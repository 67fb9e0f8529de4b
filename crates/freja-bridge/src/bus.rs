// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// The reply envelope every bridge call resolves to. Errors never cross
/// this boundary as panics or typed values, only as `msg`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl Reply {
    pub fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                success: true,
                data: Some(value),
                msg: None,
            },
            Err(e) => Self::err(format!("encoding reply: {e}")),
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            success: true,
            data: None,
            msg: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            msg: Some(msg.into()),
        }
    }

    /// Flatten a `Result` whose error is any displayable type.
    pub fn from_result<T: Serialize, E: std::fmt::Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(e.to_string()),
        }
    }
}

/// One emitted (channel, payload) pair.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub channel: String,
    pub payload: Value,
}

type HandlerFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Reply> + Send + Sync>;

/// In-process request/reply + event bus.
///
/// The desktop shell adapts this to its own IPC; tests call it directly.
/// Calls on unregistered channels fail soft with an error reply.
pub struct LocalBus {
    handlers: RwLock<HashMap<String, HandlerFn>>,
    events: broadcast::Sender<BusEvent>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            events,
        })
    }

    pub async fn register<F, Fut>(&self, channel: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Reply> + Send + 'static,
    {
        let wrapped: HandlerFn = Arc::new(move |payload| Box::pin(handler(payload)));
        self.handlers
            .write()
            .await
            .insert(channel.to_string(), wrapped);
    }

    /// Request/reply call.
    pub async fn call(&self, channel: &str, payload: Value) -> Reply {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(channel).cloned()
        };
        match handler {
            Some(handler) => {
                debug!(%channel, "bus call");
                handler(payload).await
            }
            None => Reply::err(format!("no handler for channel {channel}")),
        }
    }

    /// Fire-and-forget emission to all subscribers; dropped when nobody
    /// listens.
    pub fn emit(&self, channel: &str, payload: Value) {
        let _ = self.events.send(BusEvent {
            channel: channel.to_string(),
            payload,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    pub async fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn registered_handler_answers_calls() {
        let bus = LocalBus::new();
        bus.register("math:double", |payload: Value| async move {
            let n = payload.get("n").and_then(Value::as_i64).unwrap_or(0);
            Reply::ok(json!({"doubled": n * 2}))
        })
        .await;

        let reply = bus.call("math:double", json!({"n": 21})).await;
        assert!(reply.success);
        assert_eq!(reply.data.unwrap()["doubled"], 42);
    }

    #[tokio::test]
    async fn unknown_channel_fails_soft() {
        let bus = LocalBus::new();
        let reply = bus.call("nope", json!({})).await;
        assert!(!reply.success);
        assert!(reply.msg.unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_silent() {
        let bus = LocalBus::new();
        bus.emit("events", json!({"x": 1}));
    }

    #[tokio::test]
    async fn subscribers_see_emissions_in_order() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe();
        bus.emit("stream", json!(1));
        bus.emit("stream", json!(2));

        assert_eq!(rx.recv().await.unwrap().payload, json!(1));
        assert_eq!(rx.recv().await.unwrap().payload, json!(2));
    }

    #[test]
    fn reply_envelope_shapes() {
        let ok = Reply::ok(json!({"a": 1}));
        assert!(ok.success);
        assert!(ok.msg.is_none());

        let err = Reply::err("nope");
        assert!(!err.success);
        assert_eq!(err.msg.as_deref(), Some("nope"));

        let from: Reply = Reply::from_result::<i32, _>(Err(anyhow::anyhow!("bad")));
        assert!(!from.success);
    }
}
