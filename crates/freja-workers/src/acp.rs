// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Subprocess worker speaking the Agent-Client Protocol.
//!
//! Lifecycle: `connecting → connected → authenticated → session_active`,
//! with `disconnected` / `error` as terminal states. Every transition is
//! emitted as an `agent_status` event so the UI can badge the
//! conversation. Tool activity arrives as `session/update` notifications;
//! permission prompts arrive as server→client `session/request_permission`
//! requests that stay pending until `confirm_message` answers them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use freja_storage::{Conversation, ConversationKind};

use crate::events::{EventKind, WorkerEvent};
use crate::pipeline::Pipeline;
use crate::rpc::{PeerHandler, PeerMessage, RpcPeer};
use crate::worker::{Confirmation, SendRequest, StatusCell, TurnSlot, Worker, WorkerStatus};
use crate::{Result, WorkerError};

const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Connecting,
    Connected,
    Authenticated,
    SessionActive,
    Disconnected,
    Error,
}

impl AgentState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
            Self::SessionActive => "session_active",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

struct Connection {
    peer: Arc<RpcPeer>,
    session_id: String,
}

/// State shared between the worker facade and the peer handler.
struct Shared {
    conversation_id: String,
    backend: String,
    pipeline: Arc<Pipeline>,
    status: StatusCell,
    state: StdMutex<AgentState>,
    /// call_id → rpc request id awaiting a permission verdict.
    pending_permissions: StdMutex<HashMap<String, Value>>,
    /// msg_id of the turn currently streaming.
    current_msg_id: StdMutex<String>,
}

impl Shared {
    async fn transition(&self, state: AgentState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        let event = WorkerEvent::new(
            EventKind::AgentStatus,
            json!({"backend": self.backend, "status": state.as_str()}),
            uuid::Uuid::new_v4().to_string(),
            &self.conversation_id,
        );
        if let Err(e) = self.pipeline.ingest(event).await {
            warn!(error = %e, "agent_status event failed to persist");
        }
    }

    fn state(&self) -> AgentState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn msg_id(&self) -> String {
        self.current_msg_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Inbound side of the connection, driven frame-by-frame by the peer's
/// read loop so event order matches wire order.
struct AcpHandler {
    shared: Arc<Shared>,
}

#[async_trait]
impl PeerHandler for AcpHandler {
    async fn on_message(&self, peer: &Arc<RpcPeer>, message: PeerMessage) {
        let shared = &self.shared;
        match message {
            PeerMessage::Notification { method, params } if method == "session/update" => {
                handle_update(shared, params).await;
            }
            PeerMessage::Notification { method, .. } => {
                debug!(%method, "ignoring acp notification");
            }
            PeerMessage::Request { id, method, params }
                if method == "session/request_permission" =>
            {
                let call_id = params
                    .pointer("/toolCall/toolCallId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                shared
                    .pending_permissions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(call_id.clone(), id);
                let data = json!({
                    "callId": call_id,
                    "options": params.get("options").cloned().unwrap_or(Value::Null),
                    "toolCall": params.get("toolCall").cloned().unwrap_or(Value::Null),
                });
                let event = WorkerEvent::new(
                    EventKind::AcpPermission,
                    data,
                    shared.msg_id(),
                    &shared.conversation_id,
                );
                if let Err(e) = shared.pipeline.ingest(event).await {
                    warn!(error = %e, "acp permission event failed");
                }
            }
            PeerMessage::Request { id, method, .. } => {
                // Capability we did not advertise; refuse politely.
                let _ = peer.respond_error(id, -32601, &format!("{method} not supported"));
            }
            PeerMessage::Fatal(reason) => {
                // Hard protocol error: this worker is done.
                warn!(%reason, "acp framing error, dropping worker");
                shared.status.set(WorkerStatus::Closed);
                shared.transition(AgentState::Error).await;
                peer.kill();
            }
            PeerMessage::Closed => {
                if shared.state() == AgentState::SessionActive {
                    warn!("acp agent exited with a live session");
                    shared.status.set(WorkerStatus::Closed);
                    shared.transition(AgentState::Disconnected).await;
                }
            }
        }
    }
}

async fn handle_update(shared: &Arc<Shared>, params: Value) {
    let update = params.get("update").cloned().unwrap_or(Value::Null);
    let kind = update
        .get("sessionUpdate")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let event = match kind.as_str() {
        "agent_message_chunk" => {
            let text = update
                .pointer("/content/text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            WorkerEvent::new(
                EventKind::Content,
                json!(text),
                shared.msg_id(),
                &shared.conversation_id,
            )
        }
        "agent_thought_chunk" => WorkerEvent::new(
            EventKind::Thought,
            update
                .pointer("/content/text")
                .cloned()
                .unwrap_or(Value::Null),
            shared.msg_id(),
            &shared.conversation_id,
        ),
        "tool_call" | "tool_call_update" => WorkerEvent::new(
            EventKind::AcpToolCall,
            update,
            shared.msg_id(),
            &shared.conversation_id,
        ),
        other => {
            debug!(kind = %other, "ignoring session update");
            return;
        }
    };
    if let Err(e) = shared.pipeline.ingest(event).await {
        warn!(error = %e, "acp update event failed");
    }
}

pub struct AcpWorker {
    workspace: PathBuf,
    cli_path: Option<PathBuf>,
    shared: Arc<Shared>,
    turn: TurnSlot,
    cancel: StdMutex<Option<CancellationToken>>,
    conn: Mutex<Option<Connection>>,
}

impl AcpWorker {
    pub fn new(conversation: &Conversation, pipeline: Arc<Pipeline>) -> Arc<Self> {
        let backend = conversation
            .extra
            .backend
            .clone()
            .unwrap_or_else(|| "gemini".to_string());
        Arc::new(Self {
            workspace: conversation.extra.workspace.clone(),
            cli_path: conversation.extra.cli_path.clone(),
            shared: Arc::new(Shared {
                conversation_id: conversation.id.clone(),
                backend,
                pipeline,
                status: StatusCell::new(WorkerStatus::Idle),
                state: StdMutex::new(AgentState::Connecting),
                pending_permissions: StdMutex::new(HashMap::new()),
                current_msg_id: StdMutex::new(String::new()),
            }),
            turn: TurnSlot::default(),
            cancel: StdMutex::new(None),
            conn: Mutex::new(None),
        })
    }

    /// Program + argument convention per backend. A `cli_path` override in
    /// the conversation's extra wins over PATH lookup.
    fn launch_plan(&self) -> (PathBuf, Vec<String>) {
        let program = self
            .cli_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.shared.backend));
        let args = match self.shared.backend.as_str() {
            "gemini" => vec!["--experimental-acp".to_string()],
            _ => vec!["--acp".to_string()],
        };
        (program, args)
    }

    /// Bring up the subprocess and run the ACP handshake, if not already
    /// live. Holds the connection lock for the duration so concurrent
    /// callers cannot double-spawn.
    async fn ensure_session(&self) -> Result<()> {
        let mut slot = self.conn.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        self.shared.transition(AgentState::Connecting).await;
        let (program, args) = self.launch_plan();
        let handler = Arc::new(AcpHandler {
            shared: Arc::clone(&self.shared),
        });
        let peer = RpcPeer::spawn(&program, &args, &[], &self.workspace, handler)?;

        let init = peer
            .request_timeout(
                "initialize",
                json!({
                    "protocolVersion": 1,
                    "clientCapabilities": {"fs": {"readTextFile": false, "writeTextFile": false}}
                }),
                LIFECYCLE_TIMEOUT,
            )
            .await?;
        self.shared.transition(AgentState::Connected).await;

        // Agents that advertise auth methods expect an authenticate call
        // before any session can be opened.
        if let Some(method) = init
            .get("authMethods")
            .and_then(Value::as_array)
            .and_then(|methods| methods.first())
            .and_then(|m| m.get("id"))
        {
            peer.request_timeout("authenticate", json!({"methodId": method}), LIFECYCLE_TIMEOUT)
                .await
                .map_err(|e| WorkerError::Auth(e.to_string()))?;
        }
        self.shared.transition(AgentState::Authenticated).await;

        let session = peer
            .request_timeout(
                "session/new",
                json!({"cwd": self.workspace, "mcpServers": []}),
                LIFECYCLE_TIMEOUT,
            )
            .await?;
        let session_id = session
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| WorkerError::protocol("session/new reply without sessionId"))?
            .to_string();
        self.shared.transition(AgentState::SessionActive).await;
        info!(backend = %self.shared.backend, %session_id, "acp session established");

        *slot = Some(Connection { peer, session_id });
        Ok(())
    }

    async fn connection(&self) -> Result<(Arc<RpcPeer>, String)> {
        let slot = self.conn.lock().await;
        match slot.as_ref() {
            Some(c) => Ok((Arc::clone(&c.peer), c.session_id.clone())),
            None => Err(WorkerError::transport("no live acp session")),
        }
    }

    /// Test hook: the handler to wire into an in-memory peer.
    #[doc(hidden)]
    pub fn peer_handler(&self) -> Arc<dyn PeerHandler> {
        Arc::new(AcpHandler {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Test hook: install an already-connected peer instead of spawning
    /// a real CLI.
    #[doc(hidden)]
    pub async fn install_connection(&self, peer: Arc<RpcPeer>, session_id: &str) {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner()) = AgentState::SessionActive;
        *self.conn.lock().await = Some(Connection {
            peer,
            session_id: session_id.to_string(),
        });
    }
}

#[async_trait]
impl Worker for AcpWorker {
    fn kind(&self) -> ConversationKind {
        ConversationKind::Acp
    }

    fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn status(&self) -> WorkerStatus {
        self.shared.status.get()
    }

    async fn send_message(&self, req: SendRequest) -> Result<()> {
        if self.status() == WorkerStatus::Closed {
            return Err(WorkerError::transport(
                "agent disconnected; conversation must be rebuilt",
            ));
        }
        let guard = self.turn.try_begin()?;
        self.shared.status.set(WorkerStatus::Busy);
        *self
            .shared
            .current_msg_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = req.msg_id.clone();

        self.shared
            .pipeline
            .ingest(WorkerEvent::new(
                EventKind::UserContent,
                json!(req.input.clone()),
                uuid::Uuid::new_v4().to_string(),
                &self.shared.conversation_id,
            ))
            .await?;

        if let Err(e) = self.ensure_session().await {
            self.shared.status.set(WorkerStatus::Error);
            self.shared.transition(AgentState::Error).await;
            let _ = self
                .shared
                .pipeline
                .ingest(WorkerEvent::new(
                    EventKind::Error,
                    json!(e.to_string()),
                    req.msg_id.clone(),
                    &self.shared.conversation_id,
                ))
                .await;
            return Err(e);
        }
        let (peer, session_id) = self.connection().await?;

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        let shared = Arc::clone(&self.shared);
        let msg_id = req.msg_id.clone();
        let mut prompt = vec![json!({"type": "text", "text": req.input})];
        if let Some(files) = &req.files {
            for f in files {
                prompt.push(
                    json!({"type": "resource_link", "uri": format!("file://{}", f.display())}),
                );
            }
        }

        tokio::spawn(async move {
            let _guard = guard;
            let _ = shared
                .pipeline
                .ingest(WorkerEvent::new(
                    EventKind::Start,
                    Value::Null,
                    msg_id.clone(),
                    &shared.conversation_id,
                ))
                .await;

            let request = peer.request(
                "session/prompt",
                json!({"sessionId": session_id, "prompt": prompt}),
            );
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    let _ = peer.notify("session/cancel", json!({"sessionId": session_id}));
                    debug!("acp turn cancelled");
                    shared.status.set(WorkerStatus::Idle);
                    return;
                }
                result = request => result,
            };

            match outcome {
                Ok(reply) => {
                    debug!(stop_reason = ?reply.get("stopReason"), "acp turn complete");
                    let _ = shared
                        .pipeline
                        .ingest(WorkerEvent::new(
                            EventKind::Finish,
                            Value::Null,
                            msg_id,
                            &shared.conversation_id,
                        ))
                        .await;
                    shared.status.set(WorkerStatus::Idle);
                }
                Err(e) => {
                    let _ = shared
                        .pipeline
                        .ingest(WorkerEvent::new(
                            EventKind::Error,
                            json!(e.to_string()),
                            msg_id,
                            &shared.conversation_id,
                        ))
                        .await;
                    shared.status.set(WorkerStatus::Error);
                }
            }
        });
        Ok(())
    }

    async fn confirm_message(&self, confirmation: Confirmation) -> Result<()> {
        let id = self
            .shared
            .pending_permissions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&confirmation.call_id)
            .ok_or_else(|| {
                WorkerError::not_found(format!(
                    "no pending permission for call {}",
                    confirmation.call_id
                ))
            })?;
        let (peer, _) = self.connection().await?;
        peer.respond(
            id,
            json!({"outcome": {"outcome": "selected", "optionId": confirmation.confirm_key}}),
        )?;
        debug!(call_id = %confirmation.call_id, key = %confirmation.confirm_key, "permission resolved");
        Ok(())
    }

    async fn stop(&self) {
        if let Some(token) = self
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
        // Canceled permission prompts resolve as denials so the agent is
        // never left hanging on a dead prompt.
        let pending: Vec<(String, Value)> = self
            .shared
            .pending_permissions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        if !pending.is_empty() {
            if let Ok((peer, _)) = self.connection().await {
                for (call_id, id) in pending {
                    debug!(%call_id, "cancelling pending permission");
                    let _ = peer.respond(id, json!({"outcome": {"outcome": "cancelled"}}));
                }
            }
        }
    }

    async fn shutdown(&self) {
        self.stop().await;
        if let Some(conn) = self.conn.lock().await.take() {
            conn.peer.kill();
        }
        self.shared.status.set(WorkerStatus::Closed);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
