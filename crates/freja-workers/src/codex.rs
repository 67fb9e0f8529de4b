// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Subprocess worker for the Codex CLI dialect.
//!
//! Same JSON-RPC plumbing as the ACP worker, different event taxonomy:
//! the agent streams `codex/event` notifications whose `msg.type` spans
//! `exec_command_begin|output_delta|end`, `patch_apply_begin|end`,
//! `mcp_tool_call_begin|end`, `web_search_begin|end`, `turn_diff`, and a
//! catch-all `generic`. Each becomes a `codex_tool_call` message keyed by
//! `toolCallId`, so begin/delta/end collapse into one row. `sendUserMessage`
//! acks immediately; the turn ends when `task_complete` arrives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use freja_storage::{Conversation, ConversationKind};

use crate::events::{EventKind, WorkerEvent};
use crate::pipeline::Pipeline;
use crate::rpc::{PeerHandler, PeerMessage, RpcPeer};
use crate::worker::{Confirmation, SendRequest, StatusCell, TurnSlot, Worker, WorkerStatus};
use crate::{Result, WorkerError};

const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(30);

struct Connection {
    peer: Arc<RpcPeer>,
    conversation_ref: String,
}

struct Shared {
    conversation_id: String,
    pipeline: Arc<Pipeline>,
    status: StatusCell,
    /// call_id → rpc request id awaiting an approval verdict.
    pending_approvals: StdMutex<HashMap<String, Value>>,
    current_msg_id: StdMutex<String>,
    /// Completes when `task_complete` (Ok) or a fatal turn error (Err)
    /// arrives for the in-flight turn.
    turn_done: StdMutex<Option<oneshot::Sender<std::result::Result<(), String>>>>,
    /// Whether deltas streamed this turn (the final `agent_message`
    /// snapshot then replaces rather than duplicates).
    saw_delta: StdMutex<bool>,
}

impl Shared {
    fn msg_id(&self) -> String {
        self.current_msg_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn complete_turn(&self, outcome: std::result::Result<(), String>) {
        if let Some(tx) = self
            .turn_done
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(outcome);
        }
    }

    async fn ingest(&self, kind: EventKind, data: Value) {
        let event = WorkerEvent::new(kind, data, self.msg_id(), &self.conversation_id);
        if let Err(e) = self.pipeline.ingest(event).await {
            warn!(error = %e, "codex event failed to persist");
        }
    }
}

struct CodexHandler {
    shared: Arc<Shared>,
}

#[async_trait]
impl PeerHandler for CodexHandler {
    async fn on_message(&self, peer: &Arc<RpcPeer>, message: PeerMessage) {
        let shared = &self.shared;
        match message {
            PeerMessage::Notification { method, params } if method == "codex/event" => {
                handle_event(shared, params).await;
            }
            PeerMessage::Notification { method, .. } => {
                debug!(%method, "ignoring codex notification");
            }
            PeerMessage::Request { id, method, params }
                if method == "execCommandApproval" || method == "applyPatchApproval" =>
            {
                let call_id = params
                    .get("callId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                shared
                    .pending_approvals
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(call_id.clone(), id);
                let data = json!({
                    "callId": call_id,
                    "kind": if method == "execCommandApproval" { "exec" } else { "patch" },
                    "request": params,
                });
                shared.ingest(EventKind::CodexPermission, data).await;
            }
            PeerMessage::Request { id, method, .. } => {
                let _ = peer.respond_error(id, -32601, &format!("{method} not supported"));
            }
            PeerMessage::Fatal(reason) => {
                warn!(%reason, "codex framing error, dropping worker");
                shared.status.set(WorkerStatus::Closed);
                shared.complete_turn(Err(reason));
                peer.kill();
            }
            PeerMessage::Closed => {
                if shared.status.get() != WorkerStatus::Closed {
                    warn!("codex agent exited");
                    shared.status.set(WorkerStatus::Closed);
                    shared.complete_turn(Err("agent exited".into()));
                }
            }
        }
    }
}

/// Map one `codex/event` notification onto the typed event stream.
async fn handle_event(shared: &Arc<Shared>, params: Value) {
    let msg = params.get("msg").cloned().unwrap_or(Value::Null);
    let event_type = msg
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let call_id = msg
        .get("call_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match event_type.as_str() {
        "task_started" => {}
        "task_complete" => shared.complete_turn(Ok(())),
        "error" => {
            let message = msg
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("codex error")
                .to_string();
            shared.complete_turn(Err(message));
        }
        "agent_message_delta" => {
            *shared.saw_delta.lock().unwrap_or_else(|e| e.into_inner()) = true;
            let delta = msg
                .get("delta")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            shared.ingest(EventKind::Content, json!(delta)).await;
        }
        "agent_message" => {
            // Canonical full text; replaces whatever the deltas built.
            let text = msg
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let streamed = *shared.saw_delta.lock().unwrap_or_else(|e| e.into_inner());
            if streamed {
                shared
                    .ingest(
                        EventKind::Content,
                        json!({"content": text, "mode": "replace"}),
                    )
                    .await;
            } else {
                shared.ingest(EventKind::Content, json!(text)).await;
            }
        }
        "agent_reasoning" | "agent_reasoning_delta" => {
            shared
                .ingest(EventKind::Thought, msg.get("text").cloned().unwrap_or(Value::Null))
                .await;
        }
        "turn_diff" => {
            let data = json!({
                "toolCallId": format!("{}-diff", shared.msg_id()),
                "kind": "turn_diff",
                "subtype": "diff",
                "data": msg,
                "status": "success",
            });
            shared.ingest(EventKind::CodexToolCall, data).await;
        }
        other => {
            let (kind, subtype) = classify(other);
            let status = match subtype {
                "begin" | "output_delta" => "running",
                "end" => {
                    let failed = msg
                        .get("exit_code")
                        .and_then(Value::as_i64)
                        .is_some_and(|code| code != 0)
                        || msg.get("error").is_some();
                    if failed {
                        "error"
                    } else {
                        "success"
                    }
                }
                _ => "running",
            };
            let tool_call_id = if call_id.is_empty() {
                format!("{}-{kind}", shared.msg_id())
            } else {
                call_id
            };
            let data = json!({
                "toolCallId": tool_call_id,
                "kind": kind,
                "subtype": subtype,
                "data": msg,
                "status": status,
            });
            shared.ingest(EventKind::CodexToolCall, data).await;
        }
    }
}

/// Split a codex event type into the (kind, subtype) pair carried on the
/// persisted message. Unknown types stay opaque under `generic`.
fn classify(event_type: &str) -> (&'static str, &'static str) {
    match event_type {
        "exec_command_begin" => ("exec", "begin"),
        "exec_command_output_delta" => ("exec", "output_delta"),
        "exec_command_end" => ("exec", "end"),
        "patch_apply_begin" => ("patch", "begin"),
        "patch_apply_end" => ("patch", "end"),
        "mcp_tool_call_begin" => ("mcp", "begin"),
        "mcp_tool_call_end" => ("mcp", "end"),
        "web_search_begin" => ("web_search", "begin"),
        "web_search_end" => ("web_search", "end"),
        _ => ("generic", "event"),
    }
}

pub struct CodexWorker {
    workspace: PathBuf,
    cli_path: Option<PathBuf>,
    model: Option<Value>,
    shared: Arc<Shared>,
    turn: TurnSlot,
    cancel: StdMutex<Option<CancellationToken>>,
    conn: Mutex<Option<Connection>>,
}

impl CodexWorker {
    pub fn new(conversation: &Conversation, pipeline: Arc<Pipeline>) -> Arc<Self> {
        Arc::new(Self {
            workspace: conversation.extra.workspace.clone(),
            cli_path: conversation.extra.cli_path.clone(),
            model: conversation.model.clone(),
            shared: Arc::new(Shared {
                conversation_id: conversation.id.clone(),
                pipeline,
                status: StatusCell::new(WorkerStatus::Idle),
                pending_approvals: StdMutex::new(HashMap::new()),
                current_msg_id: StdMutex::new(String::new()),
                turn_done: StdMutex::new(None),
                saw_delta: StdMutex::new(false),
            }),
            turn: TurnSlot::default(),
            cancel: StdMutex::new(None),
            conn: Mutex::new(None),
        })
    }

    async fn ensure_conversation(&self) -> Result<()> {
        let mut slot = self.conn.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let program = self
            .cli_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("codex"));
        let args = vec!["app-server".to_string()];
        let handler = Arc::new(CodexHandler {
            shared: Arc::clone(&self.shared),
        });
        let peer = RpcPeer::spawn(&program, &args, &[], &self.workspace, handler)?;

        let mut params = json!({"cwd": self.workspace});
        if let Some(model) = &self.model {
            params["model"] = model.clone();
        }
        let reply = peer
            .request_timeout("newConversation", params, LIFECYCLE_TIMEOUT)
            .await?;
        let conversation_ref = reply
            .get("conversationId")
            .and_then(Value::as_str)
            .ok_or_else(|| WorkerError::protocol("newConversation reply without conversationId"))?
            .to_string();
        info!(%conversation_ref, "codex conversation established");

        *slot = Some(Connection {
            peer,
            conversation_ref,
        });
        Ok(())
    }

    async fn connection(&self) -> Result<(Arc<RpcPeer>, String)> {
        let slot = self.conn.lock().await;
        match slot.as_ref() {
            Some(c) => Ok((Arc::clone(&c.peer), c.conversation_ref.clone())),
            None => Err(WorkerError::transport("no live codex conversation")),
        }
    }

    /// Test hook: the handler to wire into an in-memory peer.
    #[doc(hidden)]
    pub fn peer_handler(&self) -> Arc<dyn PeerHandler> {
        Arc::new(CodexHandler {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Test hook: install an already-connected peer.
    #[doc(hidden)]
    pub async fn install_connection(&self, peer: Arc<RpcPeer>, conversation_ref: &str) {
        *self.conn.lock().await = Some(Connection {
            peer,
            conversation_ref: conversation_ref.to_string(),
        });
    }
}

#[async_trait]
impl Worker for CodexWorker {
    fn kind(&self) -> ConversationKind {
        ConversationKind::Codex
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
        *self.shared.saw_delta.lock().unwrap_or_else(|e| e.into_inner()) = false;

        self.shared
            .pipeline
            .ingest(WorkerEvent::new(
                EventKind::UserContent,
                json!(req.input.clone()),
                uuid::Uuid::new_v4().to_string(),
                &self.shared.conversation_id,
            ))
            .await?;

        if let Err(e) = self.ensure_conversation().await {
            self.shared.status.set(WorkerStatus::Error);
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
        let (peer, conversation_ref) = self.connection().await?;

        let (done_tx, done_rx) = oneshot::channel();
        *self
            .shared
            .turn_done
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(done_tx);

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        let shared = Arc::clone(&self.shared);
        let msg_id = req.msg_id.clone();
        let input = req.input.clone();

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

            // sendUserMessage acks immediately; the turn ends on
            // task_complete.
            if let Err(e) = peer
                .request(
                    "sendUserMessage",
                    json!({
                        "conversationId": conversation_ref,
                        "items": [{"type": "text", "data": {"text": input}}]
                    }),
                )
                .await
            {
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
                return;
            }

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    let _ = peer.notify(
                        "interruptConversation",
                        json!({"conversationId": conversation_ref}),
                    );
                    debug!("codex turn cancelled");
                    shared.status.set(WorkerStatus::Idle);
                    return;
                }
                done = done_rx => done,
            };

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(message)) => Some(message),
                Err(_) => Some("turn abandoned".to_string()),
            };
            match failure {
                None => {
                    let _ = shared
                        .pipeline
                        .ingest(WorkerEvent::new(
                            EventKind::Finish,
                            Value::Null,
                            msg_id,
                            &shared.conversation_id,
                        ))
                        .await;
                    if shared.status.get() == WorkerStatus::Busy {
                        shared.status.set(WorkerStatus::Idle);
                    }
                }
                Some(message) => {
                    let _ = shared
                        .pipeline
                        .ingest(WorkerEvent::new(
                            EventKind::Error,
                            json!(message),
                            msg_id,
                            &shared.conversation_id,
                        ))
                        .await;
                    if shared.status.get() == WorkerStatus::Busy {
                        shared.status.set(WorkerStatus::Error);
                    }
                }
            }
        });
        Ok(())
    }

    async fn confirm_message(&self, confirmation: Confirmation) -> Result<()> {
        let id = self
            .shared
            .pending_approvals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&confirmation.call_id)
            .ok_or_else(|| {
                WorkerError::not_found(format!(
                    "no pending approval for call {}",
                    confirmation.call_id
                ))
            })?;
        let decision = match confirmation.confirm_key.as_str() {
            "allow" | "approved" | "yes" => "approved",
            _ => "denied",
        };
        let (peer, _) = self.connection().await?;
        peer.respond(id, json!({"decision": decision}))?;
        debug!(call_id = %confirmation.call_id, %decision, "codex approval resolved");
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
        let pending: Vec<(String, Value)> = self
            .shared
            .pending_approvals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        if !pending.is_empty() {
            if let Ok((peer, _)) = self.connection().await {
                for (call_id, id) in pending {
                    debug!(%call_id, "denying pending approval on stop");
                    let _ = peer.respond(id, json!({"decision": "denied"}));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use freja_storage::{ConversationExtra, MessageContent, MessageStatus, Storage};
    use freja_stream::{BufferOptions, StreamBuffer};
    use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct FakeAgent {
        reader: tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
        writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    }

    impl FakeAgent {
        async fn recv(&mut self) -> Value {
            let line = self.reader.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: Value) {
            self.writer
                .write_all(format!("{value}\n").as_bytes())
                .await
                .unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn send_event(&mut self, msg: Value) {
            self.send(json!({"jsonrpc": "2.0", "method": "codex/event", "params": {"msg": msg}}))
                .await;
        }
    }

    async fn harness() -> (Arc<CodexWorker>, Arc<Storage>, String, FakeAgent) {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        storage.ensure_system_user().unwrap();
        let mut extra = ConversationExtra::default();
        extra.workspace = "/tmp/ws".into();
        let conversation = Conversation::new("cx", ConversationKind::Codex, extra);
        storage.create_conversation(&conversation).unwrap();

        let buffer = StreamBuffer::new(storage.clone(), BufferOptions::default());
        let pipeline = Pipeline::new(storage.clone(), buffer, EventBus::default());
        let worker = CodexWorker::new(&conversation, pipeline);

        let (ours, theirs) = duplex(64 * 1024);
        let (our_read, our_write) = split(ours);
        let (their_read, their_write) = split(theirs);
        let peer = RpcPeer::from_io(our_read, our_write, worker.peer_handler());
        worker.install_connection(peer, "cx-ref-1").await;

        let agent = FakeAgent {
            reader: BufReader::new(their_read).lines(),
            writer: their_write,
        };
        (worker, storage, conversation.id, agent)
    }

    fn send_req(msg_id: &str) -> SendRequest {
        SendRequest {
            input: "run the tests".into(),
            msg_id: msg_id.into(),
            files: None,
            loading_id: None,
        }
    }

    async fn wait_status(worker: &CodexWorker, wanted: WorkerStatus) {
        for _ in 0..200 {
            if worker.status() == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker never reached {wanted:?}");
    }

    /// Ack the sendUserMessage request the worker just issued.
    async fn ack_send(agent: &mut FakeAgent) -> Value {
        let req = agent.recv().await;
        assert_eq!(req["method"], "sendUserMessage");
        agent
            .send(json!({"jsonrpc": "2.0", "id": req["id"], "result": {}}))
            .await;
        req
    }

    #[tokio::test]
    async fn deltas_then_snapshot_produce_final_text() {
        let (worker, storage, cid, mut agent) = harness().await;
        worker.send_message(send_req("m1")).await.unwrap();
        ack_send(&mut agent).await;

        agent
            .send_event(json!({"type": "agent_message_delta", "delta": "par"}))
            .await;
        agent
            .send_event(json!({"type": "agent_message_delta", "delta": "tial"}))
            .await;
        agent
            .send_event(json!({"type": "agent_message", "message": "partial, polished"}))
            .await;
        agent.send_event(json!({"type": "task_complete"})).await;

        wait_status(&worker, WorkerStatus::Idle).await;
        let row = storage.get_message_by_msg_id(&cid, "m1").unwrap().unwrap();
        assert_eq!(
            row.content,
            MessageContent::Text {
                content: "partial, polished".into()
            }
        );
        assert_eq!(row.status, MessageStatus::Finish);
    }

    #[tokio::test]
    async fn exec_lifecycle_collapses_into_one_tool_row() {
        let (worker, storage, cid, mut agent) = harness().await;
        worker.send_message(send_req("m1")).await.unwrap();
        ack_send(&mut agent).await;

        agent
            .send_event(json!({
                "type": "exec_command_begin",
                "call_id": "e1",
                "command": ["cargo", "test"],
            }))
            .await;
        agent
            .send_event(json!({
                "type": "exec_command_output_delta",
                "call_id": "e1",
                "chunk": "running 12 tests",
            }))
            .await;
        agent
            .send_event(json!({
                "type": "exec_command_end",
                "call_id": "e1",
                "exit_code": 0,
            }))
            .await;
        agent.send_event(json!({"type": "task_complete"})).await;
        wait_status(&worker, WorkerStatus::Idle).await;

        let page = storage.get_conversation_messages(&cid, 1, 50).unwrap();
        let tool_rows: Vec<_> = page
            .data
            .iter()
            .filter_map(|m| match &m.content {
                MessageContent::CodexToolCall {
                    tool_call_id,
                    kind,
                    subtype,
                    status,
                    ..
                } => Some((tool_call_id.clone(), kind.clone(), subtype.clone(), status.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(tool_rows.len(), 1);
        let (id, kind, subtype, status) = &tool_rows[0];
        assert_eq!(id, "e1");
        assert_eq!(kind, "exec");
        assert_eq!(subtype, "end");
        assert_eq!(status.as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn approval_round_trip() {
        let (worker, storage, cid, mut agent) = harness().await;
        worker.send_message(send_req("m1")).await.unwrap();
        ack_send(&mut agent).await;

        agent
            .send(json!({"jsonrpc": "2.0", "id": 99, "method": "execCommandApproval", "params": {
                "callId": "e7", "command": ["rm", "-rf", "build"]
            }}))
            .await;

        for _ in 0..200 {
            let page = storage.get_conversation_messages(&cid, 1, 50).unwrap();
            if page
                .data
                .iter()
                .any(|m| matches!(m.content, MessageContent::CodexPermission { .. }))
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        worker
            .confirm_message(Confirmation {
                confirm_key: "allow".into(),
                msg_id: "m1".into(),
                call_id: "e7".into(),
            })
            .await
            .unwrap();

        let reply = agent.recv().await;
        assert_eq!(reply["id"], 99);
        assert_eq!(reply["result"]["decision"], "approved");
    }

    #[tokio::test]
    async fn unknown_event_type_stays_opaque_generic() {
        let (worker, storage, cid, mut agent) = harness().await;
        worker.send_message(send_req("m1")).await.unwrap();
        ack_send(&mut agent).await;

        agent
            .send_event(json!({
                "type": "quantum_flux",
                "call_id": "q1",
                "payload": {"anything": [1, 2, 3]},
            }))
            .await;
        agent.send_event(json!({"type": "task_complete"})).await;
        wait_status(&worker, WorkerStatus::Idle).await;

        let page = storage.get_conversation_messages(&cid, 1, 50).unwrap();
        let generic = page
            .data
            .iter()
            .find_map(|m| match &m.content {
                MessageContent::CodexToolCall { kind, data, .. } if kind == "generic" => {
                    Some(data.clone())
                }
                _ => None,
            })
            .expect("generic row");
        assert_eq!(generic["payload"]["anything"], json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn error_event_fails_the_turn() {
        let (worker, storage, cid, mut agent) = harness().await;
        worker.send_message(send_req("m1")).await.unwrap();
        ack_send(&mut agent).await;

        agent
            .send_event(json!({"type": "error", "message": "model unavailable"}))
            .await;
        wait_status(&worker, WorkerStatus::Error).await;

        let page = storage.get_conversation_messages(&cid, 1, 50).unwrap();
        assert!(page
            .data
            .iter()
            .any(|m| matches!(&m.content, MessageContent::Tips { .. })));
    }

    #[tokio::test]
    async fn turn_diff_gets_synthetic_call_id() {
        let (worker, storage, cid, mut agent) = harness().await;
        worker.send_message(send_req("m1")).await.unwrap();
        ack_send(&mut agent).await;

        agent
            .send_event(json!({"type": "turn_diff", "unified_diff": "--- a\n+++ b"}))
            .await;
        agent.send_event(json!({"type": "task_complete"})).await;
        wait_status(&worker, WorkerStatus::Idle).await;

        let page = storage.get_conversation_messages(&cid, 1, 50).unwrap();
        let diff = page
            .data
            .iter()
            .find_map(|m| match &m.content {
                MessageContent::CodexToolCall {
                    tool_call_id, kind, ..
                } if kind == "turn_diff" => Some(tool_call_id.clone()),
                _ => None,
            })
            .expect("turn_diff row");
        assert_eq!(diff, "m1-diff");
    }
}
