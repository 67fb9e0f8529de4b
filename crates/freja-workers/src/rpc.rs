// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Line-delimited JSON-RPC 2.0 peer over a subprocess's stdio.
//!
//! Both subprocess agent dialects (ACP and Codex) frame one JSON value
//! per line. Client→server requests multiplex through a pending map;
//! server→client traffic (requests, notifications, stream end) is handed
//! to a [`PeerHandler`] **and awaited** before the next frame is read;
//! that is what keeps events ordered per conversation: a prompt response
//! cannot overtake the tool-call notification that preceded it on the
//! wire. Framing corruption is fatal: the peer reports it once and stops
//! reading; the owner is expected to drop the worker.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{Result, WorkerError};

/// Traffic arriving from the peer process.
#[derive(Debug)]
pub enum PeerMessage {
    /// Server→client request; answer with [`RpcPeer::respond`].
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    /// Framing corruption. Hard protocol error: drop the worker.
    Fatal(String),
    /// The stream ended (process exit or closed pipe).
    Closed,
}

/// Receives inbound traffic. `on_message` is awaited per frame, so a slow
/// handler backpressures the pipe instead of reordering it.
#[async_trait]
pub trait PeerHandler: Send + Sync + 'static {
    async fn on_message(&self, peer: &Arc<RpcPeer>, message: PeerMessage);
}

/// Test/bridge convenience: forward every inbound message into a channel.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<PeerMessage>,
}

impl ChannelHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PeerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl PeerHandler for ChannelHandler {
    async fn on_message(&self, _peer: &Arc<RpcPeer>, message: PeerMessage) {
        let _ = self.tx.send(message);
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<std::result::Result<Value, String>>>>>;

pub struct RpcPeer {
    next_id: AtomicU64,
    pending: PendingMap,
    out_tx: mpsc::UnboundedSender<String>,
    child: Mutex<Option<Child>>,
}

impl RpcPeer {
    /// Spawn `program` and speak JSON-RPC over its stdio.
    pub fn spawn(
        program: &Path,
        args: &[String],
        envs: &[(String, String)],
        cwd: &Path,
        handler: Arc<dyn PeerHandler>,
    ) -> Result<Arc<Self>> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (k, v) in envs {
            command.env(k, v);
        }
        let mut child = command
            .spawn()
            .map_err(|e| WorkerError::transport(format!("spawn {}: {e}", program.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::transport("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::transport("child stdout unavailable"))?;

        let peer = Self::from_io(stdout, stdin, handler);
        *peer.child.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);
        Ok(peer)
    }

    /// Build a peer over arbitrary I/O. Tests drive this with an
    /// in-memory duplex; `spawn` wires it to child stdio.
    pub fn from_io<R, W>(reader: R, writer: W, handler: Arc<dyn PeerHandler>) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let peer = Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: Arc::clone(&pending),
            out_tx,
            child: Mutex::new(None),
        });

        tokio::spawn(write_loop(writer, out_rx));
        tokio::spawn(read_loop(reader, Arc::clone(&peer), handler, pending));

        peer
    }

    /// Send a request and await its response. No implicit deadline; ACP
    /// `session/prompt` legitimately runs for an entire turn. Use
    /// [`RpcPeer::request_timeout`] for lifecycle calls.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        self.send_frame(&frame)?;
        debug!(%method, id, "rpc request sent");

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(message)) => Err(WorkerError::transport(message)),
            Err(_) => Err(WorkerError::transport(format!(
                "peer closed before replying to {method}"
            ))),
        }
    }

    pub async fn request_timeout(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value> {
        match tokio::time::timeout(deadline, self.request(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Timeout(format!("{method} request"))),
        }
    }

    pub fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.send_frame(&json!({"jsonrpc": "2.0", "method": method, "params": params}))
    }

    /// Answer a server→client request.
    pub fn respond(&self, id: Value, result: Value) -> Result<()> {
        self.send_frame(&json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }

    pub fn respond_error(&self, id: Value, code: i64, message: &str) -> Result<()> {
        self.send_frame(
            &json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}),
        )
    }

    fn send_frame(&self, frame: &Value) -> Result<()> {
        self.out_tx
            .send(frame.to_string())
            .map_err(|_| WorkerError::transport("peer write channel closed"))
    }

    /// Kill the child process, if any. Pending requests resolve as
    /// transport errors when the read loop observes EOF.
    pub fn kill(&self) {
        if let Some(child) = self
            .child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
        {
            let _ = child.start_kill();
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if writer.write_all(line.as_bytes()).await.is_err() {
            warn!("rpc writer closed");
            return;
        }
        if writer.write_all(b"\n").await.is_err() || writer.flush().await.is_err() {
            warn!("rpc writer closed");
            return;
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: R,
    peer: Arc<RpcPeer>,
    handler: Arc<dyn PeerHandler>,
    pending: PendingMap,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(line) {
                    Ok(v) => v,
                    Err(e) => {
                        handler
                            .on_message(&peer, PeerMessage::Fatal(format!("bad frame: {e}")))
                            .await;
                        break;
                    }
                };
                if !route(value, &peer, &handler, &pending).await {
                    break;
                }
            }
            Ok(None) => {
                // Fail pending waiters before the handler sees Closed, so
                // a worker that reacts to Closed observes them resolved.
                pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
                handler.on_message(&peer, PeerMessage::Closed).await;
                return;
            }
            Err(e) => {
                handler
                    .on_message(&peer, PeerMessage::Fatal(format!("read error: {e}")))
                    .await;
                break;
            }
        }
    }
    pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
}

/// Route one decoded frame in arrival order. Returns `false` to stop.
async fn route(
    value: Value,
    peer: &Arc<RpcPeer>,
    handler: &Arc<dyn PeerHandler>,
    pending: &PendingMap,
) -> bool {
    let method = value.get("method").and_then(Value::as_str);
    let id = value.get("id").cloned();

    match (method, id) {
        (Some(method), Some(id)) => {
            handler
                .on_message(
                    peer,
                    PeerMessage::Request {
                        id,
                        method: method.to_string(),
                        params: value.get("params").cloned().unwrap_or(Value::Null),
                    },
                )
                .await;
            true
        }
        (Some(method), None) => {
            handler
                .on_message(
                    peer,
                    PeerMessage::Notification {
                        method: method.to_string(),
                        params: value.get("params").cloned().unwrap_or(Value::Null),
                    },
                )
                .await;
            true
        }
        (None, Some(id)) => {
            let Some(key) = id.as_u64() else {
                handler
                    .on_message(peer, PeerMessage::Fatal(format!("response with alien id {id}")))
                    .await;
                return false;
            };
            let waiter = pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
            if let Some(waiter) = waiter {
                let outcome = if let Some(err) = value.get("error") {
                    let message = err
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown rpc error");
                    let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
                    Err(format!("rpc error {code}: {message}"))
                } else {
                    Ok(value.get("result").cloned().unwrap_or(Value::Null))
                };
                let _ = waiter.send(outcome);
                // Let the waiter's task run before the next frame is
                // parsed, preserving wire order end to end.
                tokio::task::yield_now().await;
            } else {
                debug!(id = key, "dropping reply with no waiter");
            }
            true
        }
        (None, None) => {
            handler
                .on_message(
                    peer,
                    PeerMessage::Fatal("frame with neither method nor id".into()),
                )
                .await;
            false
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
