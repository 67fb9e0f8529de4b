// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use freja_storage::ConversationKind;

use crate::{Result, WorkerError};

/// One inbound turn request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub input: String,
    /// Logical chunk id for this turn's streamed reply.
    pub msg_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<PathBuf>>,
    /// UI placeholder row to resolve once streaming begins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loading_id: Option<String>,
}

/// Reply to a pending permission prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confirmation {
    #[serde(rename = "confirmKey")]
    pub confirm_key: String,
    pub msg_id: String,
    #[serde(rename = "callId")]
    pub call_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Error,
    Closed,
}

/// The contract all three worker variants implement.
///
/// `send_message` returns once the turn is **accepted** (enqueued and its
/// task spawned), not when it completes; completion is observed through
/// the event stream. A busy worker rejects with [`WorkerError::Busy`];
/// the single-slot/reject policy is uniform across variants.
#[async_trait]
pub trait Worker: Send + Sync {
    fn kind(&self) -> ConversationKind;

    /// Immutable for the worker's lifetime; moving a conversation's
    /// workspace means building a new conversation.
    fn workspace(&self) -> &Path;

    fn status(&self) -> WorkerStatus;

    async fn send_message(&self, req: SendRequest) -> Result<()>;

    async fn confirm_message(&self, confirmation: Confirmation) -> Result<()>;

    /// Cooperatively cancel the in-flight turn. Chunks already flushed to
    /// storage stay; nothing further is emitted for the turn.
    async fn stop(&self);

    /// Re-seed in-memory context from recent history. Integrated only.
    async fn reload_context(&self) -> Result<()> {
        Err(WorkerError::Unsupported(self.kind().as_str()))
    }

    /// Tear down transport resources (subprocesses). Called by the
    /// manager on kill; implies `stop`.
    async fn shutdown(&self);
}

/// Single-slot turn admission: at most one turn runs at a time.
#[derive(Clone, Default)]
pub(crate) struct TurnSlot {
    busy: Arc<AtomicBool>,
}

impl TurnSlot {
    /// Claim the slot or fail with `Busy`. The returned guard frees the
    /// slot on drop, so a panicking or cancelled turn task cannot wedge
    /// the worker.
    pub fn try_begin(&self) -> Result<TurnGuard> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(WorkerError::Busy);
        }
        Ok(TurnGuard {
            busy: Arc::clone(&self.busy),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

pub(crate) struct TurnGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Lock-free status cell shared between the worker facade and its tasks.
#[derive(Clone)]
pub(crate) struct StatusCell {
    value: Arc<AtomicU8>,
}

impl StatusCell {
    pub fn new(status: WorkerStatus) -> Self {
        let cell = Self {
            value: Arc::new(AtomicU8::new(0)),
        };
        cell.set(status);
        cell
    }

    pub fn set(&self, status: WorkerStatus) {
        let raw = match status {
            WorkerStatus::Idle => 0,
            WorkerStatus::Busy => 1,
            WorkerStatus::Error => 2,
            WorkerStatus::Closed => 3,
        };
        self.value.store(raw, Ordering::SeqCst);
    }

    pub fn get(&self) -> WorkerStatus {
        match self.value.load(Ordering::SeqCst) {
            0 => WorkerStatus::Idle,
            1 => WorkerStatus::Busy,
            2 => WorkerStatus::Error,
            _ => WorkerStatus::Closed,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
