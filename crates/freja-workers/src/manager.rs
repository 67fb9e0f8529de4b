// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Process-wide worker registry.
//!
//! Maps `conversation_id → worker`, building lazily on first use: after a
//! restart the registry is empty and a send triggers a rebuild from the
//! conversation row: SQL first, then the legacy JSON store (which also
//! backfills SQL in the background). Builds for the same id are
//! serialized through a per-id mutex; different ids build in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use freja_storage::legacy::LegacyStore;
use freja_storage::{Conversation, ConversationKind, Storage};

use crate::generate::GeneratorPool;
use crate::pipeline::Pipeline;
use crate::worker::Worker;
use crate::{acp::AcpWorker, codex::CodexWorker, integrated::IntegratedWorker};
use crate::Result;

/// Builds a worker for a conversation row. Tests inject doubles.
#[async_trait]
pub trait WorkerBuilder: Send + Sync {
    async fn build(&self, conversation: &Conversation) -> Result<Arc<dyn Worker>>;
}

/// Production builder: one variant per conversation kind.
pub struct RuntimeBuilder {
    pipeline: Arc<Pipeline>,
    pool: Arc<GeneratorPool>,
}

impl RuntimeBuilder {
    pub fn new(pipeline: Arc<Pipeline>, pool: Arc<GeneratorPool>) -> Arc<Self> {
        Arc::new(Self { pipeline, pool })
    }
}

#[async_trait]
impl WorkerBuilder for RuntimeBuilder {
    async fn build(&self, conversation: &Conversation) -> Result<Arc<dyn Worker>> {
        let worker: Arc<dyn Worker> = match conversation.kind {
            ConversationKind::Integrated => IntegratedWorker::new(
                conversation,
                Arc::clone(&self.pool),
                Arc::clone(&self.pipeline),
            ),
            ConversationKind::Acp => AcpWorker::new(conversation, Arc::clone(&self.pipeline)),
            ConversationKind::Codex => CodexWorker::new(conversation, Arc::clone(&self.pipeline)),
        };
        Ok(worker)
    }
}

pub struct WorkerManager {
    storage: Arc<Storage>,
    legacy: LegacyStore,
    builder: Arc<dyn WorkerBuilder>,
    registry: RwLock<HashMap<String, Arc<dyn Worker>>>,
    build_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorkerManager {
    pub fn new(
        storage: Arc<Storage>,
        legacy: LegacyStore,
        builder: Arc<dyn WorkerBuilder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            legacy,
            builder,
            registry: RwLock::new(HashMap::new()),
            build_locks: Mutex::new(HashMap::new()),
        })
    }

    async fn build_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.build_locks.lock().await;
        Arc::clone(
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Create and register a worker for `conversation`. Idempotent: an
    /// already-registered id returns the existing worker untouched.
    pub async fn build_conversation(&self, conversation: &Conversation) -> Result<Arc<dyn Worker>> {
        let lock = self.build_lock(&conversation.id).await;
        let _guard = lock.lock().await;

        if let Some(existing) = self.registry.read().await.get(&conversation.id) {
            return Ok(Arc::clone(existing));
        }
        let worker = self.builder.build(conversation).await?;
        self.registry
            .write()
            .await
            .insert(conversation.id.clone(), Arc::clone(&worker));
        info!(
            conversation_id = %conversation.id,
            kind = conversation.kind.as_str(),
            "worker built"
        );
        Ok(worker)
    }

    pub async fn get_task_by_id(&self, id: &str) -> Option<Arc<dyn Worker>> {
        self.registry.read().await.get(id).cloned()
    }

    /// Registered worker, or rebuild from durable state: SQL first, then
    /// the legacy JSON store (triggering a background backfill into SQL).
    /// `None` when no source knows the conversation.
    pub async fn get_task_by_id_rollback_build(&self, id: &str) -> Result<Option<Arc<dyn Worker>>> {
        if let Some(existing) = self.get_task_by_id(id).await {
            return Ok(Some(existing));
        }

        if let Some(conversation) = self.storage.get_conversation(id)? {
            return Ok(Some(self.build_conversation(&conversation).await?));
        }

        let Some(record) = self.legacy.load(id) else {
            return Ok(None);
        };
        debug!(conversation_id = %id, "rebuilding from legacy history");
        self.storage.create_conversation(&record.conversation)?;

        // Backfill the message log off the critical path; the worker can
        // start its first turn while old rows stream in.
        let storage = Arc::clone(&self.storage);
        let messages = record.messages;
        tokio::spawn(async move {
            for m in &messages {
                if let Err(e) = storage.insert_message(m) {
                    warn!(message_id = %m.id, error = %e, "legacy backfill insert failed");
                }
            }
            debug!(count = messages.len(), "legacy backfill complete");
        });

        Ok(Some(self.build_conversation(&record.conversation).await?))
    }

    /// Cancel, close, and unregister. No-op for unknown ids.
    pub async fn kill(&self, id: &str) {
        let removed = self.registry.write().await.remove(id);
        if let Some(worker) = removed {
            worker.shutdown().await;
            info!(conversation_id = %id, "worker killed");
        }
    }

    /// Kill everything. Used by `reset` and process shutdown.
    pub async fn clear(&self) {
        let drained: Vec<(String, Arc<dyn Worker>)> =
            self.registry.write().await.drain().collect();
        for (id, worker) in drained {
            worker.shutdown().await;
            debug!(conversation_id = %id, "worker cleared");
        }
    }

    /// `reset(Some(id))` = kill that worker; `reset(None)` = clear all.
    pub async fn reset(&self, id: Option<&str>) {
        match id {
            Some(id) => self.kill(id).await,
            None => self.clear().await,
        }
    }

    /// Rebuild policy: a model change (deep equality on the serialized
    /// blob) invalidates the live worker; the next send rebuilds it with
    /// the new config.
    pub async fn on_conversation_updated(
        &self,
        before: Option<&Value>,
        after: Option<&Value>,
        id: &str,
    ) {
        if before != after {
            debug!(conversation_id = %id, "model config changed, killing worker");
            self.kill(id).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.registry.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.read().await.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
