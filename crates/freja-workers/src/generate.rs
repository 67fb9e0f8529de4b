// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The built-in generation seam for the integrated worker.
//!
//! freja never speaks an LLM wire protocol itself; the embedding
//! application supplies a [`Generator`] and the integrated worker drives
//! it. The [`GeneratorPool`] caches one generator per model config so a
//! model switch builds a fresh client while untouched conversations keep
//! their warm one.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use tokio::sync::Mutex;

/// One step of a generation stream.
#[derive(Debug, Clone)]
pub enum GenEvent {
    /// A streamed text chunk.
    TextDelta(String),
    /// The generator wants a tool executed.
    ToolCallStarted {
        call_id: String,
        name: String,
        args: Value,
    },
    /// A tool finished; `output` is the display form.
    ToolCallFinished {
        call_id: String,
        output: String,
        is_error: bool,
    },
    /// Terminal event of a turn.
    Done,
}

/// Prior turns replayed into the generator as context.
#[derive(Debug, Clone)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct GenRequest {
    /// Opaque model config blob from the conversation row.
    pub model: Option<Value>,
    pub input: String,
    pub context: Vec<ContextMessage>,
    /// Preset rules prepended by the conversation's `extra`.
    pub rules: Option<String>,
}

pub type GenStream = Pin<Box<dyn Stream<Item = anyhow::Result<GenEvent>> + Send>>;

#[async_trait]
pub trait Generator: Send + Sync {
    /// Human-readable backend name for status display.
    fn name(&self) -> &str;

    /// Start one turn and stream its events. The stream ends after
    /// [`GenEvent::Done`] or an error.
    async fn generate(&self, req: GenRequest) -> anyhow::Result<GenStream>;
}

/// Builds a generator for a given model config blob.
pub type GeneratorFactory =
    Box<dyn Fn(Option<&Value>) -> anyhow::Result<Arc<dyn Generator>> + Send + Sync>;

/// Cache of generators keyed by their serialized model config.
pub struct GeneratorPool {
    factory: GeneratorFactory,
    cache: Mutex<HashMap<String, Arc<dyn Generator>>>,
}

impl GeneratorPool {
    pub fn new(factory: GeneratorFactory) -> Arc<Self> {
        Arc::new(Self {
            factory,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub async fn get(&self, model: Option<&Value>) -> anyhow::Result<Arc<dyn Generator>> {
        let key = model
            .map(|m| m.to_string())
            .unwrap_or_else(|| "default".to_string());
        let mut cache = self.cache.lock().await;
        if let Some(existing) = cache.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let built = (self.factory)(model)?;
        cache.insert(key, Arc::clone(&built));
        Ok(built)
    }

    /// Drop the cached client for a model config (called when the config
    /// changes so the next turn rebuilds).
    pub async fn invalidate(&self, model: Option<&Value>) {
        let key = model
            .map(|m| m.to_string())
            .unwrap_or_else(|| "default".to_string());
        self.cache.lock().await.remove(&key);
    }
}

/// Scripted generator for tests: plays back a fixed event sequence.
pub struct MockGenerator {
    name: String,
    script: Vec<GenEvent>,
}

impl MockGenerator {
    pub fn new(script: Vec<GenEvent>) -> Self {
        Self {
            name: "mock".into(),
            script,
        }
    }

    /// A generator that streams `text` in single-character deltas.
    pub fn streaming_text(text: &str) -> Self {
        let mut script: Vec<GenEvent> = text
            .chars()
            .map(|c| GenEvent::TextDelta(c.to_string()))
            .collect();
        script.push(GenEvent::Done);
        Self::new(script)
    }
}

#[async_trait]
impl Generator for MockGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, _req: GenRequest) -> anyhow::Result<GenStream> {
        let events: Vec<anyhow::Result<GenEvent>> =
            self.script.clone().into_iter().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
