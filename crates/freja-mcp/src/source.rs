// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::types::{InstallReport, McpServer, TransportKind};

/// One MCP config surface: an external agent CLI, or the in-process
/// config blob. Implementations are wrapped in [`SerializedSource`]
/// before the multiplexer touches them.
#[async_trait]
pub trait McpSource: Send + Sync {
    /// Stable source name; also the agent key the UI fans out over.
    fn name(&self) -> &str;

    /// Transport flavors this surface can express. `stdio` is universal.
    fn supported_transports(&self) -> &[TransportKind];

    /// Enumerate configured servers, probing the connected ones for
    /// their tool lists.
    async fn detect(&self, cli_path: Option<&Path>) -> anyhow::Result<Vec<McpServer>>;

    /// Install servers one at a time. One failure never aborts the
    /// batch; unsupported transports are skipped with a warning entry.
    async fn install(&self, servers: &[McpServer]) -> Vec<InstallReport>;

    /// Remove by name. "Not found" counts as success.
    async fn remove(&self, name: &str) -> anyhow::Result<()>;
}

/// FIFO gate in front of a source.
///
/// Two concurrent mutations of the same external tool's config corrupt
/// it (the CLIs rewrite whole files); the tokio mutex here is
/// fair, so queued operations run in arrival order, and a failed
/// operation simply releases the gate for the next one.
pub struct SerializedSource {
    inner: Arc<dyn McpSource>,
    gate: Mutex<()>,
}

impl SerializedSource {
    pub fn new(inner: Arc<dyn McpSource>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gate: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn detect(&self, cli_path: Option<&Path>) -> anyhow::Result<Vec<McpServer>> {
        let _gate = self.gate.lock().await;
        debug!(source = self.name(), "detect");
        self.inner.detect(cli_path).await
    }

    pub async fn install(&self, servers: &[McpServer]) -> Vec<InstallReport> {
        let _gate = self.gate.lock().await;
        debug!(source = self.name(), count = servers.len(), "install");
        self.inner.install(servers).await
    }

    pub async fn remove(&self, name: &str) -> anyhow::Result<()> {
        let _gate = self.gate.lock().await;
        debug!(source = self.name(), server = name, "remove");
        self.inner.remove(name).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
