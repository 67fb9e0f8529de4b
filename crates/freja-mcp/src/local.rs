// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The in-process MCP source: a JSON config blob owned by the UI.
//!
//! Unlike the CLI sources this one has no external tool to shell out to;
//! `detect` reads the blob and `install` merges entries into it. `remove`
//! is deliberately a no-op: the UI owns that file's lifecycle, and
//! deleting entries behind its back desyncs the settings screen.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};

use freja_config::JsonStore;

use crate::probe::Prober;
use crate::source::McpSource;
use crate::types::{InstallReport, McpServer, McpTransport, ServerStatus, TransportKind};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub const SOURCE_NAME: &str = "integrated";

pub struct LocalSource {
    store: JsonStore,
    prober: Arc<dyn Prober>,
}

impl LocalSource {
    pub fn new(store: JsonStore, prober: Arc<dyn Prober>) -> Self {
        Self { store, prober }
    }

    fn parse_entry(name: &str, entry: &Value) -> Option<McpServer> {
        let transport: McpTransport =
            serde_json::from_value(entry.get("transport")?.clone()).ok()?;
        let mut server = McpServer::new(name, transport);
        server.enabled = entry
            .get("enabled")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        server.description = entry
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        server.original_json = Some(entry.clone());
        Some(server)
    }
}

#[async_trait]
impl McpSource for LocalSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn supported_transports(&self) -> &[TransportKind] {
        &[
            TransportKind::Stdio,
            TransportKind::Sse,
            TransportKind::Http,
            TransportKind::StreamableHttp,
        ]
    }

    async fn detect(&self, _cli_path: Option<&Path>) -> anyhow::Result<Vec<McpServer>> {
        let blob = self.store.read()?;
        let Some(entries) = blob.get("servers").and_then(Value::as_object) else {
            return Ok(Vec::new());
        };

        let mut servers = Vec::with_capacity(entries.len());
        for (name, entry) in entries {
            let Some(mut server) = Self::parse_entry(name, entry) else {
                debug!(server = %name, "unparseable local mcp entry, skipping");
                continue;
            };
            if server.enabled {
                let probe = self.prober.probe(&server, PROBE_TIMEOUT).await;
                if probe.success {
                    server.status = ServerStatus::Connected;
                    server.tools = probe.tools.unwrap_or_default();
                }
            }
            server.updated_at = Utc::now();
            servers.push(server);
        }
        Ok(servers)
    }

    async fn install(&self, servers: &[McpServer]) -> Vec<InstallReport> {
        let mut reports = Vec::with_capacity(servers.len());
        for server in servers {
            let entry = json!({
                "transport": server.transport,
                "enabled": server.enabled,
                "description": server.description,
            });
            let name = server.name.clone();
            let outcome = self.store.update(|blob| {
                if !blob.is_object() {
                    *blob = json!({});
                }
                if let Some(map) = blob.as_object_mut() {
                    let servers = map.entry("servers").or_insert_with(|| json!({}));
                    if let Some(servers) = servers.as_object_mut() {
                        servers.insert(name.clone(), entry);
                    }
                }
            });
            reports.push(match outcome {
                Ok(_) => InstallReport {
                    name: server.name.clone(),
                    success: true,
                    error: None,
                    skipped: false,
                },
                Err(e) => InstallReport {
                    name: server.name.clone(),
                    success: false,
                    error: Some(e.to_string()),
                    skipped: false,
                },
            });
        }
        reports
    }

    async fn remove(&self, name: &str) -> anyhow::Result<()> {
        // Ownership asymmetry, by contract: the UI writes this file, the
        // core only reads it. Report success without touching the blob.
        info!(server = %name, "local mcp remove requested; config is UI-owned, leaving entry");
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::StubProber;
    use crate::types::ConnectionTest;

    fn store(dir: &tempfile::TempDir) -> JsonStore {
        JsonStore::named(dir.path(), "mcp")
    }

    #[tokio::test]
    async fn detect_reads_entries_and_probes_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        s.write(&json!({"servers": {
            "fs": {
                "transport": {"type": "stdio", "command": "npx", "args": ["server-fs"]},
                "enabled": true,
                "description": "local files"
            },
            "paused": {
                "transport": {"type": "sse", "url": "https://x/sse"},
                "enabled": false
            }
        }}))
        .unwrap();

        let prober = StubProber::returning(ConnectionTest::ok(vec!["read".into()]));
        let source = LocalSource::new(s, prober.clone());
        let mut servers = source.detect(None).await.unwrap();
        servers.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(servers.len(), 2);
        let fs = servers.iter().find(|s| s.name == "fs").unwrap();
        assert_eq!(fs.status, ServerStatus::Connected);
        assert_eq!(fs.tools, vec!["read"]);
        assert_eq!(fs.description, "local files");

        let paused = servers.iter().find(|s| s.name == "paused").unwrap();
        assert!(!paused.enabled);
        assert_eq!(paused.status, ServerStatus::Disconnected);

        // Disabled servers are never probed.
        assert_eq!(prober.probes(), 1);
    }

    #[tokio::test]
    async fn install_merges_into_blob() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        let prober = StubProber::returning(ConnectionTest::ok(vec![]));
        let source = LocalSource::new(s.clone(), prober);

        let server = McpServer::new(
            "github",
            McpTransport::Http {
                url: "https://mcp.github.com".into(),
                headers: Default::default(),
            },
        );
        let reports = source.install(&[server]).await;
        assert!(reports[0].success);

        let blob = s.read().unwrap();
        assert_eq!(blob["servers"]["github"]["transport"]["type"], "http");
    }

    #[tokio::test]
    async fn remove_leaves_the_blob_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        s.write(&json!({"servers": {"fs": {
            "transport": {"type": "stdio", "command": "npx"}
        }}}))
        .unwrap();

        let prober = StubProber::returning(ConnectionTest::ok(vec![]));
        let source = LocalSource::new(s.clone(), prober);

        source.remove("fs").await.unwrap();
        assert!(s.read().unwrap()["servers"]["fs"].is_object());
    }
}
