// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The aggregate view over every MCP source.
//!
//! Detection fans out in parallel (one in-flight operation per source is
//! still enforced by each source's own queue); sync and removal fan out
//! the same way and report per-agent outcomes instead of failing the
//! whole batch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cli::find_in_path;
use crate::probe::Prober;
use crate::source::SerializedSource;
use crate::types::{AgentReport, ConnectionTest, McpServer};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One detection/sync target named by the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTarget {
    pub agent: String,
    #[serde(rename = "cliPath", default, skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<PathBuf>,
}

impl AgentTarget {
    pub fn named(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            cli_path: None,
        }
    }
}

/// Detection result for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentServers {
    pub agent: String,
    pub servers: Vec<McpServer>,
}

type PathLookup = Box<dyn Fn(&str) -> Option<PathBuf> + Send + Sync>;

pub struct McpMultiplexer {
    sources: HashMap<String, Arc<SerializedSource>>,
    prober: Arc<dyn Prober>,
    path_lookup: PathLookup,
}

impl McpMultiplexer {
    pub fn new(sources: Vec<Arc<SerializedSource>>, prober: Arc<dyn Prober>) -> Self {
        Self {
            sources: sources
                .into_iter()
                .map(|s| (s.name().to_string(), s))
                .collect(),
            prober,
            path_lookup: Box::new(|name| find_in_path(name)),
        }
    }

    /// Override PATH lookup (tests).
    pub fn with_path_lookup(mut self, lookup: PathLookup) -> Self {
        self.path_lookup = lookup;
        self
    }

    pub fn source(&self, agent: &str) -> Option<&Arc<SerializedSource>> {
        self.sources.get(agent)
    }

    /// Expand the UI's target list: when the integrated agent is in play
    /// and the claude CLI is also installed, its config surface is worth
    /// detecting too even though the UI did not name it.
    fn expand_targets(&self, agents: &[AgentTarget]) -> Vec<AgentTarget> {
        let mut targets = agents.to_vec();
        let has_integrated = targets.iter().any(|t| t.agent == crate::local::SOURCE_NAME);
        let has_claude = targets.iter().any(|t| t.agent == "claude");
        if has_integrated && !has_claude {
            if let Some(path) = (self.path_lookup)("claude") {
                debug!(path = %path.display(), "claude CLI found on PATH, adding detection target");
                targets.push(AgentTarget {
                    agent: "claude".into(),
                    cli_path: Some(path),
                });
            }
        }
        targets
    }

    /// Fan out `detect` across the named agents; only non-empty results
    /// are returned.
    pub async fn get_agent_mcp_configs(&self, agents: &[AgentTarget]) -> Vec<AgentServers> {
        let targets = self.expand_targets(agents);
        let tasks = targets.iter().map(|target| async {
            let Some(source) = self.sources.get(&target.agent) else {
                warn!(agent = %target.agent, "unknown mcp source");
                return None;
            };
            match source.detect(target.cli_path.as_deref()).await {
                Ok(servers) if servers.is_empty() => None,
                Ok(servers) => Some(AgentServers {
                    agent: target.agent.clone(),
                    servers,
                }),
                Err(e) => {
                    warn!(agent = %target.agent, error = %e, "detect failed");
                    None
                }
            }
        });
        join_all(tasks).await.into_iter().flatten().collect()
    }

    /// Install the enabled subset of `servers` into every named agent.
    pub async fn sync_mcp_to_agents(
        &self,
        servers: &[McpServer],
        agents: &[AgentTarget],
    ) -> Vec<AgentReport> {
        let enabled: Vec<McpServer> = servers.iter().filter(|s| s.enabled).cloned().collect();
        let tasks = agents.iter().map(|target| {
            let enabled = enabled.clone();
            async move {
                let Some(source) = self.sources.get(&target.agent) else {
                    return AgentReport {
                        agent: target.agent.clone(),
                        success: false,
                        error: Some(format!("unknown agent {}", target.agent)),
                        installs: Vec::new(),
                    };
                };
                let installs = source.install(&enabled).await;
                let success = installs.iter().all(|r| r.success || r.skipped);
                AgentReport {
                    agent: target.agent.clone(),
                    success,
                    error: None,
                    installs,
                }
            }
        });
        join_all(tasks).await
    }

    /// Remove one server by name from every named agent.
    pub async fn remove_mcp_from_agents(
        &self,
        name: &str,
        agents: &[AgentTarget],
    ) -> Vec<AgentReport> {
        let tasks = agents.iter().map(|target| async move {
            let Some(source) = self.sources.get(&target.agent) else {
                return AgentReport {
                    agent: target.agent.clone(),
                    success: false,
                    error: Some(format!("unknown agent {}", target.agent)),
                    installs: Vec::new(),
                };
            };
            match source.remove(name).await {
                Ok(()) => AgentReport {
                    agent: target.agent.clone(),
                    success: true,
                    error: None,
                    installs: Vec::new(),
                },
                Err(e) => AgentReport {
                    agent: target.agent.clone(),
                    success: false,
                    error: Some(e.to_string()),
                    installs: Vec::new(),
                },
            }
        });
        join_all(tasks).await
    }

    /// Probe one server without touching any source config.
    pub async fn test_connection(&self, server: &McpServer) -> ConnectionTest {
        self.prober.probe(server, TEST_TIMEOUT).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
