// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Workspace directory search.
//!
//! The UI's "open workspace" picker asks the core to walk a root for
//! directories whose name matches a query, streaming hits over the
//! `responseSearchWorkSpace` emitter. Starting a new search aborts the
//! previous one; a fast typist should never receive stale batches.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

use crate::bus::{LocalBus, Reply};
use crate::{Services, SEARCH_RESULTS};

const MAX_DEPTH: usize = 4;
const BATCH_SIZE: usize = 25;
const MAX_RESULTS: usize = 500;

#[derive(Debug, Deserialize)]
struct SearchPayload {
    root: PathBuf,
    #[serde(default)]
    query: String,
}

/// Holds the abort handle of the search in flight.
pub struct WorkspaceSearcher {
    current: Mutex<Option<CancellationToken>>,
}

impl WorkspaceSearcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(None),
        })
    }

    fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        token
    }
}

/// Blocking directory walk, run on the blocking pool. Emits batches of
/// hits and one terminal `{done: true}` payload unless aborted.
fn walk(
    root: PathBuf,
    query: String,
    token: CancellationToken,
    bus: Arc<LocalBus>,
) {
    let needle = query.to_lowercase();
    let mut batch: Vec<Value> = Vec::with_capacity(BATCH_SIZE);
    let mut total = 0usize;

    let entries = WalkDir::new(&root)
        .max_depth(MAX_DEPTH)
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !(name.starts_with('.') || name == "node_modules" || name == "target")
        });

    for entry in entries {
        if token.is_cancelled() {
            debug!(root = %root.display(), "workspace search aborted");
            return;
        }
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if !needle.is_empty() && !name.contains(&needle) {
            continue;
        }
        batch.push(json!({"path": entry.path(), "name": entry.file_name().to_string_lossy()}));
        total += 1;
        if batch.len() >= BATCH_SIZE {
            bus.emit(SEARCH_RESULTS, json!({"hits": batch, "done": false}));
            batch = Vec::with_capacity(BATCH_SIZE);
        }
        if total >= MAX_RESULTS {
            break;
        }
    }

    if !token.is_cancelled() {
        bus.emit(SEARCH_RESULTS, json!({"hits": batch, "done": true, "total": total}));
    }
}

pub async fn register(bus: &Arc<LocalBus>, _services: Arc<Services>, searcher: Arc<WorkspaceSearcher>) {
    let bus_for_handler = Arc::clone(bus);
    bus.register("conversation:searchWorkSpace", move |payload| {
        let bus = Arc::clone(&bus_for_handler);
        let searcher = Arc::clone(&searcher);
        async move {
            let payload: SearchPayload = match serde_json::from_value(payload) {
                Ok(p) => p,
                Err(e) => return Reply::err(format!("invalid payload: {e}")),
            };
            let token = searcher.begin();
            let root = payload.root.clone();
            let query = payload.query.clone();
            tokio::task::spawn_blocking(move || walk(root, query, token, bus));
            Reply::ok(json!({"started": true}))
        }
    })
    .await;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn search_emits_matching_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("projects/freja-app")).unwrap();
        std::fs::create_dir_all(tmp.path().join("projects/other")).unwrap();

        let bus = LocalBus::new();
        let mut rx = bus.subscribe();
        let searcher = WorkspaceSearcher::new();
        let token = searcher.begin();

        let root = tmp.path().to_path_buf();
        let bus_clone = Arc::clone(&bus);
        tokio::task::spawn_blocking(move || walk(root, "freja".into(), token, bus_clone))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.channel, SEARCH_RESULTS);
        let hits = event.payload["hits"].as_array().unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0]["name"].as_str().unwrap().contains("freja"));
        assert_eq!(event.payload["done"], true);
    }

    #[tokio::test]
    async fn new_search_aborts_previous() {
        let searcher = WorkspaceSearcher::new();
        let first = searcher.begin();
        assert!(!first.is_cancelled());
        let _second = searcher.begin();
        assert!(first.is_cancelled());
    }

    #[tokio::test]
    async fn aborted_search_emits_nothing_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("a")).unwrap();

        let bus = LocalBus::new();
        let mut rx = bus.subscribe();
        let searcher = WorkspaceSearcher::new();
        let token = searcher.begin();
        token.cancel();

        let root = tmp.path().to_path_buf();
        let bus_clone = Arc::clone(&bus);
        tokio::task::spawn_blocking(move || walk(root, String::new(), token, bus_clone))
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
    }
}
