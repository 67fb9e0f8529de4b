// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The boundary between the core and whatever renders it.
//!
//! Every UI interaction is a request/reply call on a named channel, or a
//! fire-and-forget emission the UI may or may not be subscribed to. The
//! handlers here are deliberately thin: decode the payload, call one
//! core service, wrap the result in the `{success, data?, msg?}`
//! envelope. No business logic lives at this layer.

mod bus;
pub mod conversation;
pub mod database;
pub mod mcp;
pub mod search;
pub mod system;

pub use bus::{BusEvent, LocalBus, Reply};

use std::sync::Arc;

use freja_config::{JsonStore, Paths};
use freja_mcp::McpMultiplexer;
use freja_storage::Storage;
use freja_workers::{Pipeline, WorkerManager};

/// Everything the channel handlers need, constructed by the embedder.
pub struct Services {
    pub storage: Arc<Storage>,
    pub manager: Arc<WorkerManager>,
    pub pipeline: Arc<Pipeline>,
    pub mcp: Arc<McpMultiplexer>,
    pub paths: Paths,
    pub system_store: JsonStore,
}

/// Channel the worker event stream is mirrored onto.
pub const RESPONSE_STREAM: &str = "conversation:responseStream";
/// Channel workspace-search hits are emitted on.
pub const SEARCH_RESULTS: &str = "conversation:responseSearchWorkSpace";

/// Register every core channel on the bus and start mirroring worker
/// events to [`RESPONSE_STREAM`].
pub async fn register_all(bus: &Arc<LocalBus>, services: Arc<Services>) {
    conversation::register(bus, Arc::clone(&services)).await;
    database::register(bus, Arc::clone(&services)).await;
    mcp::register(bus, Arc::clone(&services)).await;
    system::register(bus, Arc::clone(&services)).await;
    search::register(bus, Arc::clone(&services), search::WorkspaceSearcher::new()).await;

    // Fire-and-forget mirror of the typed event stream. Persistence has
    // already happened by the time an event reaches the bus; a missing
    // subscriber just means nobody is watching.
    let mut events = services.pipeline.bus().subscribe();
    let bus = Arc::clone(bus);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Ok(payload) = serde_json::to_value(&event) {
                        bus.emit(RESPONSE_STREAM, payload);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "ui event mirror lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}
