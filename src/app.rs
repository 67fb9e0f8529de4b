// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use freja_bridge::{LocalBus, Services};
use freja_config::{JsonStore, Paths};
use freja_mcp::{
    cli::{CliSource, ProcessRunner},
    local::LocalSource,
    McpMultiplexer, SerializedSource, TransportProber,
};
use freja_storage::{legacy::LegacyStore, Storage};
use freja_stream::{BufferOptions, StreamBuffer};
use freja_workers::{
    generate::{GeneratorFactory, GeneratorPool},
    EventBus, Pipeline, RuntimeBuilder, WorkerManager,
};

pub struct AppOptions {
    pub paths: Paths,
    /// Builds generation clients for the integrated worker. The core
    /// never speaks an LLM protocol itself; the shell owns that.
    pub generator_factory: GeneratorFactory,
    /// Streaming buffer tuning; the defaults suit interactive use.
    pub buffer: BufferOptions,
}

impl AppOptions {
    pub fn new(paths: Paths, generator_factory: GeneratorFactory) -> Self {
        Self {
            paths,
            generator_factory,
            buffer: BufferOptions::default(),
        }
    }
}

/// The assembled core. All services are explicitly constructed here and
/// nowhere else; tests build the same graph with doubles injected at
/// the trait seams.
pub struct App {
    pub bus: Arc<LocalBus>,
    pub services: Arc<Services>,
}

impl App {
    pub async fn new(options: AppOptions) -> anyhow::Result<Self> {
        let AppOptions {
            paths,
            generator_factory,
            buffer,
        } = options;

        paths.ensure().context("creating state directories")?;
        let storage = Arc::new(Storage::open(&paths.database_file())?);
        storage.ensure_system_user()?;

        let stream_buffer = StreamBuffer::new(Arc::clone(&storage), buffer);
        let pipeline = Pipeline::new(
            Arc::clone(&storage),
            stream_buffer,
            EventBus::default(),
        );

        let pool = GeneratorPool::new(generator_factory);
        let builder = RuntimeBuilder::new(Arc::clone(&pipeline), pool);
        let manager = WorkerManager::new(
            Arc::clone(&storage),
            LegacyStore::new(paths.legacy_history_dir()),
            builder,
        );

        let runner = Arc::new(ProcessRunner);
        let prober = Arc::new(TransportProber);
        let mcp = Arc::new(McpMultiplexer::new(
            vec![
                SerializedSource::new(Arc::new(CliSource::claude(
                    runner.clone(),
                    prober.clone(),
                ))),
                SerializedSource::new(Arc::new(CliSource::gemini(
                    runner.clone(),
                    prober.clone(),
                ))),
                SerializedSource::new(Arc::new(LocalSource::new(
                    JsonStore::named(&paths.config_dir, "mcp"),
                    prober.clone(),
                ))),
            ],
            prober,
        ));

        let system_store = JsonStore::named(&paths.config_dir, "system");
        let services = Arc::new(Services {
            storage,
            manager,
            pipeline,
            mcp,
            paths,
            system_store,
        });

        let bus = LocalBus::new();
        freja_bridge::register_all(&bus, Arc::clone(&services)).await;
        info!("freja core ready");

        Ok(Self { bus, services })
    }

    /// Kill all workers and release subprocesses. Storage flushes on
    /// drop; the database needs no explicit close.
    pub async fn shutdown(&self) {
        self.services.manager.clear().await;
        info!("freja core shut down");
    }
}
