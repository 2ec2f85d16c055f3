// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stack Updater - Update Orchestrator Service
//!
//! An HTTP service responsible for:
//! - Update sessions (start, status, stream, cancel)
//! - Version resolution (release manifests, live container inspection)
//! - Backup generations (capture, restore, promotion, purging)
//! - Container lifecycle during updates (docker engine adapter)

use std::sync::Arc;

use tracing::{info, warn};

use stack_updater::backup::BackupManager;
use stack_updater::config::Config;
use stack_updater::engine::{ContainerEngine, DockerEngine, DockerEngineConfig};
use stack_updater::migrate::MigrationRunner;
use stack_updater::orchestrator::Orchestrator;
use stack_updater::purge_worker::{PurgeWorker, PurgeWorkerConfig};
use stack_updater::server;
use stack_updater::session::SessionStore;
use stack_updater::version::VersionResolver;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stack_updater=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        workdir = %config.workdir.display(),
        backups_dir = %config.backups_dir.display(),
        "Starting Stack Updater"
    );

    // Container engine
    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerEngine::new(DockerEngineConfig {
        docker_bin: config.docker_bin.clone(),
        workdir: config.workdir.clone(),
        project: config.compose_project.clone(),
        network: config.compose_network.clone(),
        command_timeout: config.exec_timeout,
    }));
    info!(engine_type = engine.engine_type(), "Engine initialized");

    // Components
    let backups = Arc::new(BackupManager::new(
        Arc::clone(&engine),
        config.backups_dir.clone(),
        config.services.clone(),
        config.exec_timeout,
    ));
    let resolver = Arc::new(VersionResolver::new(
        Arc::clone(&engine),
        config.manifest_url.clone(),
        config.default_channel.clone(),
        config.version_cache_ttl,
    ));
    let migrations = Arc::new(MigrationRunner::new(
        Arc::clone(&engine),
        config.migration_timeout,
    ));
    let store = Arc::new(SessionStore::new(
        config.update_logs_dir.clone(),
        config.session_history_limit,
    ));

    let orchestrator = Orchestrator::new(
        engine,
        Arc::clone(&backups),
        resolver,
        migrations,
        Arc::clone(&store),
        config.clone(),
    );

    // Background purge worker
    let purge_worker = PurgeWorker::new(
        PurgeWorkerConfig {
            generation_ttl: config.generation_ttl,
            session_max_age: config.session_history_max_age,
            ..Default::default()
        },
        backups,
        store,
    );
    let purge_shutdown = purge_worker.shutdown_handle();
    let purge_handle = tokio::spawn(async move {
        purge_worker.run().await;
    });

    // Serve until ctrl-c
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
    };
    server::serve(config.http_addr, orchestrator, shutdown).await?;

    // Graceful shutdown
    purge_shutdown.notify_one();
    let _ = purge_handle.await;

    info!("Stack Updater shut down");

    Ok(())
}
