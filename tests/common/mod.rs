// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared test fixtures: a mock-engine stack wired to a wiremock release
//! endpoint.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stack_updater::backup::BackupManager;
use stack_updater::config::{Config, ServiceNames};
use stack_updater::engine::{ContainerEngine, MockEngine};
use stack_updater::migrate::MigrationRunner;
use stack_updater::orchestrator::Orchestrator;
use stack_updater::session::{SessionStore, UpdateSession};
use stack_updater::version::VersionResolver;

pub fn service_names() -> ServiceNames {
    ServiceNames {
        frontend: "app".to_string(),
        backend: "backend".to_string(),
        relational: "postgres".to_string(),
        timeseries: "influxdb".to_string(),
    }
}

/// Engine with the full stack running at 1.4.0.
pub fn stack_engine() -> Arc<MockEngine> {
    Arc::new(
        MockEngine::new()
            .with_service("app", "acme/app:1.4.0")
            .with_service("backend", "acme/backend:1.4.0")
            .with_service("postgres", "postgres:16")
            .with_service("influxdb", "influxdb:2"),
    )
}

/// Serve a release manifest for the stable channel.
pub async fn manifest_server(version: &str, with_digests: bool) -> MockServer {
    let server = MockServer::start().await;
    let mut body = serde_json::json!({
        "version": version,
        "channel": "stable",
        "services": {
            "app": format!("acme/app:{version}"),
            "backend": format!("acme/backend:{version}"),
        },
    });
    if with_digests {
        body["digests"] = serde_json::json!({
            "app": "sha256:appnew",
            "backend": "sha256:backnew",
        });
    }
    Mock::given(method("GET"))
        .and(path("/manifests/stable"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;
    server
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub engine: Arc<MockEngine>,
    pub store: Arc<SessionStore>,
    pub backups: Arc<BackupManager>,
    pub config: Config,
    _tmp: TempDir,
}

pub fn test_config(tmp: &std::path::Path, manifest_url: &str) -> Config {
    Config {
        http_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        docker_bin: None,
        workdir: tmp.join("work"),
        compose_project: "stack".to_string(),
        compose_network: None,
        backups_dir: tmp.join("backups"),
        update_logs_dir: tmp.join("logs"),
        manifest_url: Some(manifest_url.to_string()),
        default_channel: "stable".to_string(),
        version_cache_ttl: Duration::from_secs(3600),
        registry_url: None,
        min_free_disk_bytes: 0,
        health_timeout: Duration::from_millis(400),
        health_poll_interval: Duration::from_millis(10),
        migration_timeout: Duration::from_secs(5),
        exec_timeout: Duration::from_secs(5),
        services: service_names(),
        health_services: vec!["backend".to_string(), "app".to_string()],
        generation_ttl: Duration::from_secs(3600),
        session_history_limit: 16,
        session_history_max_age: Duration::from_secs(3600),
        require_signatures: false,
    }
}

/// Wire a full orchestrator over the given engine and manifest server.
pub fn harness(engine: Arc<MockEngine>, manifest_server_uri: &str) -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path(), &format!("{manifest_server_uri}/manifests/{{channel}}"));

    let engine_dyn: Arc<dyn ContainerEngine> = engine.clone();
    let backups = Arc::new(BackupManager::new(
        Arc::clone(&engine_dyn),
        config.backups_dir.clone(),
        config.services.clone(),
        config.exec_timeout,
    ));
    let resolver = Arc::new(VersionResolver::new(
        Arc::clone(&engine_dyn),
        config.manifest_url.clone(),
        config.default_channel.clone(),
        config.version_cache_ttl,
    ));
    let migrations = Arc::new(MigrationRunner::new(
        Arc::clone(&engine_dyn),
        config.migration_timeout,
    ));
    let store = Arc::new(SessionStore::new(
        config.update_logs_dir.clone(),
        config.session_history_limit,
    ));

    let orchestrator = Orchestrator::new(
        engine_dyn,
        Arc::clone(&backups),
        resolver,
        migrations,
        Arc::clone(&store),
        config.clone(),
    );

    Harness {
        orchestrator,
        engine,
        store,
        backups,
        config,
        _tmp: tmp,
    }
}

/// Poll a session until it reaches a terminal state.
pub async fn wait_terminal(store: &SessionStore, id: Uuid) -> UpdateSession {
    for _ in 0..500 {
        if let Some(session) = store.snapshot(id)
            && session.state.is_terminal()
        {
            return session;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {id} did not reach a terminal state");
}
