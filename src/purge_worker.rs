// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for purging stale backups and old sessions.
//!
//! Backup generations are kept on disk past their session so operators can
//! restore by hand; this worker removes unpromoted generations past their
//! TTL (the known-good generation is never touched) and evicts terminal
//! sessions past the history age bound.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::backup::BackupManager;
use crate::session::SessionStore;

/// Configuration for the purge worker.
#[derive(Debug, Clone)]
pub struct PurgeWorkerConfig {
    /// How often to run a purge cycle.
    pub poll_interval: Duration,
    /// Age after which an unpromoted generation is removed.
    pub generation_ttl: Duration,
    /// Age after which a terminal session is evicted.
    pub session_max_age: Duration,
}

impl Default for PurgeWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3600),
            generation_ttl: Duration::from_secs(14 * 24 * 3600),
            session_max_age: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Background worker that purges stale backup generations and sessions.
pub struct PurgeWorker {
    config: PurgeWorkerConfig,
    backups: Arc<BackupManager>,
    sessions: Arc<SessionStore>,
    shutdown: Arc<Notify>,
}

impl PurgeWorker {
    /// Create a new purge worker.
    pub fn new(
        config: PurgeWorkerConfig,
        backups: Arc<BackupManager>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            config,
            backups,
            sessions,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the purge loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            generation_ttl_hours = self.config.generation_ttl.as_secs() / 3600,
            "Purge worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Purge worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.purge_cycle().await;
                }
            }
        }

        info!("Purge worker stopped");
    }

    async fn purge_cycle(&self) {
        match self.backups.purge_stale(self.config.generation_ttl).await {
            Ok(0) => debug!("Purge cycle completed, no stale generations"),
            Ok(purged) => info!(purged, "Purge cycle removed stale generations"),
            Err(e) => error!(error = %e, "Failed to purge stale generations"),
        }

        let max_age = chrono::Duration::from_std(self.config.session_max_age)
            .unwrap_or(chrono::Duration::MAX);
        let evicted = self.sessions.evict_older_than(max_age);
        if evicted > 0 {
            info!(evicted, "Evicted old terminal sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceNames;
    use crate::engine::MockEngine;

    #[test]
    fn test_config_default() {
        let config = PurgeWorkerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(3600));
        assert_eq!(config.generation_ttl, Duration::from_secs(14 * 24 * 3600));
    }

    #[tokio::test]
    async fn test_purge_cycle_on_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(MockEngine::new());
        let backups = Arc::new(BackupManager::new(
            engine,
            dir.path().join("backups"),
            ServiceNames {
                frontend: "app".to_string(),
                backend: "backend".to_string(),
                relational: "postgres".to_string(),
                timeseries: "influxdb".to_string(),
            },
            Duration::from_secs(30),
        ));
        let sessions = Arc::new(SessionStore::new(dir.path().join("logs"), 16));
        let worker = PurgeWorker::new(PurgeWorkerConfig::default(), backups, sessions);

        // Must not error with nothing to purge.
        worker.purge_cycle().await;
    }

    #[test]
    fn test_shutdown_handle() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(MockEngine::new());
        let backups = Arc::new(BackupManager::new(
            engine,
            dir.path(),
            ServiceNames {
                frontend: "app".to_string(),
                backend: "backend".to_string(),
                relational: "postgres".to_string(),
                timeseries: "influxdb".to_string(),
            },
            Duration::from_secs(30),
        ));
        let sessions = Arc::new(SessionStore::new(dir.path(), 16));
        let worker = PurgeWorker::new(PurgeWorkerConfig::default(), backups, sessions);
        let handle = worker.shutdown_handle();
        assert!(Arc::strong_count(&handle) >= 2);
    }
}
