// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup generations: capture, restore, promotion and pruning.
//!
//! A *generation* is one timestamped directory under the backups root
//! holding the relational dump, the time-series snapshot, a config archive
//! and a `metadata.json` recording the image digests running at capture
//! time. Capture writes into a hidden staging directory and renames it into
//! place, so a generation either exists completely or not at all.
//!
//! Layout:
//!
//! ```text
//! /backups/
//!   known_good                  <- pointer file, id of last promoted gen
//!   20250827T101500/
//!     metadata.json
//!     postgres/dump.sql
//!     influx/                   <- engine snapshot output
//!     config.tar
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServiceNames;
use crate::engine::{ContainerEngine, ImageRef};
use crate::error::{Error, Result};

/// Generations beyond this many are pruned after promotion.
const RETAINED_GENERATIONS: usize = 2;

const POINTER_FILE: &str = "known_good";
const METADATA_FILE: &str = "metadata.json";
const STAGING_PREFIX: &str = ".staging-";

/// In-container scratch paths used during capture and restore.
const PG_SCRATCH: &str = "/tmp/stack-backup.sql";
const PG_RESTORE_SCRATCH: &str = "/tmp/stack-restore.sql";
const INFLUX_SCRATCH: &str = "/tmp/stack-influx-backup";
const INFLUX_RESTORE_SCRATCH: &str = "/tmp/stack-influx-restore";
const CONFIG_PATH: &str = "/config";

/// Metadata recorded with every generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Generation id (capture timestamp).
    pub id: String,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Update session that captured the generation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    /// Stack version running at capture time, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_version: Option<String>,
    /// Image references (digest-pinned where resolvable) running at capture
    /// time. Rollback re-pins containers to these.
    #[serde(default)]
    pub images: BTreeMap<String, ImageRef>,
}

/// A generation on disk.
#[derive(Debug, Clone)]
pub struct BackupGeneration {
    /// Generation id.
    pub id: String,
    /// Directory holding the generation.
    pub path: PathBuf,
    /// Parsed metadata.
    pub metadata: BackupMetadata,
}

/// Owner of the backups root directory.
pub struct BackupManager {
    engine: Arc<dyn ContainerEngine>,
    root: PathBuf,
    services: ServiceNames,
    exec_timeout: Duration,
}

impl BackupManager {
    /// Create a manager over `root`.
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        root: impl Into<PathBuf>,
        services: ServiceNames,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            root: root.into(),
            services,
            exec_timeout,
        }
    }

    /// Capture a new generation and prune surplus generations beyond the
    /// retention count. Fails without leaving a partial generation behind.
    pub async fn create_generation(
        &self,
        session_id: Option<Uuid>,
        stack_version: Option<&str>,
        images: &BTreeMap<String, ImageRef>,
    ) -> Result<BackupGeneration> {
        tokio::fs::create_dir_all(&self.root).await?;
        let id = self.allocate_id().await?;
        let staging = self.root.join(format!("{STAGING_PREFIX}{id}"));
        let final_path = self.root.join(&id);

        tokio::fs::create_dir_all(&staging).await?;
        let result = self.capture_into(&staging).await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        let metadata = BackupMetadata {
            id: id.clone(),
            created_at: Utc::now(),
            session_id,
            stack_version: stack_version.map(|s| s.to_string()),
            images: images.clone(),
        };
        tokio::fs::write(
            staging.join(METADATA_FILE),
            serde_json::to_vec_pretty(&metadata)?,
        )
        .await?;

        tokio::fs::rename(&staging, &final_path).await?;
        info!(generation = %id, "Backup generation captured");

        // Keep the generation count bounded even when sessions keep failing
        // before promotion.
        self.prune_retained().await?;
        Ok(BackupGeneration {
            id,
            path: final_path,
            metadata,
        })
    }

    /// Restore a generation's datastore and config state. Returns its
    /// metadata so the caller can re-pin containers.
    pub async fn restore_generation(&self, id: &str) -> Result<BackupMetadata> {
        let generation = self
            .load_generation(&self.root.join(id))
            .await?
            .ok_or_else(|| Error::Backup(format!("generation {id} not found")))?;

        self.restore_relational(&generation.path).await?;
        self.restore_timeseries(&generation.path).await?;
        self.restore_config(&generation.path).await?;
        info!(generation = %id, "Backup generation restored");
        Ok(generation.metadata)
    }

    /// Mark a generation as the known-good baseline and prune older
    /// generations beyond the retention count.
    pub async fn promote(&self, id: &str) -> Result<()> {
        if !self.root.join(id).join(METADATA_FILE).exists() {
            return Err(Error::Backup(format!("generation {id} not found")));
        }
        // Pointer write is tmp + rename so a crash never leaves a torn file.
        let tmp = self.root.join(format!("{POINTER_FILE}.tmp"));
        tokio::fs::write(&tmp, id).await?;
        tokio::fs::rename(&tmp, self.root.join(POINTER_FILE)).await?;
        info!(generation = %id, "Generation promoted to known-good");

        self.prune_retained().await
    }

    /// Id of the current known-good generation.
    pub async fn known_good(&self) -> Option<String> {
        let raw = tokio::fs::read_to_string(self.root.join(POINTER_FILE))
            .await
            .ok()?;
        let id = raw.trim().to_string();
        (!id.is_empty()).then_some(id)
    }

    /// List generations, newest first.
    pub async fn list_generations(&self) -> Result<Vec<BackupGeneration>> {
        let mut generations = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(generations),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(STAGING_PREFIX) || name.starts_with(POINTER_FILE) {
                continue;
            }
            if let Some(generation) = self.load_generation(&entry.path()).await? {
                generations.push(generation);
            }
        }
        generations.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(generations)
    }

    /// Delete unpromoted generations older than `ttl` and any abandoned
    /// staging directories. Returns how many generations were removed.
    pub async fn purge_stale(&self, ttl: Duration) -> Result<usize> {
        let known_good = self.known_good().await;
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut purged = 0;

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(STAGING_PREFIX) {
                warn!(staging = %name, "Removing abandoned staging directory");
                let _ = tokio::fs::remove_dir_all(entry.path()).await;
                continue;
            }
            if name.starts_with(POINTER_FILE) || known_good.as_deref() == Some(name.as_str()) {
                continue;
            }
            let Some(generation) = self.load_generation(&entry.path()).await? else {
                continue;
            };
            if generation.metadata.created_at < cutoff {
                tokio::fs::remove_dir_all(&generation.path).await?;
                info!(generation = %generation.id, "Purged stale generation");
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn allocate_id(&self) -> Result<String> {
        let base = Utc::now().format("%Y%m%dT%H%M%S").to_string();
        let mut id = base.clone();
        let mut n = 1;
        while self.root.join(&id).exists() {
            n += 1;
            id = format!("{base}-{n}");
        }
        Ok(id)
    }

    async fn capture_into(&self, staging: &Path) -> Result<()> {
        self.capture_relational(staging).await?;
        self.capture_timeseries(staging).await?;
        self.capture_config(staging).await?;
        Ok(())
    }

    async fn capture_relational(&self, staging: &Path) -> Result<()> {
        let service = &self.services.relational;
        let dump = vec![
            "pg_dumpall".to_string(),
            "-U".to_string(),
            "postgres".to_string(),
            "-f".to_string(),
            PG_SCRATCH.to_string(),
        ];
        let output = self.engine.exec(service, &dump, self.exec_timeout).await?;
        if !output.success() {
            return Err(Error::Backup(format!(
                "pg_dumpall failed: {}",
                output.tail(5).join("; ")
            )));
        }
        self.engine
            .copy_from(service, PG_SCRATCH, &staging.join("postgres").join("dump.sql"))
            .await?;
        self.cleanup_scratch(service, PG_SCRATCH).await;
        Ok(())
    }

    async fn capture_timeseries(&self, staging: &Path) -> Result<()> {
        let service = &self.services.timeseries;
        let backup = vec![
            "influx".to_string(),
            "backup".to_string(),
            INFLUX_SCRATCH.to_string(),
        ];
        let output = self.engine.exec(service, &backup, self.exec_timeout).await?;
        if !output.success() {
            return Err(Error::Backup(format!(
                "influx backup failed: {}",
                output.tail(5).join("; ")
            )));
        }
        self.engine
            .copy_from(service, INFLUX_SCRATCH, &staging.join("influx"))
            .await?;
        self.cleanup_scratch(service, INFLUX_SCRATCH).await;
        Ok(())
    }

    async fn capture_config(&self, staging: &Path) -> Result<()> {
        let scratch = staging.join(".config-src");
        self.engine
            .copy_from(&self.services.backend, CONFIG_PATH, &scratch)
            .await?;
        let archive = staging.join("config.tar");
        let scratch_for_tar = scratch.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = std::fs::File::create(&archive)?;
            let mut builder = tar::Builder::new(file);
            if scratch_for_tar.is_dir() {
                builder.append_dir_all("config", &scratch_for_tar)?;
            } else {
                builder.append_path_with_name(&scratch_for_tar, "config")?;
            }
            builder.finish()
        })
        .await
        .map_err(|e| Error::Other(format!("config archive task panicked: {e}")))??;
        if scratch.is_dir() {
            tokio::fs::remove_dir_all(&scratch).await?;
        } else {
            tokio::fs::remove_file(&scratch).await?;
        }
        Ok(())
    }

    async fn restore_relational(&self, generation: &Path) -> Result<()> {
        let service = &self.services.relational;
        let dump = generation.join("postgres").join("dump.sql");
        if !dump.exists() {
            return Err(Error::Backup("generation has no relational dump".to_string()));
        }
        self.engine
            .copy_to(service, &dump, PG_RESTORE_SCRATCH)
            .await?;
        let restore = vec![
            "psql".to_string(),
            "-U".to_string(),
            "postgres".to_string(),
            "-f".to_string(),
            PG_RESTORE_SCRATCH.to_string(),
        ];
        let output = self.engine.exec(service, &restore, self.exec_timeout).await?;
        self.cleanup_scratch(service, PG_RESTORE_SCRATCH).await;
        if !output.success() {
            return Err(Error::Backup(format!(
                "psql restore failed: {}",
                output.tail(5).join("; ")
            )));
        }
        Ok(())
    }

    async fn restore_timeseries(&self, generation: &Path) -> Result<()> {
        let service = &self.services.timeseries;
        let snapshot = generation.join("influx");
        if !snapshot.exists() {
            return Err(Error::Backup(
                "generation has no time-series snapshot".to_string(),
            ));
        }
        self.engine
            .copy_to(service, &snapshot, INFLUX_RESTORE_SCRATCH)
            .await?;
        let restore = vec![
            "influx".to_string(),
            "restore".to_string(),
            "--full".to_string(),
            INFLUX_RESTORE_SCRATCH.to_string(),
        ];
        let output = self.engine.exec(service, &restore, self.exec_timeout).await?;
        self.cleanup_scratch(service, INFLUX_RESTORE_SCRATCH).await;
        if !output.success() {
            return Err(Error::Backup(format!(
                "influx restore failed: {}",
                output.tail(5).join("; ")
            )));
        }
        Ok(())
    }

    async fn restore_config(&self, generation: &Path) -> Result<()> {
        let archive = generation.join("config.tar");
        if !archive.exists() {
            return Err(Error::Backup("generation has no config archive".to_string()));
        }
        let unpack_dir = generation.join(".restore-unpack");
        if unpack_dir.exists() {
            tokio::fs::remove_dir_all(&unpack_dir).await?;
        }
        tokio::fs::create_dir_all(&unpack_dir).await?;
        let unpack_path = unpack_dir.clone();
        let archive_for_task = archive.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = std::fs::File::open(&archive_for_task)?;
            tar::Archive::new(file).unpack(&unpack_path)
        })
        .await
        .map_err(|e| Error::Other(format!("config unpack task panicked: {e}")))??;
        let result = self
            .engine
            .copy_to(&self.services.backend, &unpack_dir.join("config"), CONFIG_PATH)
            .await;
        let _ = tokio::fs::remove_dir_all(&unpack_dir).await;
        result?;
        Ok(())
    }

    async fn prune_retained(&self) -> Result<()> {
        let known_good = self.known_good().await;
        let generations = self.list_generations().await?;
        for generation in generations.iter().skip(RETAINED_GENERATIONS) {
            if known_good.as_deref() == Some(generation.id.as_str()) {
                continue;
            }
            tokio::fs::remove_dir_all(&generation.path).await?;
            info!(generation = %generation.id, "Pruned generation beyond retention");
        }
        Ok(())
    }

    async fn load_generation(&self, path: &Path) -> Result<Option<BackupGeneration>> {
        let metadata_path = path.join(METADATA_FILE);
        let raw = match tokio::fs::read(&metadata_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata: BackupMetadata = serde_json::from_slice(&raw)?;
        Ok(Some(BackupGeneration {
            id: metadata.id.clone(),
            path: path.to_path_buf(),
            metadata,
        }))
    }

    /// Scratch cleanup failures are logged, not fatal.
    async fn cleanup_scratch(&self, service: &str, path: &str) {
        let rm = vec!["rm".to_string(), "-rf".to_string(), path.to_string()];
        if let Err(e) = self.engine.exec(service, &rm, self.exec_timeout).await {
            warn!(service, path, "Scratch cleanup failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;

    fn services() -> ServiceNames {
        ServiceNames {
            frontend: "app".to_string(),
            backend: "backend".to_string(),
            relational: "postgres".to_string(),
            timeseries: "influxdb".to_string(),
        }
    }

    fn engine() -> Arc<MockEngine> {
        Arc::new(
            MockEngine::new()
                .with_service("app", "acme/app:1.4.0")
                .with_service("backend", "acme/backend:1.4.0")
                .with_service("postgres", "postgres:16")
                .with_service("influxdb", "influxdb:2"),
        )
    }

    fn manager(engine: Arc<MockEngine>, root: &Path) -> BackupManager {
        BackupManager::new(engine, root, services(), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_create_generation_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let manager = manager(Arc::clone(&engine), dir.path());

        let generation = manager
            .create_generation(None, Some("1.4.0"), &BTreeMap::new())
            .await
            .unwrap();

        assert!(generation.path.join("postgres").join("dump.sql").exists());
        assert!(generation.path.join("influx").exists());
        assert!(generation.path.join("config.tar").exists());
        assert!(generation.path.join("metadata.json").exists());
        // No staging residue.
        let staging: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
            .collect();
        assert!(staging.is_empty());
    }

    #[tokio::test]
    async fn test_failed_capture_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        engine.set_exec_output(2, &["pg_dumpall: connection refused"]);
        let manager = manager(Arc::clone(&engine), dir.path());

        let err = manager
            .create_generation(None, None, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backup(_)));
        assert!(manager.list_generations().await.unwrap().is_empty());
        let staging: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
            .collect();
        assert!(staging.is_empty());
    }

    #[tokio::test]
    async fn test_promote_prunes_beyond_retention() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let manager = manager(Arc::clone(&engine), dir.path());

        let mut ids = Vec::new();
        for _ in 0..3 {
            let generation = manager
                .create_generation(None, None, &BTreeMap::new())
                .await
                .unwrap();
            ids.push(generation.id);
        }
        manager.promote(ids.last().unwrap()).await.unwrap();

        let remaining = manager.list_generations().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(&remaining[0].id, ids.last().unwrap());
        assert_eq!(
            manager.known_good().await.as_deref(),
            Some(ids.last().unwrap().as_str())
        );
    }

    #[tokio::test]
    async fn test_capture_prunes_surplus_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let manager = manager(Arc::clone(&engine), dir.path());

        // Repeated captures without promotion (failed updates) must not
        // accumulate generations beyond the retention count.
        let mut last = String::new();
        for _ in 0..4 {
            let generation = manager
                .create_generation(None, None, &BTreeMap::new())
                .await
                .unwrap();
            last = generation.id;
        }
        let remaining = manager.list_generations().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].id, last);
    }

    #[tokio::test]
    async fn test_capture_pruning_spares_known_good() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let manager = manager(Arc::clone(&engine), dir.path());

        let promoted = manager
            .create_generation(None, None, &BTreeMap::new())
            .await
            .unwrap();
        manager.promote(&promoted.id).await.unwrap();
        for _ in 0..3 {
            manager
                .create_generation(None, None, &BTreeMap::new())
                .await
                .unwrap();
        }
        let remaining = manager.list_generations().await.unwrap();
        assert!(remaining.iter().any(|g| g.id == promoted.id));
        assert_eq!(remaining.len(), 3);
    }

    #[tokio::test]
    async fn test_purge_stale_spares_known_good() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let manager = manager(Arc::clone(&engine), dir.path());

        let old = manager
            .create_generation(None, None, &BTreeMap::new())
            .await
            .unwrap();
        let promoted = manager
            .create_generation(None, None, &BTreeMap::new())
            .await
            .unwrap();
        manager.promote(&promoted.id).await.unwrap();

        let purged = manager.purge_stale(Duration::ZERO).await.unwrap();
        assert_eq!(purged, 1);
        let remaining = manager.list_generations().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, promoted.id);
        let _ = old;
    }

    #[tokio::test]
    async fn test_restore_round_trips_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let manager = manager(Arc::clone(&engine), dir.path());

        let mut images = BTreeMap::new();
        images.insert(
            "backend".to_string(),
            ImageRef::parse("acme/backend@sha256:old"),
        );
        let generation = manager
            .create_generation(None, Some("1.4.0"), &images)
            .await
            .unwrap();

        let metadata = manager.restore_generation(&generation.id).await.unwrap();
        assert_eq!(metadata.stack_version.as_deref(), Some("1.4.0"));
        assert_eq!(
            metadata.images["backend"].digest.as_deref(),
            Some("sha256:old")
        );
        // Restore pushed data back into the datastore containers.
        let copied = engine.copied_to();
        assert!(copied.iter().any(|(s, _)| s == "postgres"));
        assert!(copied.iter().any(|(s, _)| s == "influxdb"));
    }
}
