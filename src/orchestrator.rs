// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The update orchestrator: drives one session through the state machine.
//!
//! ```text
//! preflight -> backup -> pull -> migrate -> recreate -> healthcheck -> completed
//!     |           |        |        |           |            |
//!     v           v        v        v           +------------+
//!   failed      failed   failed   failed                |
//!                                                    rollback -> failed (rolled_back)
//! ```
//!
//! Failures in preflight, backup, pull and migrate end the session without
//! touching the running containers. Once a container has been recreated the
//! system has been mutated, so recreate and healthcheck failures trigger
//! rollback: stop the updated services, restore the backup generation,
//! re-pin containers to their pre-update digests and wait for health again.
//!
//! Cancellation is checked between phases and honored only before migrate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sysinfo::Disks;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backup::{BackupGeneration, BackupManager};
use crate::config::Config;
use crate::engine::{ContainerEngine, HealthStatus, ImageRef};
use crate::error::{Error, Result};
use crate::migrate::{MigrationRunner, MigrationStatus};
use crate::session::{FailureReason, SessionOutcome, SessionStore, UpdateState};
use crate::version::{ResolvedTarget, VersionResolver};

struct Inner {
    engine: Arc<dyn ContainerEngine>,
    backups: Arc<BackupManager>,
    resolver: Arc<VersionResolver>,
    migrations: Arc<MigrationRunner>,
    store: Arc<SessionStore>,
    config: Config,
    http: reqwest::Client,
}

/// Drives update sessions. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// How a phase failure should be handled.
enum PhaseFailure {
    /// Nothing was mutated; end the session.
    Abort(FailureReason, String),
    /// The stack was mutated; roll back.
    Rollback(FailureReason, String),
}

impl Orchestrator {
    /// Wire up an orchestrator.
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        backups: Arc<BackupManager>,
        resolver: Arc<VersionResolver>,
        migrations: Arc<MigrationRunner>,
        store: Arc<SessionStore>,
        config: Config,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                backups,
                resolver,
                migrations,
                store,
                config,
                http: reqwest::Client::new(),
            }),
        }
    }

    /// Session store, for status and stream handlers.
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.store
    }

    /// Version resolver, for the version handler.
    pub fn resolver(&self) -> &Arc<VersionResolver> {
        &self.inner.resolver
    }

    /// Configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Accept an update request: resolve the target, claim the single-flight
    /// slot and spawn the session driver. Returns the session id with the
    /// session already in preflight.
    ///
    /// Without `force`, a target whose digests all match the running
    /// containers is rejected as already applied.
    pub async fn start(
        &self,
        requested: Option<&str>,
        channel: Option<&str>,
        force: bool,
    ) -> Result<Uuid> {
        if let Some(active_id) = self.inner.store.active() {
            return Err(Error::Conflict { active_id });
        }

        let target = self.inner.resolver.resolve_target(requested, channel).await?;
        if !force && self.already_applied(&target).await {
            return Err(Error::InvalidTarget(format!(
                "version {} is already running; pass force to re-apply",
                target.version
            )));
        }

        let id = self
            .inner
            .store
            .try_begin(&target.version, &target.channel)?;
        self.inner
            .store
            .set_images(id, None, Some(target.images.clone()));
        self.inner
            .store
            .transition(id, UpdateState::Preflight, "Checking preconditions")
            .await;
        info!(session = %id, version = %target.version, channel = %target.channel, "Update session accepted");

        let driver = self.clone();
        tokio::spawn(async move {
            driver.run_update(id, target).await;
        });
        Ok(id)
    }

    /// Whether every target image with a published digest already matches
    /// the running container. Digest-less targets never count as applied.
    async fn already_applied(&self, target: &ResolvedTarget) -> bool {
        let mut any_pinned = false;
        for (service, image) in &target.images {
            let Some(digest) = &image.digest else {
                return false;
            };
            any_pinned = true;
            match self.inner.engine.inspect(service).await {
                Ok(Some(state)) if state.image.digest.as_ref() == Some(digest) => {}
                _ => return false,
            }
        }
        any_pinned
    }

    /// Request cancellation of a session.
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        self.inner.store.request_cancel(id)?;
        info!(session = %id, "Cancellation requested");
        Ok(())
    }

    async fn run_update(&self, id: Uuid, target: ResolvedTarget) {
        let store = &self.inner.store;
        let cancel = store
            .cancel_flag(id)
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));

        // Preflight. The session entered this state in `start`; nothing has
        // been touched yet, so failures just end the session.
        if let Err(detail) = self.preflight(id, &target).await {
            self.abort(id, FailureReason::PreflightFailed, detail).await;
            return;
        }
        if self.check_cancelled(id, &cancel).await {
            return;
        }

        // Pre-update image pins, for rollback and for the backup metadata.
        let previous_images = self.current_images().await;
        store.set_images(id, Some(previous_images.clone()), None);

        // Backup.
        store
            .transition(id, UpdateState::Backup, "Capturing backup generation")
            .await;
        let generation = match self
            .inner
            .backups
            .create_generation(Some(id), None, &previous_images)
            .await
        {
            Ok(generation) => generation,
            Err(e) => {
                self.abort(id, FailureReason::BackupFailed, e.to_string())
                    .await;
                return;
            }
        };
        store
            .log(id, "info", &format!("Backup generation {} captured", generation.id))
            .await;
        if self.check_cancelled(id, &cancel).await {
            return;
        }

        // Pull. Digest-pinned references make the transfer self-verifying.
        store
            .transition(id, UpdateState::Pull, "Pulling target images")
            .await;
        for (service, image) in &target.images {
            store
                .log(id, "info", &format!("Pulling {service}: {image}"))
                .await;
            if let Err(e) = self.inner.engine.pull(image).await {
                self.abort(id, FailureReason::PullFailed, e.to_string()).await;
                return;
            }
        }
        if self.check_cancelled(id, &cancel).await {
            return;
        }

        if let Err(failure) = self.apply(id, &target).await {
            match failure {
                PhaseFailure::Abort(reason, detail) => self.abort(id, reason, detail).await,
                PhaseFailure::Rollback(reason, detail) => {
                    self.rollback(id, &generation, &previous_images, reason, detail)
                        .await
                }
            }
            return;
        }

        // Success: promote the generation, drop the cached manifest so the
        // next availability check sees the new baseline.
        if let Err(e) = self.inner.backups.promote(&generation.id).await {
            warn!(session = %id, "Promotion failed after successful update: {e}");
            store
                .log(id, "warning", &format!("Generation promotion failed: {e}"))
                .await;
        }
        self.inner.resolver.invalidate_cache();
        store
            .finish(
                id,
                SessionOutcome::Succeeded,
                None,
                Some(format!("Updated to {}", target.version)),
            )
            .await;
        info!(session = %id, version = %target.version, "Update completed");
    }

    /// Migrate, recreate and healthcheck. Recreate is the point of no
    /// return: failures before the first container replacement abort,
    /// failures after it roll back.
    async fn apply(&self, id: Uuid, target: &ResolvedTarget) -> std::result::Result<(), PhaseFailure> {
        let store = &self.inner.store;
        let services = &self.inner.config.services;

        // Migrate.
        store
            .transition(id, UpdateState::Migrate, "Running schema migrations")
            .await;
        let backend_image = target.images.get(&services.backend).ok_or_else(|| {
            PhaseFailure::Abort(
                FailureReason::PreflightFailed,
                format!("manifest has no image for service {}", services.backend),
            )
        })?;
        // A migration failure ends the session without touching the running
        // containers; the captured generation stays on disk for manual
        // recovery of any partial schema change.
        let outcome = self
            .inner
            .migrations
            .run(backend_image)
            .await
            .map_err(|e| PhaseFailure::Abort(FailureReason::MigrationFailed, e.to_string()))?;
        for line in &outcome.log {
            store.log(id, "info", line).await;
        }
        match outcome.status {
            MigrationStatus::Applied => {}
            MigrationStatus::Failed { exit_code } => {
                return Err(PhaseFailure::Abort(
                    FailureReason::MigrationFailed,
                    format!("migration exited with code {exit_code}"),
                ));
            }
            MigrationStatus::TimedOut => {
                return Err(PhaseFailure::Abort(
                    FailureReason::MigrationTimeout,
                    "migration exceeded its deadline".to_string(),
                ));
            }
        }

        // Recreate, backend before frontend.
        store
            .transition(id, UpdateState::Recreate, "Recreating service containers")
            .await;
        for service in services.updatable() {
            let Some(image) = target.images.get(&service) else {
                store
                    .log(id, "warning", &format!("No target image for {service}, leaving as-is"))
                    .await;
                continue;
            };
            store
                .log(id, "info", &format!("Recreating {service} with {image}"))
                .await;
            self.inner
                .engine
                .recreate(&service, image)
                .await
                .map_err(|e| {
                    PhaseFailure::Rollback(FailureReason::RecreateFailed, e.to_string())
                })?;
        }

        // Healthcheck.
        store
            .transition(id, UpdateState::Healthcheck, "Waiting for services to report healthy")
            .await;
        self.wait_for_health(id)
            .await
            .map_err(|detail| PhaseFailure::Rollback(FailureReason::HealthcheckFailed, detail))?;
        Ok(())
    }

    /// Precondition checks. Returns a failure detail on the first unmet one.
    async fn preflight(&self, id: Uuid, target: &ResolvedTarget) -> std::result::Result<(), String> {
        let store = &self.inner.store;
        let config = &self.inner.config;

        if config.require_signatures {
            return Err(
                "image signature verification is required but no verifier is configured"
                    .to_string(),
            );
        }

        self.inner
            .engine
            .ping()
            .await
            .map_err(|e| format!("container engine unreachable: {e}"))?;
        store.log(id, "info", "Container engine reachable").await;

        if let Some(registry_url) = &config.registry_url {
            // Any HTTP response counts as reachable; 401 just means auth.
            self.inner
                .http
                .get(format!("{}/v2/", registry_url.trim_end_matches('/')))
                .timeout(std::time::Duration::from_secs(10))
                .send()
                .await
                .map_err(|e| format!("registry unreachable: {e}"))?;
            store.log(id, "info", "Registry reachable").await;
        }

        if config.min_free_disk_bytes > 0 {
            let free = free_space_for(&config.backups_dir);
            if let Some(free) = free
                && free < config.min_free_disk_bytes
            {
                return Err(format!(
                    "insufficient disk space: {free} bytes free, {} required",
                    config.min_free_disk_bytes
                ));
            }
        }

        store
            .log(
                id,
                "info",
                &format!(
                    "Preflight passed for target {} ({} services)",
                    target.version,
                    target.images.len()
                ),
            )
            .await;
        Ok(())
    }

    /// Restore the pre-update state after a late failure.
    async fn rollback(
        &self,
        id: Uuid,
        generation: &BackupGeneration,
        previous_images: &BTreeMap<String, ImageRef>,
        reason: FailureReason,
        detail: String,
    ) {
        let store = &self.inner.store;
        error!(session = %id, %reason, "Update failed after mutation, rolling back: {detail}");
        store
            .transition(id, UpdateState::Rollback, &format!("Rolling back: {detail}"))
            .await;

        if let Err(e) = self.try_rollback(id, generation, previous_images).await {
            error!(session = %id, "Rollback failed: {e}");
            store
                .finish(
                    id,
                    SessionOutcome::RollbackFailed,
                    Some(FailureReason::RollbackFailed),
                    Some(format!("{detail}; rollback failed: {e}")),
                )
                .await;
            return;
        }

        info!(session = %id, "Rollback completed");
        store
            .finish(id, SessionOutcome::RolledBack, Some(reason), Some(detail))
            .await;
    }

    async fn try_rollback(
        &self,
        id: Uuid,
        generation: &BackupGeneration,
        previous_images: &BTreeMap<String, ImageRef>,
    ) -> Result<()> {
        let store = &self.inner.store;
        let services = &self.inner.config.services;

        for service in services.updatable() {
            self.inner.engine.stop(&service).await?;
        }
        store.log(id, "info", "Updated services stopped").await;

        let metadata = self.inner.backups.restore_generation(&generation.id).await?;
        store
            .log(id, "info", &format!("Generation {} restored", generation.id))
            .await;

        // Pin to the digests recorded at capture time; fall back to what we
        // observed just before the update.
        for service in services.updatable() {
            let image = metadata
                .images
                .get(&service)
                .or_else(|| previous_images.get(&service))
                .ok_or_else(|| {
                    Error::Other(format!("no pre-update image recorded for {service}"))
                })?;
            store
                .log(id, "info", &format!("Re-pinning {service} to {image}"))
                .await;
            self.inner.engine.recreate(&service, image).await?;
        }

        self.wait_for_health(id)
            .await
            .map_err(Error::Other)?;
        Ok(())
    }

    /// Poll the gating services until all are healthy or the deadline
    /// passes. A running container without a healthcheck counts as healthy.
    async fn wait_for_health(&self, id: Uuid) -> std::result::Result<(), String> {
        let config = &self.inner.config;
        let deadline = tokio::time::Instant::now() + config.health_timeout;

        loop {
            let mut pending = Vec::new();
            for service in &config.health_services {
                match self.inner.engine.inspect(service).await {
                    Ok(Some(state))
                        if state.running
                            && matches!(
                                state.health,
                                HealthStatus::Healthy | HealthStatus::None
                            ) => {}
                    Ok(Some(state)) => {
                        pending.push(format!("{service} ({})", health_label(&state)));
                    }
                    Ok(None) => pending.push(format!("{service} (missing)")),
                    Err(e) => pending.push(format!("{service} (inspect failed: {e})")),
                }
            }
            if pending.is_empty() {
                self.inner
                    .store
                    .log(id, "info", "All gated services healthy")
                    .await;
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!(
                    "services not healthy within {:?}: {}",
                    config.health_timeout,
                    pending.join(", ")
                ));
            }
            tokio::time::sleep(config.health_poll_interval).await;
        }
    }

    async fn current_images(&self) -> BTreeMap<String, ImageRef> {
        let mut images = BTreeMap::new();
        for service in self.inner.config.services.updatable() {
            match self.inner.engine.inspect(&service).await {
                Ok(Some(state)) => {
                    images.insert(service, state.image);
                }
                Ok(None) => warn!(service, "No container to record pre-update image for"),
                Err(e) => warn!(service, "Pre-update inspect failed: {e}"),
            }
        }
        images
    }

    /// End the session without rollback. Used before anything was mutated.
    async fn abort(&self, id: Uuid, reason: FailureReason, detail: String) {
        error!(session = %id, %reason, "Update failed: {detail}");
        self.inner
            .store
            .finish(id, SessionOutcome::Failed, Some(reason), Some(detail))
            .await;
    }

    /// Honor a pending cancellation. Returns true when the session ended.
    async fn check_cancelled(&self, id: Uuid, cancel: &AtomicBool) -> bool {
        if !cancel.load(Ordering::SeqCst) {
            return false;
        }
        info!(session = %id, "Session cancelled");
        self.inner
            .store
            .finish(
                id,
                SessionOutcome::Failed,
                Some(FailureReason::Cancelled),
                Some("cancelled by operator".to_string()),
            )
            .await;
        true
    }
}

fn health_label(state: &crate::engine::ServiceState) -> String {
    if !state.running {
        return "stopped".to_string();
    }
    match state.health {
        HealthStatus::Healthy => "healthy".to_string(),
        HealthStatus::Unhealthy => "unhealthy".to_string(),
        HealthStatus::Starting => "starting".to_string(),
        HealthStatus::None => "no healthcheck".to_string(),
        HealthStatus::Unknown => "unknown".to_string(),
    }
}

/// Free bytes on the filesystem holding `path`, by longest mount-point
/// match. `None` when the disk list gives no answer.
fn free_space_for(path: &std::path::Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
