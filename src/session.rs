// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Update sessions and the single-flight session store.
//!
//! An [`UpdateSession`] is the durable record of one update attempt: its
//! state-machine position, progress, log tail and terminal outcome. The
//! [`SessionStore`] owns all sessions, enforces the one-active-session
//! invariant and fans events out to SSE subscribers over per-session
//! broadcast channels.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Broadcast channel capacity per session. Slow SSE consumers that lag
/// behind this many events miss the oldest ones.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Number of log lines retained in the in-memory tail.
const LOG_TAIL_LINES: usize = 100;

/// Position of an update session in the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateState {
    /// No phase entered yet.
    Idle,
    /// Checking preconditions.
    Preflight,
    /// Capturing the backup generation.
    Backup,
    /// Pulling target images.
    Pull,
    /// Running schema migrations.
    Migrate,
    /// Recreating service containers.
    Recreate,
    /// Waiting for services to report healthy.
    Healthcheck,
    /// Restoring the pre-update state after a late failure.
    Rollback,
    /// Update finished successfully.
    Completed,
    /// Update ended in failure (including rolled-back endings).
    Failed,
}

impl UpdateState {
    /// Whether the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateState::Completed | UpdateState::Failed)
    }

    /// Whether cancellation is still honored in this state. Once
    /// migrations start the system is past the point of no return.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            UpdateState::Idle | UpdateState::Preflight | UpdateState::Backup | UpdateState::Pull
        )
    }

    /// Progress milestone reached when this phase begins.
    pub fn milestone(&self) -> Option<u8> {
        match self {
            UpdateState::Idle => Some(0),
            UpdateState::Preflight => Some(5),
            UpdateState::Backup => Some(15),
            UpdateState::Pull => Some(40),
            UpdateState::Migrate => Some(60),
            UpdateState::Recreate => Some(85),
            UpdateState::Healthcheck => Some(90),
            UpdateState::Completed => Some(100),
            UpdateState::Rollback | UpdateState::Failed => None,
        }
    }
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdateState::Idle => "idle",
            UpdateState::Preflight => "preflight",
            UpdateState::Backup => "backup",
            UpdateState::Pull => "pull",
            UpdateState::Migrate => "migrate",
            UpdateState::Recreate => "recreate",
            UpdateState::Healthcheck => "healthcheck",
            UpdateState::Rollback => "rollback",
            UpdateState::Completed => "completed",
            UpdateState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Machine-readable failure codes attached to failed sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// A precondition check failed.
    PreflightFailed,
    /// The backup generation could not be captured.
    BackupFailed,
    /// A target image could not be pulled.
    PullFailed,
    /// A pulled image did not match its published digest.
    DigestMismatch,
    /// The schema migration exited non-zero.
    MigrationFailed,
    /// The schema migration exceeded its deadline.
    MigrationTimeout,
    /// A container could not be recreated.
    RecreateFailed,
    /// Services did not report healthy within the deadline.
    HealthcheckFailed,
    /// Rollback itself failed; manual intervention required.
    RollbackFailed,
    /// The operator cancelled the session.
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::PreflightFailed => "preflight_failed",
            FailureReason::BackupFailed => "backup_failed",
            FailureReason::PullFailed => "pull_failed",
            FailureReason::DigestMismatch => "digest_mismatch",
            FailureReason::MigrationFailed => "migration_failed",
            FailureReason::MigrationTimeout => "migration_timeout",
            FailureReason::RecreateFailed => "recreate_failed",
            FailureReason::HealthcheckFailed => "healthcheck_failed",
            FailureReason::RollbackFailed => "rollback_failed",
            FailureReason::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Terminal result of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Update applied and healthy.
    Succeeded,
    /// Update failed before any container was replaced.
    Failed,
    /// Update failed after replacement and the previous state was restored.
    RolledBack,
    /// Update failed and rollback also failed.
    RollbackFailed,
}

/// Record of one update attempt.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateSession {
    /// Session id.
    #[serde(rename = "update_id")]
    pub id: Uuid,
    /// Resolved target version.
    pub target_version: String,
    /// Release channel the target came from.
    pub channel: String,
    /// Current state-machine position.
    pub state: UpdateState,
    /// Monotone progress percentage.
    pub progress: u8,
    /// When the session was accepted.
    pub started_at: DateTime<Utc>,
    /// When the session reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure code, for failed sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    /// Human-readable failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Terminal outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SessionOutcome>,
    /// Per-service images running before the update, recorded in preflight.
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub previous_images: std::collections::BTreeMap<String, crate::engine::ImageRef>,
    /// Per-service target images the session applies.
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub target_images: std::collections::BTreeMap<String, crate::engine::ImageRef>,
    /// Recent log lines.
    pub log_tail: Vec<String>,
    /// On-disk session log file.
    pub log_path: PathBuf,
}

/// Event kinds emitted over a session's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A new phase was entered.
    Phase,
    /// Progress advanced within a phase.
    Progress,
    /// A log line was emitted.
    Log,
    /// The session succeeded.
    Completed,
    /// The session failed.
    Failed,
}

/// One event on a session's stream.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateEvent {
    /// Event kind.
    pub event: EventKind,
    /// State at emission time.
    pub state: UpdateState,
    /// Progress at emission time.
    pub progress: u8,
    /// Message payload.
    pub message: String,
    /// Emission timestamp.
    pub ts: DateTime<Utc>,
}

impl UpdateEvent {
    /// Whether this event closes the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.event, EventKind::Completed | EventKind::Failed)
    }
}

struct SessionEntry {
    session: UpdateSession,
    events: tokio::sync::broadcast::Sender<UpdateEvent>,
    cancel: Arc<AtomicBool>,
    log_tail: VecDeque<String>,
}

#[derive(Default)]
struct Store {
    active: Option<Uuid>,
    sessions: HashMap<Uuid, SessionEntry>,
    order: VecDeque<Uuid>,
}

/// Owner of all update sessions.
///
/// Enforces single-flight: `try_begin` fails with [`Error::Conflict`] while
/// a non-terminal session exists.
pub struct SessionStore {
    inner: Mutex<Store>,
    log_dir: PathBuf,
    history_limit: usize,
}

impl SessionStore {
    /// Create a store writing session logs under `log_dir`.
    pub fn new(log_dir: impl Into<PathBuf>, history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Store::default()),
            log_dir: log_dir.into(),
            history_limit: history_limit.max(1),
        }
    }

    /// Begin a new session, or fail with `Conflict` if one is in flight.
    pub fn try_begin(&self, target_version: &str, channel: &str) -> Result<Uuid> {
        let mut store = self.inner.lock().unwrap();
        if let Some(active_id) = store.active
            && let Some(entry) = store.sessions.get(&active_id)
            && !entry.session.state.is_terminal()
        {
            return Err(Error::Conflict { active_id });
        }

        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let log_path = self
            .log_dir
            .join(format!("updater_{}.log", started_at.format("%Y%m%dT%H%M%S")));
        let (events, _) = tokio::sync::broadcast::channel(EVENT_CHANNEL_CAPACITY);

        store.sessions.insert(
            id,
            SessionEntry {
                session: UpdateSession {
                    id,
                    target_version: target_version.to_string(),
                    channel: channel.to_string(),
                    state: UpdateState::Idle,
                    progress: 0,
                    started_at,
                    finished_at: None,
                    reason: None,
                    detail: None,
                    outcome: None,
                    previous_images: std::collections::BTreeMap::new(),
                    target_images: std::collections::BTreeMap::new(),
                    log_tail: Vec::new(),
                    log_path,
                },
                events,
                cancel: Arc::new(AtomicBool::new(false)),
                log_tail: VecDeque::new(),
            },
        );
        store.order.push_back(id);
        store.active = Some(id);
        self.evict_locked(&mut store);
        Ok(id)
    }

    /// Move a session into a new phase, raising its progress to the phase
    /// milestone. Progress never decreases.
    pub async fn transition(&self, id: Uuid, state: UpdateState, message: &str) {
        let (event, log_path) = {
            let mut store = self.inner.lock().unwrap();
            let Some(entry) = store.sessions.get_mut(&id) else {
                return;
            };
            entry.session.state = state;
            if let Some(milestone) = state.milestone() {
                entry.session.progress = entry.session.progress.max(milestone);
            }
            let event = UpdateEvent {
                event: EventKind::Phase,
                state,
                progress: entry.session.progress,
                message: message.to_string(),
                ts: Utc::now(),
            };
            let _ = entry.events.send(event.clone());
            (event, entry.session.log_path.clone())
        };
        self.append_log_file(&log_path, &event, "info").await;
    }

    /// Append a log line to a session: in-memory tail, event stream and the
    /// on-disk log file.
    pub async fn log(&self, id: Uuid, severity: &str, message: &str) {
        let appended = {
            let mut store = self.inner.lock().unwrap();
            let Some(entry) = store.sessions.get_mut(&id) else {
                return;
            };
            entry.log_tail.push_back(message.to_string());
            while entry.log_tail.len() > LOG_TAIL_LINES {
                entry.log_tail.pop_front();
            }
            entry.session.log_tail = entry.log_tail.iter().cloned().collect();
            let event = UpdateEvent {
                event: EventKind::Log,
                state: entry.session.state,
                progress: entry.session.progress,
                message: message.to_string(),
                ts: Utc::now(),
            };
            let _ = entry.events.send(event.clone());
            Some((event, entry.session.log_path.clone()))
        };
        if let Some((event, log_path)) = appended {
            self.append_log_file(&log_path, &event, severity).await;
        }
    }

    /// Advance progress within the current phase.
    pub async fn progress(&self, id: Uuid, progress: u8, message: &str) {
        let appended = {
            let mut store = self.inner.lock().unwrap();
            let Some(entry) = store.sessions.get_mut(&id) else {
                return;
            };
            entry.session.progress = entry.session.progress.max(progress);
            let event = UpdateEvent {
                event: EventKind::Progress,
                state: entry.session.state,
                progress: entry.session.progress,
                message: message.to_string(),
                ts: Utc::now(),
            };
            let _ = entry.events.send(event.clone());
            Some((event, entry.session.log_path.clone()))
        };
        if let Some((event, log_path)) = appended {
            self.append_log_file(&log_path, &event, "info").await;
        }
    }

    /// Drive a session to a terminal state.
    pub async fn finish(
        &self,
        id: Uuid,
        outcome: SessionOutcome,
        reason: Option<FailureReason>,
        detail: Option<String>,
    ) {
        let appended = {
            let mut store = self.inner.lock().unwrap();
            let Some(entry) = store.sessions.get_mut(&id) else {
                return;
            };
            let (state, kind) = match outcome {
                SessionOutcome::Succeeded => (UpdateState::Completed, EventKind::Completed),
                _ => (UpdateState::Failed, EventKind::Failed),
            };
            entry.session.state = state;
            if state == UpdateState::Completed {
                entry.session.progress = 100;
            }
            entry.session.finished_at = Some(Utc::now());
            entry.session.reason = reason;
            entry.session.detail = detail.clone();
            entry.session.outcome = Some(outcome);
            let event = UpdateEvent {
                event: kind,
                state,
                progress: entry.session.progress,
                message: detail
                    .or_else(|| reason.map(|r| r.to_string()))
                    .unwrap_or_else(|| "update completed".to_string()),
                ts: Utc::now(),
            };
            let _ = entry.events.send(event.clone());
            if store.active == Some(id) {
                store.active = None;
            }
            Some((event, store.sessions[&id].session.log_path.clone()))
        };
        if let Some((event, log_path)) = appended {
            let severity = if event.event == EventKind::Failed {
                "error"
            } else {
                "info"
            };
            self.append_log_file(&log_path, &event, severity).await;
        }
    }

    /// Record the image snapshots a session moves between.
    pub fn set_images(
        &self,
        id: Uuid,
        previous: Option<std::collections::BTreeMap<String, crate::engine::ImageRef>>,
        target: Option<std::collections::BTreeMap<String, crate::engine::ImageRef>>,
    ) {
        let mut store = self.inner.lock().unwrap();
        if let Some(entry) = store.sessions.get_mut(&id) {
            if let Some(previous) = previous {
                entry.session.previous_images = previous;
            }
            if let Some(target) = target {
                entry.session.target_images = target;
            }
        }
    }

    /// Request cancellation of a session. Honored only while the session is
    /// still in a cancellable phase.
    pub fn request_cancel(&self, id: Uuid) -> Result<()> {
        let store = self.inner.lock().unwrap();
        let entry = store
            .sessions
            .get(&id)
            .ok_or(Error::UnknownSession(id))?;
        if !entry.session.state.is_cancellable() {
            return Err(Error::TooLate {
                state: entry.session.state,
            });
        }
        entry.cancel.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Cancellation flag for a session, checked by the orchestrator between
    /// phases.
    pub fn cancel_flag(&self, id: Uuid) -> Option<Arc<AtomicBool>> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(&id)
            .map(|e| Arc::clone(&e.cancel))
    }

    /// Snapshot a session by id.
    pub fn snapshot(&self, id: Uuid) -> Option<UpdateSession> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(&id)
            .map(|e| e.session.clone())
    }

    /// Id of the in-flight session, if any.
    pub fn active(&self) -> Option<Uuid> {
        let store = self.inner.lock().unwrap();
        store.active.filter(|id| {
            store
                .sessions
                .get(id)
                .is_some_and(|e| !e.session.state.is_terminal())
        })
    }

    /// Snapshot of the most recently started session.
    pub fn latest(&self) -> Option<UpdateSession> {
        let store = self.inner.lock().unwrap();
        store
            .order
            .back()
            .and_then(|id| store.sessions.get(id))
            .map(|e| e.session.clone())
    }

    /// Subscribe to a session's event stream.
    pub fn subscribe(&self, id: Uuid) -> Option<tokio::sync::broadcast::Receiver<UpdateEvent>> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(&id)
            .map(|e| e.events.subscribe())
    }

    /// Evict terminal sessions older than `max_age`. Returns how many were
    /// removed.
    pub fn evict_older_than(&self, max_age: chrono::Duration) -> usize {
        let mut store = self.inner.lock().unwrap();
        let cutoff = Utc::now() - max_age;
        let stale: Vec<Uuid> = store
            .sessions
            .iter()
            .filter(|(_, e)| {
                e.session.state.is_terminal()
                    && e.session.finished_at.is_some_and(|t| t < cutoff)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            store.sessions.remove(id);
            store.order.retain(|o| o != id);
        }
        stale.len()
    }

    fn evict_locked(&self, store: &mut Store) {
        while store.order.len() > self.history_limit {
            let Some(candidate) = store
                .order
                .iter()
                .position(|id| {
                    store
                        .sessions
                        .get(id)
                        .is_some_and(|e| e.session.state.is_terminal())
                })
            else {
                break;
            };
            let id = store.order.remove(candidate).unwrap();
            store.sessions.remove(&id);
        }
    }

    async fn append_log_file(&self, path: &Path, event: &UpdateEvent, severity: &str) {
        let line = serde_json::json!({
            "ts": event.ts.to_rfc3339(),
            "state": event.state,
            "severity": severity,
            "message": event.message,
        });
        let result = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(format!("{line}\n").as_bytes()).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;
        if let Err(e) = result {
            warn!(path = %path.display(), "Failed to append session log: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        let dir = tempfile::tempdir().unwrap();
        SessionStore::new(dir.path().join("logs"), 16)
    }

    #[tokio::test]
    async fn test_single_flight() {
        let store = store();
        let first = store.try_begin("1.5.0", "stable").unwrap();
        let err = store.try_begin("1.5.0", "stable").unwrap_err();
        assert!(matches!(err, Error::Conflict { active_id } if active_id == first));

        store
            .finish(first, SessionOutcome::Succeeded, None, None)
            .await;
        store.try_begin("1.6.0", "stable").unwrap();
    }

    #[tokio::test]
    async fn test_progress_is_monotone() {
        let store = store();
        let id = store.try_begin("1.5.0", "stable").unwrap();
        store.transition(id, UpdateState::Pull, "pulling").await;
        assert_eq!(store.snapshot(id).unwrap().progress, 40);
        // A stale lower report must not move progress backwards.
        store.progress(id, 20, "late report").await;
        assert_eq!(store.snapshot(id).unwrap().progress, 40);
    }

    #[tokio::test]
    async fn test_cancel_window_closes_at_migrate() {
        let store = store();
        let id = store.try_begin("1.5.0", "stable").unwrap();
        store.transition(id, UpdateState::Pull, "pulling").await;
        store.request_cancel(id).unwrap();

        let id2 = {
            store
                .finish(id, SessionOutcome::Failed, Some(FailureReason::Cancelled), None)
                .await;
            store.try_begin("1.5.0", "stable").unwrap()
        };
        store.transition(id2, UpdateState::Migrate, "migrating").await;
        let err = store.request_cancel(id2).unwrap_err();
        assert!(matches!(err, Error::TooLate { state: UpdateState::Migrate }));
    }

    #[tokio::test]
    async fn test_log_tail_is_bounded() {
        let store = store();
        let id = store.try_begin("1.5.0", "stable").unwrap();
        for i in 0..150 {
            store.log(id, "info", &format!("line {i}")).await;
        }
        let tail = store.snapshot(id).unwrap().log_tail;
        assert_eq!(tail.len(), 100);
        assert_eq!(tail.first().unwrap(), "line 50");
        assert_eq!(tail.last().unwrap(), "line 149");
    }

    #[tokio::test]
    async fn test_history_eviction_keeps_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), 2);
        let mut ids = Vec::new();
        for _ in 0..4 {
            let id = store.try_begin("1.5.0", "stable").unwrap();
            store
                .finish(id, SessionOutcome::Succeeded, None, None)
                .await;
            ids.push(id);
        }
        assert!(store.snapshot(ids[0]).is_none());
        assert!(store.snapshot(ids[3]).is_some());
    }

    #[tokio::test]
    async fn test_terminal_event_closes_stream() {
        let store = store();
        let id = store.try_begin("1.5.0", "stable").unwrap();
        let mut rx = store.subscribe(id).unwrap();
        store
            .finish(
                id,
                SessionOutcome::RolledBack,
                Some(FailureReason::HealthcheckFailed),
                Some("backend never became healthy".to_string()),
            )
            .await;
        let event = rx.recv().await.unwrap();
        assert!(event.is_terminal());
        assert_eq!(event.event, EventKind::Failed);
    }

    #[tokio::test]
    async fn test_session_log_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), 16);
        let id = store.try_begin("1.5.0", "stable").unwrap();
        store.log(id, "info", "hello").await;
        let path = store.snapshot(id).unwrap().log_path;
        let content = std::fs::read_to_string(path).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["message"], "hello");
        assert_eq!(parsed["severity"], "info");
    }
}
