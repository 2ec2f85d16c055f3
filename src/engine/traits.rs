// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container engine trait definitions.
//!
//! Defines the narrow capability interface the orchestrator uses to talk to
//! the container runtime: pull, stop, recreate, inspect, exec, copy, logs.
//! All operations are idempotent with respect to already-satisfied state.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from engine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Docker CLI binary was not found.
    #[error("Container CLI not found: {0}")]
    CliNotFound(String),

    /// Container or service was not found.
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Image pull failed.
    #[error("Pull failed for {reference}: {detail}")]
    PullFailed {
        /// Image reference that failed to pull.
        reference: String,
        /// CLI output describing the failure.
        detail: String,
    },

    /// Operation timed out.
    #[error("Engine operation timed out: {0}")]
    Timeout(String),

    /// A spawned task exited with a non-zero code.
    #[error("Exit code {exit_code}: {stderr}")]
    ExitCode {
        /// Exit code from the task.
        exit_code: i32,
        /// Captured stderr/stdout tail.
        stderr: String,
    },

    /// Container failed to start or be recreated.
    #[error("Recreate failed for {service}: {detail}")]
    RecreateFailed {
        /// Service whose container could not be recreated.
        service: String,
        /// CLI output describing the failure.
        detail: String,
    },

    /// Engine daemon is unreachable.
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing of CLI output failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// A container image reference: repository plus optional tag and digest.
///
/// When a digest is present the reference is *pinned*: pulling or running it
/// is content-addressed and immune to tag mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Repository, e.g. `ghcr.io/acme/backend`.
    pub repository: String,
    /// Mutable tag, e.g. `1.4.2`. Absent for digest-only references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Content digest, e.g. `sha256:abc...`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse a docker-style reference: `repo`, `repo:tag`, `repo@digest`
    /// or `repo:tag@digest`.
    pub fn parse(reference: &str) -> Self {
        let (head, digest) = match reference.split_once('@') {
            Some((h, d)) => (h, Some(d.to_string())),
            None => (reference, None),
        };
        // A colon only separates a tag if it appears after the last slash,
        // otherwise it is a registry port (e.g. localhost:5000/app).
        let (repository, tag) = match head.rsplit_once(':') {
            Some((repo, t)) if !t.contains('/') => (repo.to_string(), Some(t.to_string())),
            _ => (head.to_string(), None),
        };
        Self {
            repository,
            tag,
            digest,
        }
    }

    /// The pinned `repo@digest` form, when a digest is known.
    pub fn pinned(&self) -> Option<String> {
        self.digest
            .as_ref()
            .map(|d| format!("{}@{}", self.repository, d))
    }

    /// The reference to hand to the CLI: pinned form preferred, then
    /// `repo:tag`, then bare repository.
    pub fn effective(&self) -> String {
        if let Some(pinned) = self.pinned() {
            return pinned;
        }
        match &self.tag {
            Some(tag) => format!("{}:{}", self.repository, tag),
            None => self.repository.clone(),
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.effective())
    }
}

/// Health status reported by the runtime for a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Healthcheck passing.
    Healthy,
    /// Healthcheck failing.
    Unhealthy,
    /// Healthcheck grace period.
    Starting,
    /// Container defines no healthcheck.
    None,
    /// Status could not be determined.
    #[default]
    Unknown,
}

impl std::str::FromStr for HealthStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "healthy" => HealthStatus::Healthy,
            "unhealthy" => HealthStatus::Unhealthy,
            "starting" => HealthStatus::Starting,
            "" | "none" => HealthStatus::None,
            _ => HealthStatus::Unknown,
        })
    }
}

/// Snapshot of a service's live container state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceState {
    /// Logical service name.
    pub service: String,
    /// Container id.
    pub container_id: String,
    /// Image the container runs, with digest when resolvable.
    pub image: ImageRef,
    /// Whether the container is running.
    pub running: bool,
    /// Reported health status.
    pub health: HealthStatus,
}

/// Record of a container replacement, kept so the inverse operation can be
/// constructed for rollback.
#[derive(Debug, Clone)]
pub struct ReplacedContainer {
    /// Service whose container was replaced.
    pub service: String,
    /// Container id before the replacement, if one existed.
    pub previous_container_id: Option<String>,
    /// Image before the replacement, if one existed.
    pub previous_image: Option<ImageRef>,
}

/// Output of a finite task (exec or one-shot run).
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    /// Process exit code.
    pub exit_code: i32,
    /// Combined stdout/stderr lines.
    pub lines: Vec<String>,
}

impl TaskOutput {
    /// Whether the task exited successfully.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last `n` output lines, for attaching to failure reasons.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(n);
        self.lines[start..].to_vec()
    }
}

/// Narrow interface over the container runtime.
///
/// Implementations are pure execution adapters: they never touch orchestrator
/// state. Every mutating call returns enough information for the caller to
/// construct its inverse.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine type identifier (e.g. "docker", "mock").
    fn engine_type(&self) -> &'static str;

    /// Verify the engine daemon is reachable.
    async fn ping(&self) -> Result<()>;

    /// Fetch an image. Pulling an already-present digest is a no-op that
    /// succeeds.
    async fn pull(&self, image: &ImageRef) -> Result<()>;

    /// Stop a service's container. Stopping an already-stopped container is
    /// a no-op that succeeds.
    async fn stop(&self, service: &str) -> Result<()>;

    /// Replace a service's container with one running `image`, preserving
    /// the existing mounts and network attachments.
    async fn recreate(&self, service: &str, image: &ImageRef) -> Result<ReplacedContainer>;

    /// Inspect a service's live state. Returns `None` for an unknown
    /// service.
    async fn inspect(&self, service: &str) -> Result<Option<ServiceState>>;

    /// Execute a command inside a running service container.
    async fn exec(&self, service: &str, command: &[String], timeout: Duration)
    -> Result<TaskOutput>;

    /// Run a command as a short-lived one-shot container from `image`,
    /// removed on exit. Used for schema migrations.
    async fn run_oneshot(
        &self,
        image: &ImageRef,
        command: &[String],
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<TaskOutput>;

    /// Copy a file or directory out of a service container.
    async fn copy_from(&self, service: &str, container_path: &str, host_dest: &Path)
    -> Result<()>;

    /// Copy a file or directory into a service container.
    async fn copy_to(&self, service: &str, host_src: &Path, container_path: &str) -> Result<()>;

    /// Fetch the most recent `lines` log lines for a service. Finite per
    /// call; callers re-invoke to observe newer output.
    async fn tail_logs(&self, service: &str, lines: usize) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_ref_parse_repo_tag() {
        let r = ImageRef::parse("ghcr.io/acme/backend:1.4.2");
        assert_eq!(r.repository, "ghcr.io/acme/backend");
        assert_eq!(r.tag.as_deref(), Some("1.4.2"));
        assert!(r.digest.is_none());
    }

    #[test]
    fn test_image_ref_parse_digest() {
        let r = ImageRef::parse("acme/backend@sha256:deadbeef");
        assert_eq!(r.repository, "acme/backend");
        assert!(r.tag.is_none());
        assert_eq!(r.digest.as_deref(), Some("sha256:deadbeef"));
    }

    #[test]
    fn test_image_ref_parse_registry_port() {
        let r = ImageRef::parse("localhost:5000/app");
        assert_eq!(r.repository, "localhost:5000/app");
        assert!(r.tag.is_none());
    }

    #[test]
    fn test_image_ref_parse_tag_and_digest() {
        let r = ImageRef::parse("acme/app:2.0@sha256:cafe");
        assert_eq!(r.repository, "acme/app");
        assert_eq!(r.tag.as_deref(), Some("2.0"));
        assert_eq!(r.digest.as_deref(), Some("sha256:cafe"));
    }

    #[test]
    fn test_image_ref_effective_prefers_digest() {
        let r = ImageRef::parse("acme/app:2.0@sha256:cafe");
        assert_eq!(r.effective(), "acme/app@sha256:cafe");
    }

    #[test]
    fn test_health_status_from_str() {
        assert_eq!("healthy".parse(), Ok(HealthStatus::Healthy));
        assert_eq!("starting".parse(), Ok(HealthStatus::Starting));
        assert_eq!("".parse(), Ok(HealthStatus::None));
        assert_eq!("garbled".parse(), Ok(HealthStatus::Unknown));
    }

    #[test]
    fn test_task_output_tail() {
        let out = TaskOutput {
            exit_code: 1,
            lines: (0..10).map(|i| format!("line {i}")).collect(),
        };
        let tail = out.tail(3);
        assert_eq!(tail, vec!["line 7", "line 8", "line 9"]);
        assert!(!out.success());
    }
}
