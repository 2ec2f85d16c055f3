// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker CLI engine implementation.
//!
//! Drives the container runtime through the `docker` binary: `docker pull`
//! for images, `docker compose` for service lifecycle (which preserves the
//! mounts and network attachments declared in the compose file), `docker
//! inspect` for state, `docker cp`/`docker exec` for backup plumbing.
//!
//! Digest pinning is carried through a generated override file
//! (`docker-compose.pinned.yml`) that maps services to `repo@sha256:...`
//! references; every compose invocation includes it when present.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::traits::{
    ContainerEngine, EngineError, HealthStatus, ImageRef, ReplacedContainer, Result, ServiceState,
    TaskOutput,
};

/// Well-known locations probed when `DOCKER_BIN` is not set and `docker` is
/// not on PATH.
const DOCKER_CANDIDATES: &[&str] = &["/usr/local/bin/docker", "/usr/bin/docker"];

/// Configuration for the docker engine.
#[derive(Debug, Clone)]
pub struct DockerEngineConfig {
    /// Explicit docker binary path; resolved from PATH/candidates when unset.
    pub docker_bin: Option<PathBuf>,
    /// Compose project working directory.
    pub workdir: PathBuf,
    /// Compose project name (`docker compose -p`).
    pub project: String,
    /// Docker network one-shot tasks attach to (the stack's compose
    /// network), so migrations can reach the relational store.
    pub network: Option<String>,
    /// Default timeout for compose lifecycle commands.
    pub command_timeout: Duration,
}

impl Default for DockerEngineConfig {
    fn default() -> Self {
        Self {
            docker_bin: None,
            workdir: PathBuf::from("/workspace"),
            project: "stack".to_string(),
            network: None,
            command_timeout: Duration::from_secs(600),
        }
    }
}

/// Container engine backed by the docker CLI.
pub struct DockerEngine {
    config: DockerEngineConfig,
    /// Service -> pinned reference, persisted to the compose override file.
    pins: Mutex<BTreeMap<String, String>>,
}

impl DockerEngine {
    /// Create a new docker engine.
    pub fn new(config: DockerEngineConfig) -> Self {
        Self {
            config,
            pins: Mutex::new(BTreeMap::new()),
        }
    }

    /// Resolve the docker binary: explicit config, then PATH, then known
    /// locations.
    fn docker_bin(&self) -> Result<PathBuf> {
        if let Some(bin) = &self.config.docker_bin {
            if bin.exists() {
                return Ok(bin.clone());
            }
            return Err(EngineError::CliNotFound(bin.display().to_string()));
        }
        if let Some(paths) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&paths) {
                let candidate = dir.join("docker");
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }
        for candidate in DOCKER_CANDIDATES {
            let path = Path::new(candidate);
            if path.exists() {
                return Ok(path.to_path_buf());
            }
        }
        Err(EngineError::CliNotFound("docker".to_string()))
    }

    /// Run a docker command, streaming combined output and enforcing a
    /// timeout. The child is killed when the timeout elapses.
    async fn run_docker(&self, args: &[String], timeout: Duration) -> Result<TaskOutput> {
        let bin = self.docker_bin()?;
        debug!(bin = %bin.display(), args = ?args, "running docker command");

        let mut child = Command::new(&bin)
            .args(args)
            .current_dir(&self.config.workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let collect = async {
            let mut lines = Vec::new();
            let mut out = BufReader::new(stdout).lines();
            let mut err = BufReader::new(stderr).lines();
            // Once stderr hits EOF its arm is disabled so the loop only
            // awaits live sources.
            let mut err_open = true;
            loop {
                tokio::select! {
                    line = out.next_line() => match line? {
                        Some(l) => lines.push(l),
                        None => break,
                    },
                    line = err.next_line(), if err_open => match line? {
                        Some(l) => lines.push(l),
                        None => err_open = false,
                    },
                }
            }
            // Drain remaining stderr after stdout closes.
            if err_open {
                while let Some(l) = err.next_line().await? {
                    lines.push(l);
                }
            }
            let status = child.wait().await?;
            Ok::<TaskOutput, EngineError>(TaskOutput {
                exit_code: status.code().unwrap_or(-1),
                lines,
            })
        };

        match tokio::time::timeout(timeout, collect).await {
            Ok(output) => output,
            Err(_) => Err(EngineError::Timeout(format!("docker {}", args.join(" ")))),
        }
    }

    /// Compose invocation with the project flag and, when present, the
    /// pinned override file.
    async fn compose(&self, args: &[&str], timeout: Duration) -> Result<TaskOutput> {
        let pinned_path = self.pinned_override_path();
        let mut full: Vec<String> = vec![
            "compose".to_string(),
            "-p".to_string(),
            self.config.project.clone(),
        ];
        if pinned_path.exists() {
            full.push("-f".to_string());
            full.push("docker-compose.yml".to_string());
            full.push("-f".to_string());
            full.push(pinned_path.display().to_string());
        }
        full.extend(args.iter().map(|s| s.to_string()));
        self.run_docker(&full, timeout).await
    }

    fn pinned_override_path(&self) -> PathBuf {
        self.config.workdir.join("docker-compose.pinned.yml")
    }

    /// Rewrite the pinned override file from the current pin map.
    async fn write_pins(&self, pins: &BTreeMap<String, String>) -> Result<()> {
        let mut content = String::from(
            "# Generated by stack-updater - DO NOT EDIT\n# Pinned image digests for version tracking\nservices:\n",
        );
        for (service, reference) in pins {
            content.push_str(&format!("  {service}:\n    image: {reference}\n"));
        }
        tokio::fs::write(self.pinned_override_path(), content).await?;
        Ok(())
    }

    /// Parse `docker inspect` output for a container into a service state.
    async fn parse_inspect(&self, service: &str, raw: &str) -> Result<Option<ServiceState>> {
        let parsed: serde_json::Value = serde_json::from_str(raw)?;
        let Some(obj) = parsed.as_array().and_then(|a| a.first()) else {
            return Ok(None);
        };

        let container_id = obj
            .get("Id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let image_ref = obj
            .pointer("/Config/Image")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let image_id = obj.get("Image").and_then(|v| v.as_str()).unwrap_or_default();

        let mut image = ImageRef::parse(image_ref);
        if image.digest.is_none() {
            image.digest = self.resolve_local_digest(image_id, &image.repository).await;
        }

        let running = obj
            .pointer("/State/Running")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let health = obj
            .pointer("/State/Health/Status")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .parse()
            .unwrap_or(HealthStatus::Unknown);

        Ok(Some(ServiceState {
            service: service.to_string(),
            container_id,
            image,
            running,
            health,
        }))
    }

    /// Resolve a repo digest for a local image id via `docker image
    /// inspect`, preferring a digest from the repository the container was
    /// started from.
    async fn resolve_local_digest(&self, image_id: &str, repository: &str) -> Option<String> {
        if image_id.is_empty() {
            return None;
        }
        let args = vec![
            "image".to_string(),
            "inspect".to_string(),
            image_id.to_string(),
        ];
        let output = self
            .run_docker(&args, Duration::from_secs(10))
            .await
            .ok()
            .filter(|o| o.success())?;
        let parsed: serde_json::Value = serde_json::from_str(&output.lines.join("\n")).ok()?;
        let repo_digests = parsed
            .as_array()?
            .first()?
            .get("RepoDigests")?
            .as_array()?
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>();

        let preferred = repo_digests
            .iter()
            .find(|r| r.starts_with(&format!("{repository}@")))
            .or_else(|| repo_digests.iter().find(|r| r.contains('@')))?;
        preferred.split_once('@').map(|(_, d)| d.to_string())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn engine_type(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        let args = vec![
            "version".to_string(),
            "--format".to_string(),
            "{{.Server.Version}}".to_string(),
        ];
        let output = self.run_docker(&args, Duration::from_secs(10)).await?;
        if output.success() {
            Ok(())
        } else {
            Err(EngineError::Unavailable(output.tail(5).join("; ")))
        }
    }

    async fn pull(&self, image: &ImageRef) -> Result<()> {
        let reference = image.effective();
        let args = vec!["pull".to_string(), reference.clone()];
        let output = self.run_docker(&args, self.config.command_timeout).await?;
        if output.success() {
            Ok(())
        } else {
            Err(EngineError::PullFailed {
                reference,
                detail: output.tail(10).join("\n"),
            })
        }
    }

    async fn stop(&self, service: &str) -> Result<()> {
        let output = self
            .compose(&["stop", service], self.config.command_timeout)
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(EngineError::Other(format!(
                "compose stop {service} failed: {}",
                output.tail(5).join("; ")
            )))
        }
    }

    async fn recreate(&self, service: &str, image: &ImageRef) -> Result<ReplacedContainer> {
        let previous = self.inspect(service).await?;

        {
            let mut pins = self.pins.lock().await;
            pins.insert(service.to_string(), image.effective());
            self.write_pins(&pins).await?;
        }

        let output = self
            .compose(
                &[
                    "up",
                    "-d",
                    "--no-build",
                    "--no-deps",
                    "--force-recreate",
                    service,
                ],
                self.config.command_timeout,
            )
            .await?;
        if !output.success() {
            return Err(EngineError::RecreateFailed {
                service: service.to_string(),
                detail: output.tail(10).join("\n"),
            });
        }

        Ok(ReplacedContainer {
            service: service.to_string(),
            previous_container_id: previous.as_ref().map(|p| p.container_id.clone()),
            previous_image: previous.map(|p| p.image),
        })
    }

    async fn inspect(&self, service: &str) -> Result<Option<ServiceState>> {
        let args = vec!["inspect".to_string(), service.to_string()];
        let output = self.run_docker(&args, Duration::from_secs(10)).await?;
        if !output.success() {
            // docker inspect exits non-zero for unknown names
            return Ok(None);
        }
        self.parse_inspect(service, &output.lines.join("\n")).await
    }

    async fn exec(
        &self,
        service: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<TaskOutput> {
        let mut args = vec!["exec".to_string(), service.to_string()];
        args.extend_from_slice(command);
        self.run_docker(&args, timeout).await
    }

    async fn run_oneshot(
        &self,
        image: &ImageRef,
        command: &[String],
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<TaskOutput> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        if let Some(network) = &self.config.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(image.effective());
        args.extend_from_slice(command);
        self.run_docker(&args, timeout).await
    }

    async fn copy_from(
        &self,
        service: &str,
        container_path: &str,
        host_dest: &Path,
    ) -> Result<()> {
        if let Some(parent) = host_dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let args = vec![
            "cp".to_string(),
            format!("{service}:{container_path}"),
            host_dest.display().to_string(),
        ];
        let output = self.run_docker(&args, self.config.command_timeout).await?;
        if output.success() {
            Ok(())
        } else {
            Err(EngineError::Other(format!(
                "docker cp from {service}:{container_path} failed: {}",
                output.tail(5).join("; ")
            )))
        }
    }

    async fn copy_to(&self, service: &str, host_src: &Path, container_path: &str) -> Result<()> {
        let args = vec![
            "cp".to_string(),
            host_src.display().to_string(),
            format!("{service}:{container_path}"),
        ];
        let output = self.run_docker(&args, self.config.command_timeout).await?;
        if output.success() {
            Ok(())
        } else {
            Err(EngineError::Other(format!(
                "docker cp to {service}:{container_path} failed: {}",
                output.tail(5).join("; ")
            )))
        }
    }

    async fn tail_logs(&self, service: &str, lines: usize) -> Result<Vec<String>> {
        let args = vec![
            "logs".to_string(),
            "--tail".to_string(),
            lines.to_string(),
            service.to_string(),
        ];
        let output = self.run_docker(&args, Duration::from_secs(30)).await?;
        if output.success() {
            Ok(output.lines)
        } else {
            warn!(service, "log tail failed: {}", output.tail(3).join("; "));
            Ok(Vec::new())
        }
    }
}
