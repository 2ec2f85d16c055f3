// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock container engine for testing.
//!
//! Records every operation and can be scripted to fail specific steps, so
//! orchestrator tests can drive the full state machine (including rollback)
//! without a container runtime.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::traits::{
    ContainerEngine, EngineError, HealthStatus, ImageRef, ReplacedContainer, Result, ServiceState,
    TaskOutput,
};

#[derive(Default)]
struct Inner {
    services: HashMap<String, ServiceState>,
    present: BTreeSet<String>,
    pulled: Vec<String>,
    stopped: Vec<String>,
    recreated: Vec<(String, String)>,
    copied_from: Vec<(String, String)>,
    copied_to: Vec<(String, String)>,
    fail_pull: bool,
    fail_recreate: Option<String>,
    fail_exec: bool,
    unreachable: bool,
    exec_output: TaskOutput,
    oneshot_output: TaskOutput,
    oneshot_times_out: bool,
    health_after_recreate: HealthStatus,
    health_by_image: Vec<(String, HealthStatus)>,
    pull_delay: Option<Duration>,
}

/// Scripted in-memory engine.
pub struct MockEngine {
    inner: Mutex<Inner>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// Engine with no services and every operation succeeding.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                health_after_recreate: HealthStatus::Healthy,
                ..Default::default()
            }),
        }
    }

    /// Register a running, healthy service at the given image reference.
    pub fn with_service(self, service: &str, image: &str) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.services.insert(
                service.to_string(),
                ServiceState {
                    service: service.to_string(),
                    container_id: format!("mock-{service}"),
                    image: ImageRef::parse(image),
                    running: true,
                    health: HealthStatus::Healthy,
                },
            );
        }
        self
    }

    /// Script every subsequent `pull` to fail.
    pub fn fail_pulls(&self) {
        self.inner.lock().unwrap().fail_pull = true;
    }

    /// Script `recreate` of the named service to fail.
    pub fn fail_recreate_of(&self, service: &str) {
        self.inner.lock().unwrap().fail_recreate = Some(service.to_string());
    }

    /// Script every subsequent `exec` to fail with an engine error.
    pub fn fail_execs(&self) {
        self.inner.lock().unwrap().fail_exec = true;
    }

    /// Make `ping` report the daemon unreachable.
    pub fn make_unreachable(&self) {
        self.inner.lock().unwrap().unreachable = true;
    }

    /// Set the output returned by `exec`.
    pub fn set_exec_output(&self, exit_code: i32, lines: &[&str]) {
        self.inner.lock().unwrap().exec_output = TaskOutput {
            exit_code,
            lines: lines.iter().map(|s| s.to_string()).collect(),
        };
    }

    /// Set the output returned by `run_oneshot`.
    pub fn set_oneshot_output(&self, exit_code: i32, lines: &[&str]) {
        self.inner.lock().unwrap().oneshot_output = TaskOutput {
            exit_code,
            lines: lines.iter().map(|s| s.to_string()).collect(),
        };
    }

    /// Make `run_oneshot` exceed its deadline.
    pub fn oneshot_times_out(&self) {
        self.inner.lock().unwrap().oneshot_times_out = true;
    }

    /// Health status containers report after a recreate (default healthy).
    pub fn set_health_after_recreate(&self, health: HealthStatus) {
        self.inner.lock().unwrap().health_after_recreate = health;
    }

    /// Health reported after recreating onto an image whose reference
    /// contains `fragment`. Takes precedence over the global default, so a
    /// broken target can coexist with a healthy rollback pin.
    pub fn set_health_for_image(&self, fragment: &str, health: HealthStatus) {
        self.inner
            .lock()
            .unwrap()
            .health_by_image
            .push((fragment.to_string(), health));
    }

    /// Delay every `pull`, leaving a window for cancellation and
    /// single-flight tests.
    pub fn set_pull_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().pull_delay = Some(delay);
    }

    /// Override a service's reported health.
    pub fn set_health(&self, service: &str, health: HealthStatus) {
        if let Some(state) = self.inner.lock().unwrap().services.get_mut(service) {
            state.health = health;
        }
    }

    /// References pulled so far, in order.
    pub fn pulled(&self) -> Vec<String> {
        self.inner.lock().unwrap().pulled.clone()
    }

    /// Services stopped so far, in order.
    pub fn stopped(&self) -> Vec<String> {
        self.inner.lock().unwrap().stopped.clone()
    }

    /// `(service, image)` recreates so far, in order.
    pub fn recreated(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().recreated.clone()
    }

    /// `(service, container_path)` copy-outs so far.
    pub fn copied_from(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().copied_from.clone()
    }

    /// `(service, container_path)` copy-ins so far.
    pub fn copied_to(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().copied_to.clone()
    }

    /// References currently present in the image store, deduplicated.
    /// A pull of an already-present reference leaves this unchanged.
    pub fn present_images(&self) -> Vec<String> {
        self.inner.lock().unwrap().present.iter().cloned().collect()
    }

    /// Current image reference of a service, as the engine sees it.
    pub fn current_image(&self, service: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .services
            .get(service)
            .map(|s| s.image.effective())
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    fn engine_type(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> Result<()> {
        if self.inner.lock().unwrap().unreachable {
            return Err(EngineError::Unavailable("mock engine offline".to_string()));
        }
        Ok(())
    }

    async fn pull(&self, image: &ImageRef) -> Result<()> {
        let delay = self.inner.lock().unwrap().pull_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_pull {
            return Err(EngineError::PullFailed {
                reference: image.effective(),
                detail: "scripted pull failure".to_string(),
            });
        }
        inner.pulled.push(image.effective());
        inner.present.insert(image.effective());
        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.stopped.push(service.to_string());
        if let Some(state) = inner.services.get_mut(service) {
            state.running = false;
        }
        Ok(())
    }

    async fn recreate(&self, service: &str, image: &ImageRef) -> Result<ReplacedContainer> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_recreate.as_deref() == Some(service) {
            return Err(EngineError::RecreateFailed {
                service: service.to_string(),
                detail: "scripted recreate failure".to_string(),
            });
        }
        inner
            .recreated
            .push((service.to_string(), image.effective()));

        let previous = inner.services.get(service).cloned();
        let reference = image.effective();
        let health = inner
            .health_by_image
            .iter()
            .find(|(fragment, _)| reference.contains(fragment))
            .map(|(_, health)| *health)
            .unwrap_or(inner.health_after_recreate);
        let generation = inner.recreated.len();
        inner.services.insert(
            service.to_string(),
            ServiceState {
                service: service.to_string(),
                container_id: format!("mock-{service}-{generation}"),
                image: image.clone(),
                running: true,
                health,
            },
        );

        Ok(ReplacedContainer {
            service: service.to_string(),
            previous_container_id: previous.as_ref().map(|p| p.container_id.clone()),
            previous_image: previous.map(|p| p.image),
        })
    }

    async fn inspect(&self, service: &str) -> Result<Option<ServiceState>> {
        Ok(self.inner.lock().unwrap().services.get(service).cloned())
    }

    async fn exec(
        &self,
        service: &str,
        _command: &[String],
        _timeout: Duration,
    ) -> Result<TaskOutput> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_exec {
            return Err(EngineError::Other(format!(
                "scripted exec failure in {service}"
            )));
        }
        if !inner.services.contains_key(service) {
            return Err(EngineError::ServiceNotFound(service.to_string()));
        }
        Ok(inner.exec_output.clone())
    }

    async fn run_oneshot(
        &self,
        image: &ImageRef,
        command: &[String],
        _env: &HashMap<String, String>,
        _timeout: Duration,
    ) -> Result<TaskOutput> {
        let inner = self.inner.lock().unwrap();
        if inner.oneshot_times_out {
            return Err(EngineError::Timeout(format!(
                "{} {}",
                image.effective(),
                command.join(" ")
            )));
        }
        Ok(inner.oneshot_output.clone())
    }

    async fn copy_from(
        &self,
        service: &str,
        container_path: &str,
        host_dest: &Path,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.services.contains_key(service) {
                return Err(EngineError::ServiceNotFound(service.to_string()));
            }
            inner
                .copied_from
                .push((service.to_string(), container_path.to_string()));
        }
        if let Some(parent) = host_dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(host_dest, format!("mock:{container_path}\n")).await?;
        Ok(())
    }

    async fn copy_to(&self, service: &str, _host_src: &Path, container_path: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.services.contains_key(service) {
            return Err(EngineError::ServiceNotFound(service.to_string()));
        }
        inner
            .copied_to
            .push((service.to_string(), container_path.to_string()));
        Ok(())
    }

    async fn tail_logs(&self, _service: &str, _lines: usize) -> Result<Vec<String>> {
        Ok(vec!["mock log line".to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recreate_swaps_image_and_reports_previous() {
        let engine = MockEngine::new().with_service("backend", "acme/backend@sha256:old");
        let replaced = engine
            .recreate("backend", &ImageRef::parse("acme/backend@sha256:new"))
            .await
            .unwrap();
        assert_eq!(
            replaced.previous_image.unwrap().digest.as_deref(),
            Some("sha256:old")
        );
        assert_eq!(
            engine.current_image("backend").unwrap(),
            "acme/backend@sha256:new"
        );
    }

    #[tokio::test]
    async fn test_scripted_pull_failure() {
        let engine = MockEngine::new();
        engine.fail_pulls();
        let err = engine
            .pull(&ImageRef::parse("acme/app:1.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PullFailed { .. }));
        assert!(engine.pulled().is_empty());
    }

    #[tokio::test]
    async fn test_pull_of_present_digest_is_noop() {
        let engine = MockEngine::new();
        let image = ImageRef::parse("acme/backend@sha256:cafe");
        engine.pull(&image).await.unwrap();
        engine.pull(&image).await.unwrap();
        // Both invocations succeed; the image store holds one copy.
        assert_eq!(engine.pulled().len(), 2);
        assert_eq!(
            engine.present_images(),
            vec!["acme/backend@sha256:cafe".to_string()]
        );
    }

    #[tokio::test]
    async fn test_copy_from_writes_host_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MockEngine::new().with_service("postgres", "postgres:16");
        let dest = dir.path().join("dump.sql");
        engine
            .copy_from("postgres", "/tmp/dump.sql", &dest)
            .await
            .unwrap();
        assert!(dest.exists());
        assert_eq!(engine.copied_from(), vec![(
            "postgres".to_string(),
            "/tmp/dump.sql".to_string()
        )]);
    }
}
