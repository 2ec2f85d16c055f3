// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schema migrations.
//!
//! Migrations run as a one-shot container from the *target* backend image,
//! so the schema moves forward before any long-lived container is replaced.
//! Timeouts are reported distinctly from non-zero exits: a timed-out
//! migration may still be holding locks, and the operator message differs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{ContainerEngine, EngineError, EngineResult, ImageRef};

/// How a migration run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Migration exited zero.
    Applied,
    /// Migration exited non-zero.
    Failed {
        /// The migration process exit code.
        exit_code: i32,
    },
    /// Migration exceeded its deadline.
    TimedOut,
}

/// Result of one migration run.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    /// How the run ended.
    pub status: MigrationStatus,
    /// Output tail for the session log.
    pub log: Vec<String>,
}

impl MigrationOutcome {
    /// Whether the schema is at the target revision.
    pub fn applied(&self) -> bool {
        self.status == MigrationStatus::Applied
    }
}

/// Runs schema migrations against the relational store.
pub struct MigrationRunner {
    engine: Arc<dyn ContainerEngine>,
    command: Vec<String>,
    env: HashMap<String, String>,
    timeout: Duration,
}

impl MigrationRunner {
    /// Create a runner with the default migration command.
    pub fn new(engine: Arc<dyn ContainerEngine>, timeout: Duration) -> Self {
        Self {
            engine,
            command: vec![
                "alembic".to_string(),
                "upgrade".to_string(),
                "head".to_string(),
            ],
            env: HashMap::new(),
            timeout,
        }
    }

    /// Override the migration command.
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Extra environment passed to the migration container.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Run migrations from `target` and classify the result. Engine errors
    /// other than timeout propagate.
    pub async fn run(&self, target: &ImageRef) -> EngineResult<MigrationOutcome> {
        info!(image = %target, command = ?self.command, "Running schema migration");
        let output = match self
            .engine
            .run_oneshot(target, &self.command, &self.env, self.timeout)
            .await
        {
            Ok(output) => output,
            Err(EngineError::Timeout(detail)) => {
                warn!(image = %target, "Schema migration timed out: {detail}");
                return Ok(MigrationOutcome {
                    status: MigrationStatus::TimedOut,
                    log: vec![detail],
                });
            }
            Err(e) => return Err(e),
        };

        if output.success() {
            info!(image = %target, "Schema migration applied");
            Ok(MigrationOutcome {
                status: MigrationStatus::Applied,
                log: output.tail(20),
            })
        } else {
            warn!(
                image = %target,
                exit_code = output.exit_code,
                "Schema migration failed"
            );
            Ok(MigrationOutcome {
                status: MigrationStatus::Failed {
                    exit_code: output.exit_code,
                },
                log: output.tail(20),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;

    fn target() -> ImageRef {
        ImageRef::parse("acme/backend@sha256:new")
    }

    #[tokio::test]
    async fn test_applied_on_zero_exit() {
        let engine = Arc::new(MockEngine::new());
        engine.set_oneshot_output(0, &["INFO  [alembic] Running upgrade -> abc123"]);
        let runner = MigrationRunner::new(engine, Duration::from_secs(60));
        let outcome = runner.run(&target()).await.unwrap();
        assert!(outcome.applied());
    }

    #[tokio::test]
    async fn test_failed_carries_exit_code() {
        let engine = Arc::new(MockEngine::new());
        engine.set_oneshot_output(1, &["FAILED: duplicate column"]);
        let runner = MigrationRunner::new(engine, Duration::from_secs(60));
        let outcome = runner.run(&target()).await.unwrap();
        assert_eq!(outcome.status, MigrationStatus::Failed { exit_code: 1 });
        assert!(outcome.log.iter().any(|l| l.contains("duplicate column")));
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_from_failure() {
        let engine = Arc::new(MockEngine::new());
        engine.oneshot_times_out();
        let runner = MigrationRunner::new(engine, Duration::from_secs(1));
        let outcome = runner.run(&target()).await.unwrap();
        assert_eq!(outcome.status, MigrationStatus::TimedOut);
    }
}
