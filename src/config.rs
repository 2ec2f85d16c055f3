// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the stack updater.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Names of the managed services, as they appear in the compose project.
#[derive(Debug, Clone)]
pub struct ServiceNames {
    /// Frontend / application container.
    pub frontend: String,
    /// Backend API container.
    pub backend: String,
    /// Relational datastore container.
    pub relational: String,
    /// Time-series datastore container.
    pub timeseries: String,
}

impl ServiceNames {
    /// The services recreated during an update, in dependency order
    /// (datastores are never recreated by an update).
    pub fn updatable(&self) -> Vec<String> {
        vec![self.backend.clone(), self.frontend.clone()]
    }

    /// All managed services.
    pub fn all(&self) -> Vec<String> {
        vec![
            self.frontend.clone(),
            self.backend.clone(),
            self.relational.clone(),
            self.timeseries.clone(),
        ]
    }
}

/// Updater configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Admin API listen address.
    pub http_addr: SocketAddr,
    /// Explicit docker binary path (resolved automatically when unset).
    pub docker_bin: Option<PathBuf>,
    /// Compose project working directory.
    pub workdir: PathBuf,
    /// Compose project name.
    pub compose_project: String,
    /// Docker network migration one-shots attach to.
    pub compose_network: Option<String>,
    /// Root directory for backup generations.
    pub backups_dir: PathBuf,
    /// Directory for per-session update log files.
    pub update_logs_dir: PathBuf,
    /// Release manifest URL template; `{channel}` is substituted.
    pub manifest_url: Option<String>,
    /// Default release channel.
    pub default_channel: String,
    /// Freshness window for cached manifest lookups.
    pub version_cache_ttl: Duration,
    /// Registry base URL probed during preflight, when set.
    pub registry_url: Option<String>,
    /// Minimum free disk space required by preflight.
    pub min_free_disk_bytes: u64,
    /// Overall healthcheck deadline after recreate.
    pub health_timeout: Duration,
    /// Poll interval while waiting for health.
    pub health_poll_interval: Duration,
    /// Deadline for the schema migration one-shot.
    pub migration_timeout: Duration,
    /// Default deadline for in-container exec commands.
    pub exec_timeout: Duration,
    /// Managed service names.
    pub services: ServiceNames,
    /// Services whose health gates update success. Defaults to the
    /// updatable services.
    pub health_services: Vec<String>,
    /// Age after which an unpromoted backup generation is purge-eligible.
    pub generation_ttl: Duration,
    /// Maximum number of terminal sessions retained in history.
    pub session_history_limit: usize,
    /// Maximum age of a terminal session before eviction.
    pub session_history_max_age: Duration,
    /// Fail preflight unless image signatures can be verified.
    pub require_signatures: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("UPDATER_HTTP_PORT")
            .unwrap_or_else(|_| "8891".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("UPDATER_HTTP_PORT"))?;
        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let docker_bin = std::env::var("DOCKER_BIN").ok().map(PathBuf::from);

        let workdir =
            PathBuf::from(std::env::var("WORKDIR").unwrap_or_else(|_| "/workspace".to_string()));
        let compose_project =
            std::env::var("COMPOSE_PROJECT").unwrap_or_else(|_| "stack".to_string());
        let compose_network = std::env::var("COMPOSE_NETWORK").ok().filter(|v| !v.is_empty());

        let backups_dir =
            PathBuf::from(std::env::var("BACKUPS_DIR").unwrap_or_else(|_| "/backups".to_string()));
        let update_logs_dir = PathBuf::from(
            std::env::var("UPDATE_LOGS_DIR").unwrap_or_else(|_| "/update_logs".to_string()),
        );

        let manifest_url = std::env::var("VERSION_MANIFEST_URL")
            .ok()
            .filter(|v| !v.is_empty());
        let default_channel =
            std::env::var("VERSION_CHANNEL_DEFAULT").unwrap_or_else(|_| "stable".to_string());
        let version_cache_ttl = parse_secs("VERSION_CACHE_TTL_SECS", 3600)?;

        let registry_url = std::env::var("REGISTRY_URL").ok().filter(|v| !v.is_empty());

        let min_free_disk_bytes: u64 = std::env::var("MIN_FREE_DISK_BYTES")
            .unwrap_or_else(|_| "2147483648".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("MIN_FREE_DISK_BYTES"))?;

        let health_timeout = parse_secs("HEALTH_TIMEOUT_SECS", 300)?;
        let health_poll_interval = parse_secs("HEALTH_POLL_INTERVAL_SECS", 2)?;
        let migration_timeout = parse_secs("MIGRATION_TIMEOUT_SECS", 600)?;
        let exec_timeout = parse_secs("EXEC_TIMEOUT_SECS", 900)?;

        let services = ServiceNames {
            frontend: std::env::var("SERVICE_FRONTEND").unwrap_or_else(|_| "app".to_string()),
            backend: std::env::var("SERVICE_BACKEND").unwrap_or_else(|_| "backend".to_string()),
            relational: std::env::var("SERVICE_RELATIONAL")
                .unwrap_or_else(|_| "postgres".to_string()),
            timeseries: std::env::var("SERVICE_TIMESERIES")
                .unwrap_or_else(|_| "influxdb".to_string()),
        };

        let health_services = match std::env::var("UPDATE_HEALTH_SERVICES") {
            Ok(v) if !v.is_empty() => v.split(',').map(|s| s.trim().to_string()).collect(),
            _ => services.updatable(),
        };

        let generation_ttl = parse_secs("GENERATION_TTL_SECS", 14 * 24 * 3600)?;

        let session_history_limit: usize = std::env::var("SESSION_HISTORY_LIMIT")
            .unwrap_or_else(|_| "16".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("SESSION_HISTORY_LIMIT"))?;
        let session_history_max_age = parse_secs("SESSION_HISTORY_MAX_AGE_SECS", 7 * 24 * 3600)?;

        let require_signatures = std::env::var("REQUIRE_IMAGE_SIGNATURES")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            http_addr,
            docker_bin,
            workdir,
            compose_project,
            compose_network,
            backups_dir,
            update_logs_dir,
            manifest_url,
            default_channel,
            version_cache_ttl,
            registry_url,
            min_free_disk_bytes,
            health_timeout,
            health_poll_interval,
            migration_timeout,
            exec_timeout,
            services,
            health_services,
            generation_ttl,
            session_history_limit,
            session_history_max_age,
            require_signatures,
        })
    }
}

fn parse_secs(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs: u64 = std::env::var(var)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::InvalidValue(var))?;
    Ok(Duration::from_secs(secs))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable holds an unparseable value.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_names_updatable_order() {
        let names = ServiceNames {
            frontend: "app".to_string(),
            backend: "backend".to_string(),
            relational: "postgres".to_string(),
            timeseries: "influxdb".to_string(),
        };
        // Backend first so the API is up before the frontend is replaced.
        assert_eq!(names.updatable(), vec!["backend", "app"]);
        assert_eq!(names.all().len(), 4);
    }
}
