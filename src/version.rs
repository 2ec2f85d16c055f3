// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Version resolution: release manifests, current-version inspection and
//! update-availability computation.
//!
//! Latest-version lookups go through a freshness-window cache so status
//! polling does not hammer the release endpoint; a forced refresh bypasses
//! the window. Target versions resolve to digest-pinned image references
//! whenever the manifest publishes digests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::{ContainerEngine, HealthStatus, ImageRef};
use crate::error::{Error, Result};

/// A published release: stack version plus per-service images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseManifest {
    /// Stack version, e.g. `1.5.0`.
    pub version: String,
    /// Channel the manifest was published to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Service name -> image reference (normally `repo:tag`).
    pub services: BTreeMap<String, String>,
    /// Service name -> content digest (`sha256:...`), when published.
    #[serde(default)]
    pub digests: BTreeMap<String, String>,
}

/// A resolved update target: version plus pinned per-service images.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    /// Target stack version.
    pub version: String,
    /// Channel it was resolved from.
    pub channel: String,
    /// Service -> image, digest-pinned where the manifest allows.
    pub images: BTreeMap<String, ImageRef>,
}

/// Live version state of one running service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceVersion {
    /// Image reference the container runs.
    pub image: String,
    /// Content digest, when resolvable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Whether the container is running.
    pub running: bool,
    /// Reported health.
    pub health: HealthStatus,
}

/// The latest published release, as reported to clients. Carries the
/// per-service images so a UI can show what an update would install.
#[derive(Debug, Clone, Serialize)]
pub struct LatestRelease {
    /// Published stack version.
    pub version: String,
    /// Service name -> image reference.
    pub services: BTreeMap<String, String>,
    /// Service name -> content digest, when published.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub digests: BTreeMap<String, String>,
}

/// Aggregate answer for the version endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct VersionReport {
    /// Channel consulted.
    pub channel: String,
    /// Latest published release, when the manifest was reachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<LatestRelease>,
    /// Whether any service would change by updating to latest.
    pub update_available: bool,
    /// Whether an update session is currently in flight. Filled in by the
    /// handler, which owns that knowledge.
    pub update_in_progress: bool,
    /// When the release endpoint was last actually consulted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Live per-service state.
    pub current: BTreeMap<String, ServiceVersion>,
}

struct CachedManifest {
    manifest: ReleaseManifest,
    fetched_at: Instant,
}

/// Resolver over the release endpoint and the container engine.
pub struct VersionResolver {
    http: reqwest::Client,
    engine: Arc<dyn ContainerEngine>,
    manifest_url: Option<String>,
    default_channel: String,
    cache_ttl: Duration,
    cache: Mutex<BTreeMap<String, CachedManifest>>,
    last_checked: Mutex<Option<DateTime<Utc>>>,
}

impl VersionResolver {
    /// Create a resolver.
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        manifest_url: Option<String>,
        default_channel: String,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            engine,
            manifest_url,
            default_channel,
            cache_ttl,
            cache: Mutex::new(BTreeMap::new()),
            last_checked: Mutex::new(None),
        }
    }

    /// The channel used when a request names none.
    pub fn default_channel(&self) -> &str {
        &self.default_channel
    }

    /// Latest manifest for a channel, served from cache inside the
    /// freshness window unless `force` is set.
    pub async fn latest_manifest(
        &self,
        channel: Option<&str>,
        force: bool,
    ) -> Result<ReleaseManifest> {
        let channel = channel.unwrap_or(&self.default_channel).to_string();
        if !force
            && let Some(cached) = self.cache.lock().unwrap().get(&channel)
            && cached.fetched_at.elapsed() < self.cache_ttl
        {
            debug!(channel, "Serving manifest from cache");
            return Ok(cached.manifest.clone());
        }

        let template = self
            .manifest_url
            .as_ref()
            .ok_or_else(|| Error::Config("VERSION_MANIFEST_URL is not set".to_string()))?;
        let url = template.replace("{channel}", &channel);
        debug!(%url, "Fetching release manifest");
        let manifest: ReleaseManifest = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.cache.lock().unwrap().insert(
            channel,
            CachedManifest {
                manifest: manifest.clone(),
                fetched_at: Instant::now(),
            },
        );
        *self.last_checked.lock().unwrap() = Some(Utc::now());
        Ok(manifest)
    }

    /// Drop all cached manifests. Called after a successful update so the
    /// next availability check observes the new baseline.
    pub fn invalidate_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// Resolve an update target. A requested version must match what the
    /// channel publishes; `None` means "latest".
    pub async fn resolve_target(
        &self,
        requested: Option<&str>,
        channel: Option<&str>,
    ) -> Result<ResolvedTarget> {
        let channel = channel.unwrap_or(&self.default_channel).to_string();
        // Target resolution always sees a fresh manifest.
        let manifest = self.latest_manifest(Some(&channel), true).await?;

        if let Some(requested) = requested
            && requested != manifest.version
        {
            return Err(Error::InvalidTarget(format!(
                "version {requested} is not published on channel {channel} (latest: {})",
                manifest.version
            )));
        }

        let mut images = BTreeMap::new();
        for (service, reference) in &manifest.services {
            let mut image = ImageRef::parse(reference);
            if let Some(digest) = manifest.digests.get(service) {
                image.digest = Some(digest.clone());
            }
            images.insert(service.clone(), image);
        }

        Ok(ResolvedTarget {
            version: manifest.version,
            channel,
            images,
        })
    }

    /// Live per-service version state via the engine.
    pub async fn current_versions(
        &self,
        services: &[String],
    ) -> Result<BTreeMap<String, ServiceVersion>> {
        let mut current = BTreeMap::new();
        for service in services {
            match self.engine.inspect(service).await? {
                Some(state) => {
                    current.insert(
                        service.clone(),
                        ServiceVersion {
                            image: state.image.effective(),
                            digest: state.image.digest.clone(),
                            running: state.running,
                            health: state.health,
                        },
                    );
                }
                None => {
                    warn!(service, "Service has no container");
                }
            }
        }
        Ok(current)
    }

    /// Build the version report: current state plus whether updating to the
    /// channel's latest would change anything. `refresh` bypasses the
    /// manifest cache.
    pub async fn report(
        &self,
        services: &[String],
        channel: Option<&str>,
        refresh: bool,
    ) -> Result<VersionReport> {
        let channel = channel.unwrap_or(&self.default_channel).to_string();
        let current = self.current_versions(services).await?;

        let manifest = match self.latest_manifest(Some(&channel), refresh).await {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(channel, "Latest-version lookup failed: {e}");
                None
            }
        };

        let update_available = manifest
            .as_ref()
            .map(|m| Self::compute_update_available(m, &current))
            .unwrap_or(false);

        Ok(VersionReport {
            channel,
            latest: manifest.map(|m| LatestRelease {
                version: m.version,
                services: m.services,
                digests: m.digests,
            }),
            update_available,
            update_in_progress: false,
            last_checked_at: *self.last_checked.lock().unwrap(),
            current,
        })
    }

    /// A service is out of date when its published digest differs from the
    /// running one, or (without digests) when the published tag is a higher
    /// semver than the running tag.
    fn compute_update_available(
        manifest: &ReleaseManifest,
        current: &BTreeMap<String, ServiceVersion>,
    ) -> bool {
        for (service, reference) in &manifest.services {
            let Some(running) = current.get(service) else {
                // A service the manifest knows and we don't run is not an
                // update signal; composition differences are handled by
                // provisioning, not updates.
                continue;
            };
            if let Some(published) = manifest.digests.get(service) {
                match &running.digest {
                    Some(digest) if digest == published => continue,
                    _ => return true,
                }
            }
            let published_tag = ImageRef::parse(reference).tag;
            let running_tag = ImageRef::parse(&running.image).tag;
            if let (Some(published), Some(running)) = (published_tag, running_tag)
                && let (Ok(published), Ok(running)) =
                    (Version::parse(&published), Version::parse(&running))
                && published > running
            {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(digests: &[(&str, &str)]) -> ReleaseManifest {
        ReleaseManifest {
            version: "1.5.0".to_string(),
            channel: Some("stable".to_string()),
            services: BTreeMap::from([
                ("backend".to_string(), "acme/backend:1.5.0".to_string()),
                ("app".to_string(), "acme/app:1.5.0".to_string()),
            ]),
            digests: digests
                .iter()
                .map(|(s, d)| (s.to_string(), d.to_string()))
                .collect(),
        }
    }

    fn running(digest: Option<&str>, tag: &str) -> ServiceVersion {
        ServiceVersion {
            image: format!("acme/backend:{tag}"),
            digest: digest.map(|d| d.to_string()),
            running: true,
            health: HealthStatus::Healthy,
        }
    }

    #[test]
    fn test_update_available_on_digest_drift() {
        let m = manifest(&[("backend", "sha256:new")]);
        let current = BTreeMap::from([("backend".to_string(), running(Some("sha256:old"), "1.4.0"))]);
        assert!(VersionResolver::compute_update_available(&m, &current));
    }

    #[test]
    fn test_no_update_when_digests_match() {
        let m = manifest(&[("backend", "sha256:same")]);
        let current =
            BTreeMap::from([("backend".to_string(), running(Some("sha256:same"), "1.5.0"))]);
        assert!(!VersionResolver::compute_update_available(&m, &current));
    }

    #[test]
    fn test_semver_fallback_without_digests() {
        let m = manifest(&[]);
        let older = BTreeMap::from([("backend".to_string(), running(None, "1.4.2"))]);
        assert!(VersionResolver::compute_update_available(&m, &older));

        let same = BTreeMap::from([("backend".to_string(), running(None, "1.5.0"))]);
        assert!(!VersionResolver::compute_update_available(&m, &same));

        // Running ahead of the channel is not "update available".
        let newer = BTreeMap::from([("backend".to_string(), running(None, "1.6.0"))]);
        assert!(!VersionResolver::compute_update_available(&m, &newer));
    }

    #[test]
    fn test_manifest_deserializes_without_digests() {
        let raw = r#"{
            "version": "1.5.0",
            "services": {"backend": "acme/backend:1.5.0"}
        }"#;
        let m: ReleaseManifest = serde_json::from_str(raw).unwrap();
        assert!(m.digests.is_empty());
        assert!(m.channel.is_none());
    }
}
