//! Declarative apply and readiness polling.
//!
//! [`ManifestApplier::wait_ready`] takes an [`AppliedManifest`], which only
//! [`ManifestApplier::apply`] hands out, so a readiness wait cannot be issued
//! for a manifest whose apply did not succeed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dockside_core::{CommandRunner, CommandSpec, DeployConfig, DeployError, Result};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

/// A workload in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl ResourceRef {
    pub fn deployment(name: &str, namespace: &str) -> Self {
        Self {
            kind: "deployment".to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Receipt for a successful apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedManifest {
    path: PathBuf,
}

impl AppliedManifest {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Default, Deserialize)]
struct WorkloadView {
    #[serde(default)]
    metadata: WorkloadMeta,
    #[serde(default)]
    spec: WorkloadSpec,
    #[serde(default)]
    status: WorkloadStatus,
}

#[derive(Debug, Default, Deserialize)]
struct WorkloadMeta {
    generation: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkloadSpec {
    replicas: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkloadStatus {
    observed_generation: Option<i64>,
    replicas: Option<i64>,
    updated_replicas: Option<i64>,
    ready_replicas: Option<i64>,
}

impl WorkloadView {
    /// Rollout complete in the sense of `kubectl rollout status`: the
    /// controller has seen the latest spec, every desired replica runs the
    /// new template, no old replica is left and all of them are ready.
    ///
    /// A workload scaled to zero never counts as ready.
    fn is_ready(&self) -> bool {
        let desired = self.spec.replicas.unwrap_or(1);
        if desired <= 0 {
            return false;
        }
        let status = &self.status;
        let generation = self.metadata.generation.unwrap_or(0);
        if status.observed_generation.unwrap_or(0) < generation {
            return false;
        }
        let updated = status.updated_replicas.unwrap_or(0);
        updated >= desired
            && status.replicas.unwrap_or(updated) <= updated
            && status.ready_replicas.unwrap_or(0) >= desired
    }
}

pub struct ManifestApplier {
    runner: Arc<dyn CommandRunner>,
    config: Arc<DeployConfig>,
}

impl ManifestApplier {
    pub fn new(runner: Arc<dyn CommandRunner>, config: Arc<DeployConfig>) -> Self {
        Self { runner, config }
    }

    /// `kubectl apply -f`. Re-applying an unchanged manifest is a no-op in
    /// the cluster.
    pub async fn apply(&self, manifest: &Path) -> Result<AppliedManifest> {
        let path = self.config.resolve(manifest);
        if !path.is_file() {
            return Err(DeployError::ApplyFailed {
                manifest: manifest.to_path_buf(),
                detail: "manifest not found".to_string(),
            });
        }

        info!(manifest = %manifest.display(), "Applying manifest");
        let output = self
            .runner
            .run(
                &CommandSpec::new("kubectl")
                    .args(["apply", "-f"])
                    .arg(path.to_string_lossy()),
            )
            .await?;
        if !output.success() {
            return Err(DeployError::ApplyFailed {
                manifest: manifest.to_path_buf(),
                detail: output.combined(),
            });
        }
        debug!(output = %output.stdout.trim(), "Manifest applied");
        Ok(AppliedManifest {
            path: manifest.to_path_buf(),
        })
    }

    /// Single readiness check.
    pub async fn is_ready(&self, resource: &ResourceRef) -> Result<bool> {
        let output = self
            .runner
            .run(&CommandSpec::new("kubectl").args([
                "get",
                resource.kind.as_str(),
                resource.name.as_str(),
                "-n",
                resource.namespace.as_str(),
                "-o",
                "json",
            ]))
            .await?;
        if !output.success() {
            debug!(resource = %resource, stderr = %output.stderr.trim(), "Resource not readable yet");
            return Ok(false);
        }
        // kubectl can exit 0 with a server error on stdout while the API
        // server is restarting; keep polling until the deadline.
        match serde_json::from_str::<WorkloadView>(&output.stdout) {
            Ok(view) => Ok(view.is_ready()),
            Err(e) => {
                debug!(
                    resource = %resource,
                    error = %e,
                    stdout = %output.stdout.trim(),
                    "Unreadable workload status"
                );
                Ok(false)
            }
        }
    }

    /// Poll until `resource` reports ready or `timeout` elapses.
    pub async fn wait_ready(
        &self,
        applied: &AppliedManifest,
        resource: &ResourceRef,
        timeout: Duration,
    ) -> Result<()> {
        let poll = self.config.timeouts.poll_interval();
        let deadline = Instant::now() + timeout;
        info!(
            resource = %resource,
            manifest = %applied.path().display(),
            timeout_secs = timeout.as_secs(),
            "Waiting for readiness"
        );

        loop {
            if self.is_ready(resource).await? {
                info!(resource = %resource, "Resource ready");
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DeployError::ReadyTimeout {
                    resource: resource.to_string(),
                    secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Recreate the pods of `resource` so they pick up a reloaded image.
    pub async fn restart_rollout(&self, resource: &ResourceRef) -> Result<()> {
        let target = resource.to_string();
        info!(resource = %target, "Restarting rollout");
        let output = self
            .runner
            .run(&CommandSpec::new("kubectl").args([
                "rollout",
                "restart",
                target.as_str(),
                "-n",
                resource.namespace.as_str(),
            ]))
            .await?;
        if !output.success() {
            return Err(DeployError::RolloutFailed {
                resource: target,
                detail: output.combined(),
            });
        }
        Ok(())
    }

    /// Configured deployments, in order.
    pub fn rollouts(&self) -> Vec<ResourceRef> {
        self.deployments(&self.config.manifests.rollouts)
    }

    /// Deployments running the application image. Only these need a
    /// restart after the image is reloaded.
    pub fn image_rollouts(&self) -> Vec<ResourceRef> {
        self.deployments(&self.config.manifests.image_rollouts)
    }

    fn deployments(&self, names: &[String]) -> Vec<ResourceRef> {
        let namespace = &self.config.manifests.namespace;
        names
            .iter()
            .map(|name| ResourceRef::deployment(name, namespace))
            .collect()
    }
}
