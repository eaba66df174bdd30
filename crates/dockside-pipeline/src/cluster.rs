//! Local cluster lifecycle: start, context check and destructive reset.

use std::sync::Arc;

use dockside_core::{CommandRunner, CommandSpec, DeployConfig, DeployError, DeployWarning, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Component status as reported by `minikube status -o json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterStatus {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Kubelet")]
    pub kubelet: String,
    #[serde(rename = "APIServer")]
    pub api_server: String,
}

impl ClusterStatus {
    pub fn running(&self) -> bool {
        self.host == "Running" && self.api_server == "Running"
    }
}

/// Drives the cluster runner and checks the cluster CLI context.
pub struct ClusterManager {
    runner: Arc<dyn CommandRunner>,
    config: Arc<DeployConfig>,
}

impl ClusterManager {
    pub fn new(runner: Arc<dyn CommandRunner>, config: Arc<DeployConfig>) -> Self {
        Self { runner, config }
    }

    /// Current status. Anything other than a parsable report counts as stopped.
    pub async fn status(&self) -> Result<ClusterStatus> {
        let output = self
            .runner
            .run(&CommandSpec::new("minikube").args(["status", "-o", "json"]))
            .await?;
        // minikube exits non-zero when stopped but still prints the report
        match serde_json::from_str::<ClusterStatus>(output.stdout.trim()) {
            Ok(status) => Ok(status),
            Err(e) => {
                debug!(error = %e, exit_code = output.exit_code, "Unreadable cluster status");
                Ok(ClusterStatus::default())
            }
        }
    }

    /// Start the cluster unless it is already running.
    ///
    /// Returns `true` when a start was issued. Never mutates a running cluster.
    pub async fn ensure_running(&self) -> Result<bool> {
        if self.status().await?.running() {
            info!("Cluster already running");
            return Ok(false);
        }

        let cluster = &self.config.cluster;
        let secs = self.config.timeouts.cluster_start_secs;
        info!(
            driver = %cluster.driver,
            memory = %cluster.memory,
            cpus = cluster.cpus,
            "Starting cluster"
        );
        let cmd = CommandSpec::new("minikube")
            .args([
                "start".to_string(),
                format!("--driver={}", cluster.driver),
                format!("--memory={}", cluster.memory),
                format!("--cpus={}", cluster.cpus),
            ])
            .timeout_secs(secs);

        let output = self.runner.run(&cmd).await.map_err(|e| match e {
            DeployError::CommandTimeout { .. } => DeployError::ClusterStartTimeout { secs },
            other => DeployError::ClusterStartFailed {
                detail: other.to_string(),
            },
        })?;
        if !output.success() {
            return Err(DeployError::ClusterStartFailed {
                detail: output.combined(),
            });
        }
        info!("Cluster started");
        Ok(true)
    }

    /// Fail unless the active context is the configured one.
    pub async fn ensure_context(&self) -> Result<()> {
        let expected = &self.config.cluster.context;
        let output = self
            .runner
            .run(&CommandSpec::new("kubectl").args(["config", "current-context"]))
            .await?;
        let actual = if output.success() {
            output.stdout.trim().to_string()
        } else {
            String::new()
        };

        if &actual != expected {
            return Err(DeployError::ContextMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        debug!(context = %actual, "Context verified");
        Ok(())
    }

    /// Tear everything down: containers and image built from the managed
    /// image, the cluster, and its local state directory. Optionally start
    /// a fresh cluster afterwards.
    ///
    /// Every removal step is best effort and reports a warning when it
    /// finds nothing; only the restart can fail.
    pub async fn reset(&self, restart: bool) -> Result<Vec<DeployWarning>> {
        let mut warnings = Vec::new();
        let image = self.config.image.reference();
        warn!(image = %image, "Resetting cluster and local state");

        self.remove_containers(&image, &mut warnings).await;
        self.best_effort(
            "remove image",
            CommandSpec::new("docker").args(["rmi", "-f", image.as_str()]),
            &mut warnings,
        )
        .await;
        self.best_effort(
            "stop cluster",
            CommandSpec::new("minikube").arg("stop"),
            &mut warnings,
        )
        .await;
        self.best_effort(
            "delete cluster",
            CommandSpec::new("minikube").arg("delete"),
            &mut warnings,
        )
        .await;
        self.remove_state_dir(&mut warnings);

        if restart {
            self.ensure_running().await?;
        }
        Ok(warnings)
    }

    async fn remove_containers(&self, image: &str, warnings: &mut Vec<DeployWarning>) {
        let list = CommandSpec::new("docker").args([
            "ps".to_string(),
            "-aq".to_string(),
            "--filter".to_string(),
            format!("ancestor={image}"),
        ]);
        let ids: Vec<String> = match self.runner.run(&list).await {
            Ok(output) if output.success() => output
                .stdout
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            Ok(output) => {
                warnings.push(cleanup_skipped("remove containers", output.combined()));
                return;
            }
            Err(e) => {
                warnings.push(cleanup_skipped("remove containers", e.to_string()));
                return;
            }
        };

        if ids.is_empty() {
            warnings.push(cleanup_skipped(
                "remove containers",
                format!("no containers from {image}"),
            ));
            return;
        }
        self.best_effort(
            "remove containers",
            CommandSpec::new("docker").args(["rm", "-f"]).args(ids),
            warnings,
        )
        .await;
    }

    async fn best_effort(&self, step: &str, cmd: CommandSpec, warnings: &mut Vec<DeployWarning>) {
        match self.runner.run(&cmd).await {
            Ok(output) if output.success() => debug!(step, "Cleanup step done"),
            Ok(output) => warnings.push(cleanup_skipped(step, output.combined())),
            Err(e) => warnings.push(cleanup_skipped(step, e.to_string())),
        }
    }

    fn remove_state_dir(&self, warnings: &mut Vec<DeployWarning>) {
        let step = "remove state directory";
        let Some(dir) = self.config.cluster.state_dir() else {
            warnings.push(cleanup_skipped(step, "no home directory".to_string()));
            return;
        };
        if !dir.exists() {
            warnings.push(cleanup_skipped(step, format!("{} not present", dir.display())));
            return;
        }
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => info!(path = %dir.display(), "Removed cluster state"),
            Err(e) => warnings.push(cleanup_skipped(step, e.to_string())),
        }
    }
}

fn cleanup_skipped(step: &str, detail: String) -> DeployWarning {
    let detail = if detail.is_empty() {
        "nothing to do".to_string()
    } else {
        detail
    };
    warn!(step, detail = %detail, "Cleanup step skipped");
    DeployWarning::CleanupSkipped {
        step: step.to_string(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockside_core::fakes::ScriptedRunner;
    use tempfile::tempdir;

    const RUNNING: &str = r#"{"Name":"minikube","Host":"Running","Kubelet":"Running","APIServer":"Running","Kubeconfig":"Configured","Worker":false}"#;
    const STOPPED: &str = r#"{"Name":"minikube","Host":"Stopped","Kubelet":"Stopped","APIServer":"Stopped","Kubeconfig":"Stopped","Worker":false}"#;

    fn manager(runner: &Arc<ScriptedRunner>, config: DeployConfig) -> ClusterManager {
        ClusterManager::new(runner.clone(), Arc::new(config))
    }

    #[tokio::test]
    async fn test_ensure_running_is_idempotent() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.ok("minikube status", RUNNING);
        let cluster = manager(&runner, DeployConfig::default());

        assert!(!cluster.ensure_running().await.unwrap());
        assert!(!cluster.ensure_running().await.unwrap());
        assert!(!runner.was_called("minikube start"));
        assert!(!runner.was_called("minikube stop"));
        assert!(!runner.was_called("minikube delete"));
    }

    #[tokio::test]
    async fn test_stopped_cluster_is_started_with_profile() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "minikube status",
            dockside_core::CommandOutput {
                exit_code: 7,
                stdout: STOPPED.to_string(),
                ..Default::default()
            },
        );
        let cluster = manager(&runner, DeployConfig::default());

        assert!(cluster.ensure_running().await.unwrap());
        assert!(runner.was_called("minikube start --driver=docker --memory=4096 --cpus=2"));
    }

    #[tokio::test]
    async fn test_start_failure_and_timeout_are_distinct() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("minikube status", 85, "");
        runner.fail("minikube start", 80, "GUEST_PROVISION");
        let err = manager(&runner, DeployConfig::default())
            .ensure_running()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cluster_start_failed");
        assert!(err.to_string().contains("GUEST_PROVISION"));

        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("minikube status", 85, "");
        runner.timeout("minikube start");
        let err = manager(&runner, DeployConfig::default())
            .ensure_running()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cluster_start_timeout");
    }

    #[tokio::test]
    async fn test_context_mismatch() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.ok("kubectl config current-context", "prod-eu\n");
        match manager(&runner, DeployConfig::default()).ensure_context().await {
            Err(DeployError::ContextMismatch { expected, actual }) => {
                assert_eq!(expected, "minikube");
                assert_eq!(actual, "prod-eu");
            }
            other => panic!("expected ContextMismatch, got {other:?}"),
        }

        let runner = Arc::new(ScriptedRunner::new());
        runner.ok("kubectl config current-context", "minikube\n");
        manager(&runner, DeployConfig::default())
            .ensure_context()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reset_removes_everything() {
        let state = tempdir().unwrap();
        let state_dir = state.path().join(".minikube");
        std::fs::create_dir_all(state_dir.join("machines")).unwrap();

        let mut config = DeployConfig::default();
        config.cluster.state_dir = Some(state_dir.clone());

        let runner = Arc::new(ScriptedRunner::new());
        runner.ok("docker ps -aq", "abc123\ndef456\n");
        let warnings = manager(&runner, config).reset(false).await.unwrap();

        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
        assert!(runner.was_called("docker rm -f abc123 def456"));
        assert!(runner.was_called("docker rmi -f fastapi-celery-app:latest"));
        assert!(runner.was_called("minikube stop"));
        assert!(runner.was_called("minikube delete"));
        assert!(!state_dir.exists());
        assert!(!runner.was_called("minikube start"));
    }

    #[tokio::test]
    async fn test_reset_with_nothing_to_remove_still_succeeds() {
        let state = tempdir().unwrap();
        let mut config = DeployConfig::default();
        config.cluster.state_dir = Some(state.path().join("absent"));

        let runner = Arc::new(ScriptedRunner::new());
        runner.ok("docker ps -aq", "");
        runner.fail("docker rmi", 1, "No such image");
        runner.fail("minikube stop", 85, "profile not found");
        runner.fail("minikube delete", 85, "profile not found");

        let warnings = manager(&runner, config).reset(false).await.unwrap();
        assert_eq!(warnings.len(), 5);
        assert!(warnings.iter().all(|w| w.kind() == "cleanup_skipped"));
        assert!(!runner.was_called("docker rm -f"));
    }

    #[tokio::test]
    async fn test_reset_with_restart_starts_cluster() {
        let state = tempdir().unwrap();
        let mut config = DeployConfig::default();
        config.cluster.state_dir = Some(state.path().join("absent"));

        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("minikube status", 85, "");
        manager(&runner, config).reset(true).await.unwrap();

        let calls = runner.calls();
        let delete = calls.iter().position(|c| c == "minikube delete").unwrap();
        let start = calls
            .iter()
            .position(|c| c.starts_with("minikube start"))
            .unwrap();
        assert!(delete < start);
    }
}
