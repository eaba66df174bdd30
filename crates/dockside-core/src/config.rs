//! Deployment configuration.
//!
//! A [`DeployConfig`] is built once per invocation (defaults, then an
//! optional `dockside.toml`, then CLI overrides) and handed to every stage
//! by reference. Nothing mutates it afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DeployError, Result};

/// File name looked up in the project directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "dockside.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeployConfig {
    /// Root against which every relative path is resolved.
    pub project_dir: PathBuf,

    /// Files that must exist before a full deploy starts.
    pub required_files: Vec<PathBuf>,

    pub image: ImageConfig,
    pub cluster: ClusterConfig,
    pub manifests: ManifestConfig,
    pub services: ServicesConfig,
    pub worker: WorkerConfig,
    pub smoke: SmokeConfig,
    pub timeouts: Timeouts,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            required_files: [
                "Dockerfile",
                "requirements.txt",
                "main.py",
                "config.py",
                ".env",
                "k8s/deployment.yaml",
                "k8s/services.yaml",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            image: ImageConfig::default(),
            cluster: ClusterConfig::default(),
            manifests: ManifestConfig::default(),
            services: ServicesConfig::default(),
            worker: WorkerConfig::default(),
            smoke: SmokeConfig::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl DeployConfig {
    /// Load configuration for `project_dir`.
    ///
    /// An explicit `config_path` must exist. Without one, `dockside.toml` in
    /// the project directory is used when present, defaults otherwise.
    pub fn load(project_dir: &Path, config_path: Option<&Path>) -> Result<Self> {
        let file = match config_path {
            Some(path) => {
                if !path.is_file() {
                    return Err(DeployError::Config(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                Some(path.to_path_buf())
            }
            None => {
                let candidate = project_dir.join(DEFAULT_CONFIG_FILE);
                candidate.is_file().then_some(candidate)
            }
        };

        let mut config = match file {
            Some(path) => {
                debug!(path = %path.display(), "Loading configuration file");
                let content = std::fs::read_to_string(&path)?;
                Self::from_toml(&content)?
            }
            None => Self::default(),
        };
        config.project_dir = project_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing keys fall back to defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| DeployError::Config(e.to_string()))
    }

    /// Resolve a path relative to the project directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    /// Reject values no stage can work with.
    pub fn validate(&self) -> Result<()> {
        if self.image.name.trim().is_empty() {
            return Err(DeployError::Config("image.name must not be empty".into()));
        }
        if self.image.tag.trim().is_empty() {
            return Err(DeployError::Config("image.tag must not be empty".into()));
        }
        if self.cluster.cpus == 0 {
            return Err(DeployError::Config("cluster.cpus must be positive".into()));
        }
        if self.cluster.context.trim().is_empty() {
            return Err(DeployError::Config(
                "cluster.context must not be empty".into(),
            ));
        }
        for endpoint in [&self.services.web, &self.services.broker] {
            if endpoint.local_port == 0 || endpoint.remote_port == 0 {
                return Err(DeployError::Config(format!(
                    "service {} needs non-zero ports",
                    endpoint.name
                )));
            }
        }
        if self.timeouts.poll_interval_ms == 0 {
            return Err(DeployError::Config(
                "timeouts.poll_interval_ms must be positive".into(),
            ));
        }
        if self.timeouts.request_secs == 0 {
            return Err(DeployError::Config(
                "timeouts.request_secs must be positive".into(),
            ));
        }
        if let Some(name) = self
            .manifests
            .image_rollouts
            .iter()
            .find(|name| !self.manifests.rollouts.contains(name))
        {
            return Err(DeployError::Config(format!(
                "manifests.image_rollouts entry {name} is not in manifests.rollouts"
            )));
        }
        Ok(())
    }
}

/// Container image to build and load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ImageConfig {
    pub name: String,
    pub tag: String,
    /// Build context, relative to the project directory.
    pub context: PathBuf,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            name: "fastapi-celery-app".to_string(),
            tag: "latest".to_string(),
            context: PathBuf::from("."),
        }
    }
}

impl ImageConfig {
    /// `name:tag` as passed to the container tools.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    /// Replace name and tag from a `name[:tag]` reference.
    ///
    /// A colon inside a registry host (`host:5000/app`) is not a tag separator.
    pub fn set_reference(&mut self, reference: &str) {
        let last_segment_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        match reference[last_segment_start..].rfind(':') {
            Some(i) => {
                let split = last_segment_start + i;
                self.name = reference[..split].to_string();
                self.tag = reference[split + 1..].to_string();
            }
            None => {
                self.name = reference.to_string();
                self.tag = "latest".to_string();
            }
        }
    }
}

/// Local cluster profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterConfig {
    pub driver: String,
    /// Memory as accepted by `minikube start --memory` (MiB or with unit).
    pub memory: String,
    pub cpus: u32,
    /// Expected kubectl context.
    pub context: String,
    /// Local state directory removed by `reset`. Defaults to `~/.minikube`.
    pub state_dir: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            driver: "docker".to_string(),
            memory: "4096".to_string(),
            cpus: 2,
            context: "minikube".to_string(),
            state_dir: None,
        }
    }
}

impl ClusterConfig {
    pub fn state_dir(&self) -> Option<PathBuf> {
        self.state_dir
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".minikube")))
    }
}

/// Manifests and the workloads they create.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ManifestConfig {
    pub namespace: String,
    pub deployment: PathBuf,
    pub services: PathBuf,
    /// Deployments created by `deployment`, waited on after apply.
    pub rollouts: Vec<String>,
    /// Subset of `rollouts` running the application image. `rebuild`
    /// restarts only these.
    pub image_rollouts: Vec<String>,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            deployment: PathBuf::from("k8s/deployment.yaml"),
            services: PathBuf::from("k8s/services.yaml"),
            rollouts: vec![
                "fastapi-app".to_string(),
                "celery-worker".to_string(),
                "redis".to_string(),
            ],
            image_rollouts: vec!["fastapi-app".to_string(), "celery-worker".to_string()],
        }
    }
}

/// A cluster service reachable through a port forward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub name: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl ServiceEndpoint {
    pub fn new(name: &str, local_port: u16, remote_port: u16) -> Self {
        Self {
            name: name.to_string(),
            local_port,
            remote_port,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServicesConfig {
    /// HTTP API service.
    pub web: ServiceEndpoint,
    /// Cache/broker service.
    pub broker: ServiceEndpoint,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            web: ServiceEndpoint::new("fastapi-service", 8000, 8000),
            broker: ServiceEndpoint::new("redis-service", 6379, 6379),
        }
    }
}

/// Where the worker writes its task log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Label selector for the worker pods.
    pub selector: String,
    pub container: String,
    /// Path of the log file inside the container.
    pub log_path: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            selector: "app=celery-worker".to_string(),
            container: "celery-worker".to_string(),
            log_path: "task.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SmokeConfig {
    /// Token sent to the task trigger endpoint.
    pub device_token: String,
}

impl Default for SmokeConfig {
    fn default() -> Self {
        Self {
            device_token: "test_device".to_string(),
        }
    }
}

/// Every bounded wait in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timeouts {
    pub cluster_start_secs: u64,
    pub ready_secs: u64,
    pub tunnel_probe_secs: u64,
    pub task_wait_secs: u64,
    pub request_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            cluster_start_secs: 300,
            ready_secs: 180,
            tunnel_probe_secs: 15,
            task_wait_secs: 30,
            request_secs: 10,
            poll_interval_ms: 1000,
        }
    }
}

impl Timeouts {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ready(&self) -> Duration {
        Duration::from_secs(self.ready_secs)
    }

    pub fn tunnel_probe(&self) -> Duration {
        Duration::from_secs(self.tunnel_probe_secs)
    }

    pub fn task_wait(&self) -> Duration {
        Duration::from_secs(self.task_wait_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }
}
