//! External tool detection and installation.
//!
//! Every requirement is detected first. Installation only starts once the
//! full set of missing tools is known, so an unsupported platform fails
//! before anything is installed.

use std::fmt;
use std::sync::Arc;

use dockside_core::{CommandRunner, CommandSpec, DeployError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Host platform, as far as installation is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Linux,
    MacOs,
    Unsupported(String),
}

impl Platform {
    /// Platform of the running process.
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Self {
        match os {
            "linux" => Platform::Linux,
            "macos" => Platform::MacOs,
            other => Platform::Unsupported(other.to_string()),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Linux => f.write_str("linux"),
            Platform::MacOs => f.write_str("macos"),
            Platform::Unsupported(os) => f.write_str(os),
        }
    }
}

/// A tool the pipeline shells out to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRequirement {
    /// Tool name.
    pub name: String,

    /// Command that exits 0 when the tool is usable.
    pub detect: CommandSpec,

    /// Install commands on Linux, run in order.
    pub linux: Option<Vec<CommandSpec>>,

    /// Install commands on macOS, run in order.
    pub macos: Option<Vec<CommandSpec>>,

    /// Shown when the tool has to be installed by hand.
    pub hint: String,
}

impl ToolRequirement {
    pub fn install_commands(&self, platform: &Platform) -> Option<&[CommandSpec]> {
        match platform {
            Platform::Linux => self.linux.as_deref(),
            Platform::MacOs => self.macos.as_deref(),
            Platform::Unsupported(_) => None,
        }
    }

    /// Cluster runner.
    pub fn minikube() -> Self {
        let arch = linux_arch();
        Self {
            name: "minikube".to_string(),
            detect: CommandSpec::new("minikube").arg("version"),
            linux: Some(vec![
                CommandSpec::new("curl").args([
                    "-fsSLo".to_string(),
                    "/tmp/minikube".to_string(),
                    format!(
                        "https://storage.googleapis.com/minikube/releases/latest/minikube-linux-{arch}"
                    ),
                ]),
                CommandSpec::new("sudo").args(["install", "/tmp/minikube", "/usr/local/bin/minikube"]),
            ]),
            macos: Some(vec![CommandSpec::new("brew").args(["install", "minikube"])]),
            hint: "see https://minikube.sigs.k8s.io/docs/start/".to_string(),
        }
    }

    /// Cluster CLI.
    pub fn kubectl() -> Self {
        let arch = linux_arch();
        Self {
            name: "kubectl".to_string(),
            detect: CommandSpec::new("kubectl").args(["version", "--client"]),
            linux: Some(vec![
                CommandSpec::new("sh").args([
                    "-c".to_string(),
                    format!(
                        "curl -fsSLo /tmp/kubectl \"https://dl.k8s.io/release/$(curl -fsSL https://dl.k8s.io/release/stable.txt)/bin/linux/{arch}/kubectl\""
                    ),
                ]),
                CommandSpec::new("sudo").args([
                    "install", "-m", "0755", "/tmp/kubectl", "/usr/local/bin/kubectl",
                ]),
            ]),
            macos: Some(vec![CommandSpec::new("brew").args(["install", "kubectl"])]),
            hint: "see https://kubernetes.io/docs/tasks/tools/".to_string(),
        }
    }

    /// Container engine. Detected only; installing it needs a human.
    pub fn docker() -> Self {
        Self {
            name: "docker".to_string(),
            detect: CommandSpec::new("docker").arg("--version"),
            linux: None,
            macos: None,
            hint: "install Docker Engine or Docker Desktop and make sure the daemon is running"
                .to_string(),
        }
    }

    /// Tools a deploy needs.
    pub fn defaults() -> Vec<Self> {
        vec![Self::minikube(), Self::kubectl(), Self::docker()]
    }
}

fn linux_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        _ => "amd64",
    }
}

/// What the checker found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyReport {
    /// Tools that were already present.
    pub present: Vec<String>,

    /// Tools installed during this run.
    pub installed: Vec<String>,
}

/// Detects and installs [`ToolRequirement`]s.
pub struct DependencyChecker {
    runner: Arc<dyn CommandRunner>,
    platform: Platform,
    requirements: Vec<ToolRequirement>,
}

impl DependencyChecker {
    pub fn new(runner: Arc<dyn CommandRunner>, platform: Platform) -> Self {
        Self::with_requirements(runner, platform, ToolRequirement::defaults())
    }

    pub fn with_requirements(
        runner: Arc<dyn CommandRunner>,
        platform: Platform,
        requirements: Vec<ToolRequirement>,
    ) -> Self {
        Self {
            runner,
            platform,
            requirements,
        }
    }

    /// Whether `tool` responds to its detect command.
    pub async fn is_present(&self, tool: &ToolRequirement) -> bool {
        match self.runner.run(&tool.detect).await {
            Ok(output) => output.success(),
            Err(e) => {
                debug!(tool = %tool.name, error = %e, "Detect command failed");
                false
            }
        }
    }

    /// Confirm or install every requirement.
    pub async fn check_all(&self) -> Result<DependencyReport> {
        let mut report = DependencyReport::default();
        let mut missing = Vec::new();

        for tool in &self.requirements {
            if self.is_present(tool).await {
                debug!(tool = %tool.name, "Tool present");
                report.present.push(tool.name.clone());
            } else {
                warn!(tool = %tool.name, "Tool missing");
                missing.push(tool);
            }
        }

        if missing.is_empty() {
            return Ok(report);
        }

        if let Platform::Unsupported(os) = &self.platform {
            return Err(DeployError::UnsupportedPlatform {
                tool: missing[0].name.clone(),
                os: os.clone(),
            });
        }

        for tool in missing {
            self.install(tool).await?;
            report.installed.push(tool.name.clone());
        }
        Ok(report)
    }

    async fn install(&self, tool: &ToolRequirement) -> Result<()> {
        let commands =
            tool.install_commands(&self.platform)
                .ok_or_else(|| DeployError::ToolMissing {
                    tool: tool.name.clone(),
                    hint: tool.hint.clone(),
                })?;

        info!(tool = %tool.name, platform = %self.platform, "Installing tool");
        for cmd in commands {
            let output =
                self.runner
                    .run(cmd)
                    .await
                    .map_err(|e| DeployError::ToolInstallFailed {
                        tool: tool.name.clone(),
                        detail: e.to_string(),
                    })?;
            if !output.success() {
                return Err(DeployError::ToolInstallFailed {
                    tool: tool.name.clone(),
                    detail: format!(
                        "`{}` exited with code {}: {}",
                        cmd,
                        output.exit_code,
                        output.combined()
                    ),
                });
            }
        }

        if !self.is_present(tool).await {
            return Err(DeployError::ToolInstallFailed {
                tool: tool.name.clone(),
                detail: "installed but still not detected".to_string(),
            });
        }
        info!(tool = %tool.name, "Tool installed");
        Ok(())
    }
}
