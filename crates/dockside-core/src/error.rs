//! Error and warning taxonomy for Dockside.
//!
//! Two severities exist: a [`DeployError`] halts the pipeline at the stage
//! that produced it, a [`DeployWarning`] is logged and the pipeline continues.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::outcome::StageName;

/// Fatal deployment errors.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("required file missing: {}", path.display())]
    MissingFile { path: PathBuf },

    #[error("{tool} is not installed and platform '{os}' has no install procedure")]
    UnsupportedPlatform { tool: String, os: String },

    #[error("{tool} is not installed: {hint}")]
    ToolMissing { tool: String, hint: String },

    #[error("installing {tool} failed: {detail}")]
    ToolInstallFailed { tool: String, detail: String },

    #[error("cluster failed to start: {detail}")]
    ClusterStartFailed { detail: String },

    #[error("cluster did not start within {secs}s")]
    ClusterStartTimeout { secs: u64 },

    #[error("active context is '{actual}', expected '{expected}'")]
    ContextMismatch { expected: String, actual: String },

    #[error("building image {image} failed:\n{output}")]
    BuildFailed { image: String, output: String },

    #[error("image {image} not found in the local image store")]
    ImageNotFound { image: String },

    #[error("loading image {image} into the cluster failed: {detail}")]
    ImageLoadFailed { image: String, detail: String },

    #[error("image {image} is not visible in the cluster image store")]
    LoadVerificationFailed { image: String },

    #[error("applying {} failed: {detail}", manifest.display())]
    ApplyFailed { manifest: PathBuf, detail: String },

    #[error("{resource} not ready after {secs}s")]
    ReadyTimeout { resource: String, secs: u64 },

    #[error("rollout restart of {resource} failed: {detail}")]
    RolloutFailed { resource: String, detail: String },

    #[error("tunnel to {service} on local port {port} failed: {detail}")]
    TunnelFailed {
        service: String,
        port: u16,
        detail: String,
    },

    #[error("a tunnel to {service} on local port {port} is already open")]
    TunnelInUse { service: String, port: u16 },

    #[error("request to {url} failed: {detail}")]
    RequestFailed { url: String, detail: String },

    #[error("broker at {addr} did not answer PING: {detail}")]
    BrokerUnreachable { addr: String, detail: String },

    #[error("`{command}` timed out after {secs}s")]
    CommandTimeout { command: String, secs: u64 },

    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("interrupted")]
    Interrupted,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DeployError {
    /// Stable snake_case identifier used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingFile { .. } => "missing_file",
            Self::UnsupportedPlatform { .. } => "unsupported_platform",
            Self::ToolMissing { .. } => "tool_missing",
            Self::ToolInstallFailed { .. } => "tool_install_failed",
            Self::ClusterStartFailed { .. } => "cluster_start_failed",
            Self::ClusterStartTimeout { .. } => "cluster_start_timeout",
            Self::ContextMismatch { .. } => "context_mismatch",
            Self::BuildFailed { .. } => "build_failed",
            Self::ImageNotFound { .. } => "image_not_found",
            Self::ImageLoadFailed { .. } => "image_load_failed",
            Self::LoadVerificationFailed { .. } => "load_verification_failed",
            Self::ApplyFailed { .. } => "apply_failed",
            Self::ReadyTimeout { .. } => "ready_timeout",
            Self::RolloutFailed { .. } => "rollout_failed",
            Self::TunnelFailed { .. } => "tunnel_failed",
            Self::TunnelInUse { .. } => "tunnel_in_use",
            Self::RequestFailed { .. } => "request_failed",
            Self::BrokerUnreachable { .. } => "broker_unreachable",
            Self::CommandTimeout { .. } => "command_timeout",
            Self::Spawn { .. } => "spawn_failed",
            Self::Interrupted => "interrupted",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Whether the program could not be started because it does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// A fatal error tagged with the stage that produced it.
#[derive(Debug, thiserror::Error)]
#[error("stage '{stage}' failed: {error}")]
pub struct StageFailure {
    pub stage: StageName,
    #[source]
    pub error: DeployError,
}

/// Non-fatal findings. The pipeline logs them and keeps going.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeployWarning {
    /// A response body could not be parsed as JSON.
    MalformedResponse { url: String, detail: String },
    /// The trigger response carried no task identifier.
    MissingTaskId { url: String },
    /// The task did not reach SUCCESS in the wait window.
    TaskNotFinished { task_id: String, status: String },
    /// The task finished with a result other than the expected one.
    UnexpectedTaskResult {
        task_id: String,
        expected: String,
        actual: Option<String>,
    },
    /// Diagnostic log retrieval failed.
    LogUnavailable { target: String, detail: String },
    /// A best-effort cleanup step had nothing to act on or failed.
    CleanupSkipped { step: String, detail: String },
}

impl DeployWarning {
    /// Stable snake_case identifier used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedResponse { .. } => "malformed_response",
            Self::MissingTaskId { .. } => "missing_task_id",
            Self::TaskNotFinished { .. } => "task_not_finished",
            Self::UnexpectedTaskResult { .. } => "unexpected_task_result",
            Self::LogUnavailable { .. } => "log_unavailable",
            Self::CleanupSkipped { .. } => "cleanup_skipped",
        }
    }
}

impl fmt::Display for DeployWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedResponse { url, detail } => {
                write!(f, "response from {url} is not JSON: {detail}")
            }
            Self::MissingTaskId { url } => {
                write!(f, "response from {url} has no task_id, skipping status check")
            }
            Self::TaskNotFinished { task_id, status } => {
                write!(f, "task {task_id} still '{status}' at end of wait window")
            }
            Self::UnexpectedTaskResult {
                task_id,
                expected,
                actual,
            } => write!(
                f,
                "task {task_id} returned {:?}, expected {expected:?}",
                actual.as_deref().unwrap_or("null")
            ),
            Self::LogUnavailable { target, detail } => {
                write!(f, "could not read log from {target}: {detail}")
            }
            Self::CleanupSkipped { step, detail } => write!(f, "{step}: {detail}"),
        }
    }
}

/// Result type for Dockside operations.
pub type Result<T> = std::result::Result<T, DeployError>;
