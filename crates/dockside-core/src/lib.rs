//! Dockside Core - shared building blocks for the deployment pipeline
//!
//! Provides:
//! - `DeployConfig`, the immutable configuration every stage receives
//! - `DeployError` / `DeployWarning`, the two severities of the pipeline
//! - `StageOutcome` and `PipelineReport`, the tagged per-stage results
//! - `CommandRunner`, the seam to the container engine and cluster tools

pub mod command;
pub mod config;
pub mod error;
pub mod fakes;
pub mod outcome;
pub mod telemetry;

// Re-export key types
pub use command::{BackgroundProcess, CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use config::{
    ClusterConfig, DeployConfig, ImageConfig, ManifestConfig, ServiceEndpoint, ServicesConfig,
    SmokeConfig, Timeouts, WorkerConfig,
};
pub use error::{DeployError, DeployWarning, Result, StageFailure};
pub use outcome::{PipelineReport, StageName, StageOutcome, StageReport};
pub use telemetry::init_tracing;
