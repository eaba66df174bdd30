//! Stage outcomes and pipeline reports.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DeployError, DeployWarning, Result, StageFailure};

/// Stages a pipeline can run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Required-file check before anything touches the cluster.
    Preflight,
    /// External tool detection and installation.
    Dependencies,
    /// Cluster start and context check.
    Cluster,
    /// Image build, load and verification.
    Image,
    /// Manifest apply and readiness wait.
    Manifests,
    /// Tunnels, HTTP probes and log retrieval.
    Smoke,
    /// Destructive cluster teardown.
    Reset,
    /// Long-lived port forwards.
    Tunnels,
}

impl StageName {
    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            StageName::Preflight => "preflight",
            StageName::Dependencies => "dependencies",
            StageName::Cluster => "cluster",
            StageName::Image => "image",
            StageName::Manifests => "manifests",
            StageName::Smoke => "smoke",
            StageName::Reset => "reset",
            StageName::Tunnels => "tunnels",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tagged result of one stage. The orchestrator continues on
/// `Success`/`Warning` and halts on `Fatal`.
#[derive(Debug)]
pub enum StageOutcome {
    Success,
    Warning(Vec<DeployWarning>),
    Fatal(DeployError),
}

impl StageOutcome {
    /// Fold a stage function's result into an outcome.
    pub fn from_result(result: Result<Vec<DeployWarning>>) -> Self {
        match result {
            Ok(warnings) if warnings.is_empty() => StageOutcome::Success,
            Ok(warnings) => StageOutcome::Warning(warnings),
            Err(error) => StageOutcome::Fatal(error),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StageOutcome::Fatal(_))
    }

    pub fn warnings(&self) -> &[DeployWarning] {
        match self {
            StageOutcome::Warning(warnings) => warnings,
            _ => &[],
        }
    }
}

/// Result of a single stage execution.
#[derive(Debug)]
pub struct StageReport {
    /// Stage that ran.
    pub stage: StageName,

    /// What came of it.
    pub outcome: StageOutcome,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

/// Result of a complete pipeline execution.
#[derive(Debug)]
pub struct PipelineReport {
    /// Identifier carried on every log line of the run.
    pub run_id: Uuid,

    /// Wall-clock start of the run.
    pub started_at: DateTime<Utc>,

    /// Stages in execution order. Stages after a fatal one are absent.
    pub stages: Vec<StageReport>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl PipelineReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            stages: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Whether no stage ended fatally.
    pub fn success(&self) -> bool {
        !self.stages.iter().any(|s| s.outcome.is_fatal())
    }

    /// Process exit code: 0 on success (warnings allowed), 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.success() {
            0
        } else {
            1
        }
    }

    /// The fatal stage, if any.
    pub fn failure(&self) -> Option<(StageName, &DeployError)> {
        self.stages.iter().find_map(|s| match &s.outcome {
            StageOutcome::Fatal(error) => Some((s.stage, error)),
            _ => None,
        })
    }

    /// Consume the report, keeping only the fatal stage and its error.
    pub fn into_failure(self) -> Option<StageFailure> {
        self.stages.into_iter().find_map(|s| match s.outcome {
            StageOutcome::Fatal(error) => Some(StageFailure {
                stage: s.stage,
                error,
            }),
            _ => None,
        })
    }

    /// All warnings across stages, in order.
    pub fn warnings(&self) -> impl Iterator<Item = (StageName, &DeployWarning)> {
        self.stages
            .iter()
            .flat_map(|s| s.outcome.warnings().iter().map(move |w| (s.stage, w)))
    }

    /// Number of stages that ran.
    pub fn stages_run(&self) -> usize {
        self.stages.len()
    }

    pub fn ran(&self, stage: StageName) -> bool {
        self.stages.iter().any(|s| s.stage == stage)
    }
}
