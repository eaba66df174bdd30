//! Pipeline orchestration.
//!
//! Each public method is one CLI mode. Stages run strictly in order; the
//! first fatal outcome stops the run and later stages are not attempted.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dockside_core::{
    CommandRunner, DeployConfig, DeployWarning, PipelineReport, Result, StageName, StageOutcome,
    StageReport,
};
use tracing::{error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::cluster::ClusterManager;
use crate::deps::{DependencyChecker, Platform};
use crate::image::ImageBuilder;
use crate::manifest::ManifestApplier;
use crate::preflight::check_required_files;
use crate::smoke::{SmokeSuite, SmokeTester};

/// Collects stage reports for one run and logs each outcome.
struct RunRecorder {
    command: &'static str,
    started: Instant,
    report: PipelineReport,
}

impl RunRecorder {
    fn new(command: &'static str) -> Self {
        Self {
            command,
            started: Instant::now(),
            report: PipelineReport::new(Uuid::new_v4(), Utc::now()),
        }
    }

    fn span(&self) -> Span {
        info_span!("dockside.run", run_id = %self.report.run_id, command = self.command)
    }

    /// Run one stage. Returns whether the pipeline may continue.
    async fn stage<F>(&mut self, stage: StageName, work: F) -> bool
    where
        F: Future<Output = Result<Vec<DeployWarning>>>,
    {
        let started = Instant::now();
        info!(event = "stage.started", stage = %stage);
        let outcome = StageOutcome::from_result(work.await);
        let duration_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            StageOutcome::Success => {
                info!(event = "stage.passed", stage = %stage, duration_ms);
            }
            StageOutcome::Warning(warnings) => {
                for warning in warnings {
                    warn!(event = "stage.warning", stage = %stage, kind = warning.kind(), "{warning}");
                }
                info!(event = "stage.passed", stage = %stage, duration_ms, warnings = warnings.len());
            }
            StageOutcome::Fatal(e) => {
                error!(event = "stage.failed", stage = %stage, kind = e.kind(), duration_ms, "{e}");
            }
        }

        let proceed = !outcome.is_fatal();
        self.report.stages.push(StageReport {
            stage,
            outcome,
            duration_ms,
        });
        proceed
    }

    fn finish(mut self) -> PipelineReport {
        self.report.duration_ms = self.started.elapsed().as_millis() as u64;
        info!(
            event = "run.finished",
            command = self.command,
            duration_ms = self.report.duration_ms,
            success = self.report.success(),
        );
        self.report
    }
}

/// Sequences the deployment stages for each CLI mode.
pub struct DeployPipeline {
    config: Arc<DeployConfig>,
    runner: Arc<dyn CommandRunner>,
    platform: Platform,
}

impl DeployPipeline {
    pub fn new(config: Arc<DeployConfig>, runner: Arc<dyn CommandRunner>, platform: Platform) -> Self {
        Self {
            config,
            runner,
            platform,
        }
    }

    fn cluster(&self) -> ClusterManager {
        ClusterManager::new(self.runner.clone(), self.config.clone())
    }

    /// Full deploy: files, tools, cluster, image, manifests, smoke test.
    pub async fn deploy<S>(&self, shutdown: S) -> PipelineReport
    where
        S: Future<Output = ()>,
    {
        let mut run = RunRecorder::new("deploy");
        let span = run.span();
        async move {
            if !run.stage(StageName::Preflight, self.preflight()).await {
                return run.finish();
            }
            if !run.stage(StageName::Dependencies, self.dependencies()).await {
                return run.finish();
            }
            if !run.stage(StageName::Cluster, self.start_cluster()).await {
                return run.finish();
            }
            if !run.stage(StageName::Image, self.image()).await {
                return run.finish();
            }
            if !run.stage(StageName::Manifests, self.manifests(false)).await {
                return run.finish();
            }
            run.stage(StageName::Smoke, self.smoke(SmokeSuite::Full, shutdown))
                .await;
            run.finish()
        }
        .instrument(span)
        .await
    }

    /// Tear down cluster, image and local state.
    pub async fn clean(&self) -> PipelineReport {
        let mut run = RunRecorder::new("clean");
        let span = run.span();
        async move {
            run.stage(StageName::Reset, self.cluster().reset(false))
                .await;
            run.finish()
        }
        .instrument(span)
        .await
    }

    /// Tear down, start a fresh cluster and check its context.
    pub async fn restart(&self) -> PipelineReport {
        let mut run = RunRecorder::new("restart");
        let span = run.span();
        async move {
            if !run.stage(StageName::Reset, self.cluster().reset(true)).await {
                return run.finish();
            }
            run.stage(StageName::Cluster, self.check_context()).await;
            run.finish()
        }
        .instrument(span)
        .await
    }

    /// Rebuild and reload the image, then roll the workloads.
    pub async fn rebuild(&self) -> PipelineReport {
        let mut run = RunRecorder::new("rebuild");
        let span = run.span();
        async move {
            if !run.stage(StageName::Cluster, self.check_context()).await {
                return run.finish();
            }
            if !run.stage(StageName::Image, self.image()).await {
                return run.finish();
            }
            run.stage(StageName::Manifests, self.manifests(true)).await;
            run.finish()
        }
        .instrument(span)
        .await
    }

    /// Smoke test against an existing deployment.
    pub async fn test<S>(&self, shutdown: S) -> PipelineReport
    where
        S: Future<Output = ()>,
    {
        self.smoke_only("test", StageName::Smoke, SmokeSuite::Full, shutdown)
            .await
    }

    /// Task round trip through the web service only.
    pub async fn fastapi<S>(&self, shutdown: S) -> PipelineReport
    where
        S: Future<Output = ()>,
    {
        self.smoke_only("fastapi", StageName::Smoke, SmokeSuite::Api, shutdown)
            .await
    }

    /// PING the broker through a tunnel.
    pub async fn redis<S>(&self, shutdown: S) -> PipelineReport
    where
        S: Future<Output = ()>,
    {
        self.smoke_only("redis", StageName::Smoke, SmokeSuite::Broker, shutdown)
            .await
    }

    /// Hold web and broker tunnels open until `shutdown` resolves or a
    /// forward dies.
    pub async fn portforward<S>(&self, shutdown: S) -> PipelineReport
    where
        S: Future<Output = ()>,
    {
        self.smoke_only("portforward", StageName::Tunnels, SmokeSuite::Hold, shutdown)
            .await
    }

    async fn smoke_only<S>(
        &self,
        command: &'static str,
        stage: StageName,
        suite: SmokeSuite,
        shutdown: S,
    ) -> PipelineReport
    where
        S: Future<Output = ()>,
    {
        let mut run = RunRecorder::new(command);
        let span = run.span();
        async move {
            run.stage(stage, self.smoke(suite, shutdown)).await;
            run.finish()
        }
        .instrument(span)
        .await
    }

    // -- stages ------------------------------------------------------------

    async fn preflight(&self) -> Result<Vec<DeployWarning>> {
        check_required_files(&self.config)?;
        Ok(Vec::new())
    }

    async fn dependencies(&self) -> Result<Vec<DeployWarning>> {
        let report = DependencyChecker::new(self.runner.clone(), self.platform.clone())
            .check_all()
            .await?;
        info!(present = ?report.present, installed = ?report.installed, "Tools ready");
        Ok(Vec::new())
    }

    async fn start_cluster(&self) -> Result<Vec<DeployWarning>> {
        let cluster = self.cluster();
        cluster.ensure_running().await?;
        cluster.ensure_context().await?;
        Ok(Vec::new())
    }

    async fn check_context(&self) -> Result<Vec<DeployWarning>> {
        self.cluster().ensure_context().await?;
        Ok(Vec::new())
    }

    async fn image(&self) -> Result<Vec<DeployWarning>> {
        ImageBuilder::new(self.runner.clone(), self.config.clone())
            .build_and_load()
            .await?;
        Ok(Vec::new())
    }

    async fn manifests(&self, restart: bool) -> Result<Vec<DeployWarning>> {
        let applier = ManifestApplier::new(self.runner.clone(), self.config.clone());
        let manifests = &self.config.manifests;

        let deployment = applier.apply(&manifests.deployment).await?;
        applier.apply(&manifests.services).await?;

        let rollouts = applier.rollouts();
        if restart {
            for resource in &applier.image_rollouts() {
                applier.restart_rollout(resource).await?;
            }
        }
        for resource in &rollouts {
            applier
                .wait_ready(&deployment, resource, self.config.timeouts.ready())
                .await?;
        }
        Ok(Vec::new())
    }

    async fn smoke<S>(&self, suite: SmokeSuite, shutdown: S) -> Result<Vec<DeployWarning>>
    where
        S: Future<Output = ()>,
    {
        let tester = SmokeTester::new(self.runner.clone(), self.config.clone())?;
        let mut tunnels = tester.tunnels();
        tester.run(suite, &mut tunnels, shutdown).await
    }
}
