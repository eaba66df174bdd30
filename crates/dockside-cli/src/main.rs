//! Dockside - local cluster deployment CLI
//!
//! The `dockside` command stands up the web + worker + broker stack on a
//! local minikube cluster and smoke-tests it.
//!
//! ## Commands
//!
//! - `deploy` (default): files, tools, cluster, image, manifests, smoke test
//! - `clean`: tear down cluster, image and local state
//! - `restart`: tear down, then start a fresh cluster
//! - `rebuild`: rebuild and reload the image, restart workloads
//! - `test`, `fastapi`, `redis`: smoke checks against a running deployment
//! - `portforward`: hold tunnels open until Ctrl-C

use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dockside_core::{init_tracing, DeployConfig, PipelineReport, SystemRunner};
use dockside_pipeline::{DeployPipeline, Platform};
use tracing::{debug, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "dockside")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deploy and smoke-test a task-queue stack on local minikube", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Directory holding the Dockerfile, sources and k8s/ manifests
    #[arg(long, global = true, env = "DOCKSIDE_PROJECT_DIR", default_value = ".")]
    project_dir: PathBuf,

    /// Configuration file (default: dockside.toml in the project directory)
    #[arg(long, global = true, env = "DOCKSIDE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the image reference (`name[:tag]`)
    #[arg(long, global = true, env = "DOCKSIDE_IMAGE")]
    image: Option<String>,

    /// Override the expected cluster context
    #[arg(long, global = true, env = "DOCKSIDE_CONTEXT")]
    context: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Full deployment (the default)
    Deploy,
    /// Remove containers, image, cluster and cluster state
    Clean,
    /// Clean, then start a fresh cluster
    Restart,
    /// Rebuild and reload the image, then restart the workloads
    Rebuild,
    /// Task round trip plus worker log against the running deployment
    Test,
    /// Forward the web and broker services until Ctrl-C
    Portforward,
    /// PING the broker through a tunnel
    Redis,
    /// Task round trip through the web service
    Fastapi,
}

impl Commands {
    fn name(self) -> &'static str {
        match self {
            Commands::Deploy => "deploy",
            Commands::Clean => "clean",
            Commands::Restart => "restart",
            Commands::Rebuild => "rebuild",
            Commands::Test => "test",
            Commands::Portforward => "portforward",
            Commands::Redis => "redis",
            Commands::Fastapi => "fastapi",
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = load_config(&cli)?;
    debug!(project_dir = %config.project_dir.display(), image = %config.image.reference(), "Configuration loaded");

    let command = cli.command.unwrap_or(Commands::Deploy);
    let pipeline = DeployPipeline::new(
        Arc::new(config),
        Arc::new(SystemRunner::new()),
        Platform::current(),
    );

    let report = match command {
        Commands::Deploy => pipeline.deploy(shutdown_signal()).await,
        Commands::Clean => pipeline.clean().await,
        Commands::Restart => pipeline.restart().await,
        Commands::Rebuild => pipeline.rebuild().await,
        Commands::Test => pipeline.test(shutdown_signal()).await,
        Commands::Portforward => pipeline.portforward(shutdown_signal()).await,
        Commands::Redis => pipeline.redis(shutdown_signal()).await,
        Commands::Fastapi => pipeline.fastapi(shutdown_signal()).await,
    };

    let exit_code = report.exit_code();
    print!("{}", render_report(command, report));
    Ok(ExitCode::from(exit_code))
}

/// File config, then flag/env overrides.
fn load_config(cli: &Cli) -> Result<DeployConfig> {
    let project_dir = cli
        .project_dir
        .canonicalize()
        .with_context(|| format!("Project directory {:?} is not accessible", cli.project_dir))?;
    let mut config = DeployConfig::load(&project_dir, cli.config.as_deref())
        .context("Failed to load configuration")?;

    if let Some(image) = &cli.image {
        config.image.set_reference(image);
    }
    if let Some(context) = &cli.context {
        config.cluster.context = context.clone();
    }
    config
        .validate()
        .context("Invalid configuration after overrides")?;
    Ok(config)
}

/// Resolves on Ctrl-C. Never resolves when the handler cannot be installed.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

fn render_report(command: Commands, report: PipelineReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(out, "Run ID: {}", report.run_id);
    let _ = writeln!(
        out,
        "Status: {} {}",
        command.name(),
        if report.success() { "✓ PASSED" } else { "✗ FAILED" }
    );
    let _ = writeln!(out, "Duration: {}ms", report.duration_ms);
    let _ = writeln!(out);

    for stage in &report.stages {
        let status = if stage.outcome.is_fatal() { "✗" } else { "✓" };
        let _ = writeln!(out, "  {} {} ({}ms)", status, stage.stage, stage.duration_ms);
    }

    let warnings: Vec<_> = report.warnings().collect();
    if !warnings.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Warnings:");
        for (stage, warning) in warnings {
            let _ = writeln!(out, "  - [{stage}] {warning}");
        }
    }

    if let Some(failure) = report.into_failure() {
        let _ = writeln!(out);
        let _ = writeln!(out, "✗ {failure}");
    }
    out
}
