//! Container image build and cluster load, each followed by a verification.
//!
//! Both the container engine and the cluster runner have been seen to exit 0
//! without producing the artifact, hence the explicit verify steps.

use std::sync::Arc;

use dockside_core::{CommandRunner, CommandSpec, DeployConfig, DeployError, Result};
use tracing::{debug, info};

pub struct ImageBuilder {
    runner: Arc<dyn CommandRunner>,
    config: Arc<DeployConfig>,
}

impl ImageBuilder {
    pub fn new(runner: Arc<dyn CommandRunner>, config: Arc<DeployConfig>) -> Self {
        Self { runner, config }
    }

    /// `name:tag` of the managed image.
    pub fn reference(&self) -> String {
        self.config.image.reference()
    }

    /// Build the image from the configured context.
    pub async fn build(&self) -> Result<()> {
        let image = self.reference();
        let context = self.config.resolve(&self.config.image.context);
        info!(image = %image, context = %context.display(), "Building image");

        let cmd = CommandSpec::new("docker")
            .args(["build", "-t", image.as_str()])
            .arg(context.to_string_lossy())
            .current_dir(&self.config.project_dir);
        let output = self.runner.run(&cmd).await?;
        if !output.success() {
            return Err(DeployError::BuildFailed {
                image,
                output: output.combined(),
            });
        }
        debug!(image = %image, duration_ms = output.duration_ms, "Image built");
        Ok(())
    }

    /// The image must be in the local image store.
    pub async fn verify_exists(&self) -> Result<()> {
        let image = self.reference();
        let output = self
            .runner
            .run(&CommandSpec::new("docker").args(["image", "inspect", image.as_str()]))
            .await?;
        if !output.success() {
            return Err(DeployError::ImageNotFound { image });
        }
        debug!(image = %image, "Image present locally");
        Ok(())
    }

    /// Push the image into the cluster's image store.
    pub async fn load(&self) -> Result<()> {
        let image = self.reference();
        info!(image = %image, "Loading image into cluster");
        let output = self
            .runner
            .run(&CommandSpec::new("minikube").args(["image", "load", image.as_str()]))
            .await?;
        if !output.success() {
            return Err(DeployError::ImageLoadFailed {
                image,
                detail: output.combined(),
            });
        }
        Ok(())
    }

    /// The image must be listed by the cluster.
    pub async fn verify_loaded(&self) -> Result<()> {
        let image = self.reference();
        let output = self
            .runner
            .run(&CommandSpec::new("minikube").args(["image", "ls"]))
            .await?;
        if !output.success() || !image_listed(&output.stdout, &image) {
            return Err(DeployError::LoadVerificationFailed { image });
        }
        debug!(image = %image, "Image visible in cluster");
        Ok(())
    }

    /// Build, verify, load, verify.
    pub async fn build_and_load(&self) -> Result<()> {
        self.build().await?;
        self.verify_exists().await?;
        self.load().await?;
        self.verify_loaded().await
    }
}

/// Whether `reference` appears in an image listing, verbatim or
/// registry-qualified (`docker.io/library/web:latest` matches `web:latest`).
pub fn image_listed(listing: &str, reference: &str) -> bool {
    let suffix = format!("/{reference}");
    listing
        .lines()
        .map(str::trim)
        .any(|line| line == reference || line.ends_with(&suffix))
}
