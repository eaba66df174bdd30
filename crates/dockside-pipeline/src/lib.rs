//! Dockside Pipeline - the deployment stages and their orchestration
//!
//! Provides:
//! - Preflight file checks and tool detection/installation
//! - Local cluster lifecycle and context verification
//! - Image build, load and verification
//! - Manifest application and readiness waits
//! - Tunnelled smoke tests against the deployed stack
//! - `DeployPipeline`, which sequences the above per CLI mode

pub mod cluster;
pub mod deps;
pub mod image;
pub mod manifest;
pub mod pipeline;
pub mod preflight;
pub mod smoke;

pub use cluster::{ClusterManager, ClusterStatus};
pub use deps::{DependencyChecker, DependencyReport, Platform, ToolRequirement};
pub use image::{image_listed, ImageBuilder};
pub use manifest::{AppliedManifest, ManifestApplier, ResourceRef};
pub use pipeline::DeployPipeline;
pub use preflight::check_required_files;
pub use smoke::{SmokeSuite, SmokeTester, TunnelSet, TunnelState};
