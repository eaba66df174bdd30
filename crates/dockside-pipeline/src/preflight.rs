//! Required-file gate run before any cluster or image operation.

use dockside_core::{DeployConfig, DeployError, Result};
use tracing::debug;

/// Fail with the first required file that does not exist.
pub fn check_required_files(config: &DeployConfig) -> Result<()> {
    for file in &config.required_files {
        let path = config.resolve(file);
        if !path.is_file() {
            return Err(DeployError::MissingFile { path: file.clone() });
        }
        debug!(path = %path.display(), "Required file present");
    }
    Ok(())
}
