// Runtime image provisioning: verify the toolchain image, build it if missing
use crate::error::{Result, SandboxError};
use crate::runtime::ContainerRuntime;
use std::path::PathBuf;
use std::sync::Arc;
use tanuki_common::config::SandboxConfig;
use tracing::{debug, info, warn};

/// Builds or verifies the image once at startup. Not safe to run while
/// executions are in flight; callers serialize rebuilds themselves.
pub struct ImageProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    dockerfile: PathBuf,
    build_context: PathBuf,
}

impl ImageProvisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &SandboxConfig) -> Self {
        Self {
            runtime,
            image: config.image.clone(),
            dockerfile: config.dockerfile.clone(),
            build_context: config.build_context.clone(),
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Image cache health check: build only on a miss
    pub async fn ensure_image(&self) -> Result<()> {
        if self.runtime.image_exists(&self.image).await? {
            debug!(image = %self.image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %self.image, "Image cache miss, building now");
        self.build(false).await
    }

    /// Build the image unconditionally
    pub async fn build(&self, no_cache: bool) -> Result<()> {
        if !self.dockerfile.exists() {
            return Err(SandboxError::Config(format!(
                "Dockerfile not found at {}",
                self.dockerfile.display()
            )));
        }

        self.runtime
            .build_image(&self.build_context, &self.dockerfile, &self.image, no_cache)
            .await?;

        info!(image = %self.image, "Runtime image built");
        Ok(())
    }
}
