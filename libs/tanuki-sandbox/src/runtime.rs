/// Container Runtime - the seam between the engine and the container daemon
///
/// The lifecycle manager and supervisor only speak this trait, so the
/// execution flow (ordering, cleanup, timeout handling) can be exercised
/// without a Docker daemon. Production uses [`crate::docker::DockerRuntime`].

use crate::error::RuntimeError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncWrite;

/// Label carried by every execution unit the engine creates
pub const SANDBOX_LABEL: &str = "tanuki.sandbox";
/// Label holding the request id of the unit
pub const REQUEST_LABEL: &str = "tanuki.request";
/// Label holding the id of the engine instance that created the unit
pub const OWNER_LABEL: &str = "tanuki.owner";
/// Label holding the pid of the process that created the unit
pub const PID_LABEL: &str = "tanuki.pid";

pub type StdinSink = Pin<Box<dyn AsyncWrite + Send>>;

/// Everything needed to create one execution unit
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    /// Host directory bound read-only at `mount_point`
    pub workspace: PathBuf,
    pub mount_point: String,
    pub nano_cpus: i64,
    pub memory_bytes: i64,
    pub open_stdin: bool,
    pub labels: HashMap<String, String>,
}

/// Raw log streams of a finished unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A labelled unit as reported by the runtime
#[derive(Debug, Clone, Default)]
pub struct UnitInfo {
    pub id: String,
    pub labels: HashMap<String, String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    async fn build_image(
        &self,
        context: &Path,
        dockerfile: &Path,
        tag: &str,
        no_cache: bool,
    ) -> Result<(), RuntimeError>;

    /// Create (but do not start) a unit; returns its id
    async fn create(&self, spec: &UnitSpec) -> Result<String, RuntimeError>;

    /// Attach to the unit's standard input. Must be called before `start`.
    async fn attach_stdin(&self, id: &str) -> Result<StdinSink, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Wait until the unit stops; returns its exit code
    async fn wait(&self, id: &str) -> Result<i64, RuntimeError>;

    async fn logs(&self, id: &str) -> Result<RawOutput, RuntimeError>;

    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-remove the unit (kills it if still running)
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// All units carrying [`SANDBOX_LABEL`], running or not
    async fn list_units(&self) -> Result<Vec<UnitInfo>, RuntimeError>;
}
