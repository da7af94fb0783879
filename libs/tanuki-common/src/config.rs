// Sandbox engine configuration
use crate::types::{parse_memory_limit, DEFAULT_CPU_LIMIT, DEFAULT_MEMORY_LIMIT};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_IMAGE: &str = "tanuki-sandbox:latest";
pub const DEFAULT_MOUNT_POINT: &str = "/app";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Runtime image carrying every language toolchain
    pub image: String,
    pub dockerfile: PathBuf,
    pub build_context: PathBuf,
    /// Parent directory for per-request workspaces
    pub workspace_root: PathBuf,
    /// Where the workspace is bound inside the container (read-only)
    pub mount_point: String,
    /// Extra time allowed after the deadline for forced cleanup
    pub grace_ms: u64,
    pub kill_attempts: u32,
    pub kill_backoff_ms: u64,
    pub default_cpu_limit: f64,
    pub default_memory_limit: u64,
    /// Optional languages.json overriding the built-in registry
    pub languages_file: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            dockerfile: PathBuf::from("docker/Dockerfile"),
            build_context: PathBuf::from("docker"),
            workspace_root: std::env::temp_dir(),
            mount_point: DEFAULT_MOUNT_POINT.to_string(),
            grace_ms: 5000,
            kill_attempts: 3,
            kill_backoff_ms: 250,
            default_cpu_limit: DEFAULT_CPU_LIMIT,
            default_memory_limit: DEFAULT_MEMORY_LIMIT,
            languages_file: None,
        }
    }
}

impl SandboxConfig {
    /// Defaults overridden by `TANUKI_*` environment variables.
    /// Unparseable numeric values fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(image) = lookup("TANUKI_IMAGE") {
            config.image = image;
        }
        if let Some(path) = lookup("TANUKI_DOCKERFILE") {
            config.dockerfile = PathBuf::from(path);
        }
        if let Some(path) = lookup("TANUKI_BUILD_CONTEXT") {
            config.build_context = PathBuf::from(path);
        }
        if let Some(path) = lookup("TANUKI_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(path);
        }
        if let Some(path) = lookup("TANUKI_LANGUAGES") {
            config.languages_file = Some(PathBuf::from(path));
        }
        if let Some(grace) = lookup("TANUKI_GRACE_MS").and_then(|v| v.parse().ok()) {
            config.grace_ms = grace;
        }
        if let Some(attempts) = lookup("TANUKI_KILL_ATTEMPTS").and_then(|v| v.parse().ok()) {
            config.kill_attempts = attempts;
        }
        if let Some(cpu) = lookup("TANUKI_DEFAULT_CPU").and_then(|v| v.parse::<f64>().ok()) {
            if cpu.is_finite() && cpu > 0.0 {
                config.default_cpu_limit = cpu;
            }
        }
        if let Some(memory) = lookup("TANUKI_DEFAULT_MEMORY").and_then(|v| parse_memory_limit(&v)) {
            config.default_memory_limit = memory;
        }

        config
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn kill_backoff(&self) -> Duration {
        Duration::from_millis(self.kill_backoff_ms)
    }
}
