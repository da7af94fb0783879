/// Execution Engine - public entry point of the sandbox
///
/// **Core Responsibility:**
/// Run one untrusted program and return a faithful capture of what it did.
///
/// **Flow per request:**
/// 1. Resolve the language profile and validate limits (fail fast, nothing allocated)
/// 2. Provision the workspace
/// 3. Launch the unit and run it under the timeout supervisor
/// 4. Normalize output bytes to text
/// 5. Release the workspace, on every path
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute
/// - Engine does NOT judge the program's output
/// - A non-zero exit or stderr output is a normal result, not an engine error

use crate::container::{ContainerLifecycle, UnitJob};
use crate::docker::DockerRuntime;
use crate::error::{Result, SandboxError};
use crate::provisioner::ImageProvisioner;
use crate::registry::LanguageRegistry;
use crate::runtime::ContainerRuntime;
use crate::supervisor::{Supervised, TimeoutSupervisor};
use crate::workspace::WorkspaceManager;
use std::sync::Arc;
use tanuki_common::config::SandboxConfig;
use tanuki_common::types::{ExecutionRequest, ExecutionResult};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Safety limits to prevent pathological inputs from reaching Docker
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_STDIN_BYTES: usize = 10 * 1024 * 1024; // 10MB
/// Docker refuses memory limits below 6MB
pub const MIN_MEMORY_BYTES: u64 = 6 * 1024 * 1024;

pub struct SandboxEngine {
    registry: LanguageRegistry,
    workspaces: WorkspaceManager,
    lifecycle: ContainerLifecycle,
    supervisor: TimeoutSupervisor,
    provisioner: ImageProvisioner,
    runtime: Arc<dyn ContainerRuntime>,
    /// Applied when a request leaves `cpu_limit` unset
    default_cpu_limit: f64,
    /// Applied when a request leaves `memory_limit` unset
    default_memory_limit: u64,
}

impl SandboxEngine {
    /// Assemble an engine over any container runtime. Does not touch the image.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: LanguageRegistry,
        config: &SandboxConfig,
    ) -> Result<Self> {
        Ok(Self {
            registry,
            workspaces: WorkspaceManager::new(&config.workspace_root)?,
            lifecycle: ContainerLifecycle::new(
                Arc::clone(&runtime),
                config.image.clone(),
                config.mount_point.clone(),
            ),
            supervisor: TimeoutSupervisor::from_config(config),
            provisioner: ImageProvisioner::new(Arc::clone(&runtime), config),
            runtime,
            default_cpu_limit: config.default_cpu_limit,
            default_memory_limit: config.default_memory_limit,
        })
    }

    /// Connect to the local Docker daemon, load the registry and make sure
    /// the runtime image exists. Call once at process start.
    pub async fn start(config: &SandboxConfig) -> Result<Self> {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);

        let registry = match &config.languages_file {
            Some(path) => LanguageRegistry::load(path).map_err(|e| SandboxError::Config(format!("{:#}", e)))?,
            None => LanguageRegistry::builtin(),
        };

        let engine = Self::new(runtime, registry, config)?;
        engine.provisioner.ensure_image().await?;

        info!(
            image = %engine.provisioner.image(),
            languages = ?engine.registry.list_languages(),
            "Sandbox engine ready"
        );
        Ok(engine)
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn provisioner(&self) -> &ImageProvisioner {
        &self.provisioner
    }

    /// Ids of sandbox units currently known to the container runtime
    pub async fn active_units(&self) -> Result<Vec<String>> {
        let units = self.runtime.list_units().await?;
        Ok(units.into_iter().map(|unit| unit.id).collect())
    }

    /// Remove leftover units and stale workspaces from earlier processes.
    /// Returns `(units_removed, workspaces_removed)`.
    pub async fn sweep(&self) -> Result<(usize, usize)> {
        let units = self.lifecycle.sweep().await?;
        let workspaces = self.workspaces.sweep_stale();
        Ok((units, workspaces))
    }

    /// Limits for `request`, falling back to the configured defaults
    fn resolve_limits(&self, request: &ExecutionRequest) -> (f64, u64) {
        (
            request.cpu_limit.unwrap_or(self.default_cpu_limit),
            request.memory_limit.unwrap_or(self.default_memory_limit),
        )
    }

    fn validate(request: &ExecutionRequest, cpu_limit: f64, memory_limit: u64) -> Result<()> {
        if !cpu_limit.is_finite() || cpu_limit <= 0.0 {
            return Err(SandboxError::InvalidRequest(format!(
                "cpu_limit must be a positive fraction of a core, got {}",
                cpu_limit
            )));
        }
        if memory_limit < MIN_MEMORY_BYTES {
            return Err(SandboxError::InvalidRequest(format!(
                "memory_limit must be at least {} bytes, got {}",
                MIN_MEMORY_BYTES, memory_limit
            )));
        }
        if request.timeout.is_zero() {
            return Err(SandboxError::InvalidRequest("timeout must be greater than zero".to_string()));
        }
        if request.source.len() > MAX_SOURCE_CODE_BYTES {
            return Err(SandboxError::InvalidRequest(format!(
                "Source code exceeds maximum size of {} bytes",
                MAX_SOURCE_CODE_BYTES
            )));
        }
        if request.stdin.as_ref().map_or(false, |s| s.len() > MAX_STDIN_BYTES) {
            return Err(SandboxError::InvalidRequest(format!(
                "Stdin exceeds maximum size of {} bytes",
                MAX_STDIN_BYTES
            )));
        }
        Ok(())
    }

    /// Execute one request.
    ///
    /// `Err` is returned only before anything is launched (unsupported
    /// language, invalid limits, workspace provisioning). Everything after
    /// that, including launch failures, comes back as an `ExecutionResult`.
    #[tracing::instrument(
        skip(self, request),
        fields(
            request_id = tracing::field::Empty,
            language = %request.language,
            timeout_ms = request.timeout.as_millis() as u64,
            source_size = request.source.len()
        )
    )]
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let profile = self.registry.resolve(&request.language)?;
        let (cpu_limit, memory_limit) = self.resolve_limits(request);
        Self::validate(request, cpu_limit, memory_limit)?;

        let request_id = Uuid::new_v4();
        tracing::Span::current().record("request_id", tracing::field::display(request_id));

        let workspace = self
            .workspaces
            .provision(&request.source, &profile.source_filename)
            .await?;

        // `workspace` removes itself on drop if this future is abandoned below
        let job = UnitJob {
            request_id,
            command: &profile.command,
            workspace: workspace.path(),
            cpu_limit,
            memory_limit,
            stdin: request.stdin.as_deref(),
            timeout: request.timeout,
        };

        let result = match self.lifecycle.run(&self.supervisor, job).await {
            Ok(report) => assemble_result(report),
            Err(e) => {
                warn!(error = %e, "Launch failed");
                ExecutionResult::failure(e.to_string())
            }
        };

        if let Err(e) = workspace.release() {
            error!(error = %e, alert = true, "Workspace leaked");
        }

        info!(
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            execution_ms = result.execution_time_ms,
            stdout_bytes = result.stdout.len(),
            stderr_bytes = result.stderr.len(),
            "Execution completed"
        );

        Ok(result)
    }
}

/// Turn a supervised run into the caller-facing result.
///
/// The program's stderr comes first and is only decoded and trimmed. Engine
/// notes (timeout marker, kill annotations, cleanup trouble) follow it, one
/// per line.
fn assemble_result(report: Supervised) -> ExecutionResult {
    let stdout = String::from_utf8_lossy(&report.output.stdout).trim().to_string();

    let mut stderr_parts: Vec<String> = Vec::new();
    let program_stderr = String::from_utf8_lossy(&report.output.stderr);
    if !program_stderr.trim().is_empty() {
        stderr_parts.push(program_stderr.trim().to_string());
    }

    let exit_code = if report.timed_out {
        stderr_parts.push("Execution timed out.".to_string());
        ExecutionResult::TIMEOUT_EXIT_CODE
    } else {
        match report.exit_code {
            Some(137) => {
                stderr_parts.push("[Container killed: likely OOM or exceeded memory limit]".to_string());
                137
            }
            Some(139) => {
                stderr_parts.push("[Container killed: segmentation fault]".to_string());
                139
            }
            Some(code) => code,
            None => ExecutionResult::ENGINE_FAILURE_EXIT_CODE,
        }
    };

    stderr_parts.extend(report.diagnostics);

    ExecutionResult {
        stdout,
        stderr: stderr_parts.join("\n"),
        exit_code,
        timed_out: report.timed_out,
        execution_time_ms: report.elapsed.as_millis() as u64,
    }
}
