/// Container Lifecycle - one execution unit from creation to removal
///
/// **Ordering guarantees:**
/// - limits, mounts and network isolation are set at creation, never retrofitted
/// - stdin is attached before start and half-closed right after start
/// - logs are read after termination and before removal
/// - removal is attempted before `run` returns, within `timeout + grace`;
///   past that deadline it continues in the background
///
/// Launch failures are reported once and never retried.

use crate::error::{Result, SandboxError};
use crate::runtime::{
    ContainerRuntime, UnitInfo, UnitSpec, OWNER_LABEL, PID_LABEL, REQUEST_LABEL, SANDBOX_LABEL,
};
use crate::supervisor::{with_retry, Supervised, TimeoutSupervisor};
use crate::workspace::process_alive;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Parameters of one run
#[derive(Debug, Clone)]
pub struct UnitJob<'a> {
    pub request_id: Uuid,
    pub command: &'a [String],
    pub workspace: &'a Path,
    pub cpu_limit: f64,
    pub memory_limit: u64,
    pub stdin: Option<&'a str>,
    pub timeout: Duration,
}

type InFlightSet = Arc<Mutex<HashSet<String>>>;

/// Marks a request id as in flight until dropped, so `sweep` leaves its unit alone
struct InFlight {
    set: InFlightSet,
    request_id: String,
}

impl InFlight {
    fn register(set: &InFlightSet, request_id: String) -> Self {
        set.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(request_id.clone());
        Self {
            set: Arc::clone(set),
            request_id,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.request_id);
    }
}

/// Container cleanup guard - guarantees container removal on drop.
///
/// The normal path calls [`UnitGuard::remove`]; the `Drop` impl fires when
/// that was skipped (panic, the caller dropping the future) or when removal
/// ran out of time.
struct UnitGuard {
    runtime: Arc<dyn ContainerRuntime>,
    container_id: String,
    removed: bool,
}

impl UnitGuard {
    fn new(runtime: Arc<dyn ContainerRuntime>, container_id: String) -> Self {
        Self {
            runtime,
            container_id,
            removed: false,
        }
    }

    /// Remove with bounded retries, giving up at `deadline`.
    /// `removed` is only set once the outcome is settled, so an interrupted
    /// or timed out removal is finished by `Drop`.
    async fn remove(mut self, attempts: u32, backoff: Duration, deadline: Instant) -> Result<()> {
        let runtime = Arc::clone(&self.runtime);
        let id = self.container_id.clone();

        let outcome = timeout_at(
            deadline,
            with_retry(attempts, backoff, "remove", || runtime.remove(&id)),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                self.removed = true;
                debug!(container_id = %id, "Unit removed");
                Ok(())
            }
            Ok(Err(e)) if e.is_not_found() => {
                self.removed = true;
                Ok(())
            }
            Ok(Err(e)) => {
                self.removed = true;
                Err(SandboxError::Cleanup(format!(
                    "container {} not removed: {}",
                    id, e
                )))
            }
            Err(_) => Err(SandboxError::Cleanup(format!(
                "container {} not removed within grace period, retrying in background",
                id
            ))),
        }
    }
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        if self.removed {
            return;
        }

        // Best-effort cleanup - cannot be async in Drop
        let container_id = self.container_id.clone();
        let runtime = Arc::clone(&self.runtime);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = runtime.remove(&container_id).await {
                        error!(container_id = %container_id, error = %e, alert = true, "Failed to cleanup abandoned container");
                    }
                });
            }
            Err(_) => {
                error!(container_id = %container_id, alert = true, "Container abandoned outside a tokio runtime");
            }
        }
    }
}

pub struct ContainerLifecycle {
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    mount_point: String,
    /// Value of [`OWNER_LABEL`] on every unit this lifecycle creates
    instance_id: String,
    in_flight: InFlightSet,
}

impl ContainerLifecycle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, image: impl Into<String>, mount_point: impl Into<String>) -> Self {
        Self {
            runtime,
            image: image.into(),
            mount_point: mount_point.into(),
            instance_id: Uuid::new_v4().to_string(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn unit_spec(&self, job: &UnitJob<'_>) -> UnitSpec {
        let mut labels = HashMap::new();
        labels.insert(SANDBOX_LABEL.to_string(), "true".to_string());
        labels.insert(REQUEST_LABEL.to_string(), job.request_id.to_string());
        labels.insert(OWNER_LABEL.to_string(), self.instance_id.clone());
        labels.insert(PID_LABEL.to_string(), std::process::id().to_string());

        UnitSpec {
            name: format!("tanuki-{}", job.request_id),
            image: self.image.clone(),
            command: job.command.to_vec(),
            workspace: job.workspace.to_path_buf(),
            mount_point: self.mount_point.clone(),
            nano_cpus: (job.cpu_limit * 1_000_000_000.0) as i64,
            memory_bytes: job.memory_limit as i64,
            open_stdin: job.stdin.is_some(),
            labels,
        }
    }

    /// Launch a unit, supervise it, collect its output and remove it.
    ///
    /// Returns `Err` only for launch failures; by then removal of any created
    /// unit has been attempted. Once started, every outcome is an `Ok`.
    pub async fn run(&self, supervisor: &TimeoutSupervisor, job: UnitJob<'_>) -> Result<Supervised> {
        let spec = self.unit_spec(&job);
        // Registered before the unit exists so a concurrent sweep never sees it unclaimed
        let _in_flight = InFlight::register(&self.in_flight, job.request_id.to_string());

        let container_id = self
            .runtime
            .create(&spec)
            .await
            .map_err(|e| SandboxError::Launch(format!("create failed: {}", e)))?;

        // CRITICAL: guard right after creation so no exit path leaks the unit
        let guard = UnitGuard::new(Arc::clone(&self.runtime), container_id.clone());
        debug!(container_id = %container_id, image = %self.image, "Unit created");

        let stdin = match job.stdin {
            Some(input) => match self.runtime.attach_stdin(&container_id).await {
                Ok(sink) => Some((sink, input.to_string())),
                Err(e) => {
                    let launch_error = SandboxError::Launch(format!("attach stdin failed: {}", e));
                    self.finish(guard, supervisor, Instant::now() + supervisor.grace()).await;
                    return Err(launch_error);
                }
            },
            None => None,
        };

        if let Err(e) = self.runtime.start(&container_id).await {
            let launch_error = SandboxError::Launch(format!("start failed: {}", e));
            drop(stdin);
            self.finish(guard, supervisor, Instant::now() + supervisor.grace()).await;
            return Err(launch_error);
        }

        let deadline = Instant::now() + job.timeout + supervisor.grace();
        let mut report = supervisor
            .supervise(&self.runtime, &container_id, stdin, job.timeout)
            .await;

        if let Some(note) = self.finish(guard, supervisor, deadline).await {
            report.diagnostics.push(note);
        }

        Ok(report)
    }

    /// Remove the unit; a failure is logged as a potential leak and returned as a note
    async fn finish(&self, guard: UnitGuard, supervisor: &TimeoutSupervisor, deadline: Instant) -> Option<String> {
        let container_id = guard.container_id.clone();
        match guard
            .remove(supervisor.attempts(), supervisor.backoff(), deadline)
            .await
        {
            Ok(()) => None,
            Err(e) => {
                error!(container_id = %container_id, error = %e, alert = true, "Execution unit leaked");
                Some(format!("[{}]", e))
            }
        }
    }

    /// A unit may be swept once nothing can still be using it: our own units
    /// when their request has finished, foreign ones when the creating
    /// process is gone.
    fn is_reclaimable(&self, unit: &UnitInfo) -> bool {
        if unit.labels.get(OWNER_LABEL) == Some(&self.instance_id) {
            return match unit.labels.get(REQUEST_LABEL) {
                Some(request_id) => !self
                    .in_flight
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .contains(request_id),
                None => true,
            };
        }

        match unit.labels.get(PID_LABEL).and_then(|pid| pid.parse::<u32>().ok()) {
            Some(pid) => !process_alive(pid),
            None => true,
        }
    }

    /// Remove labelled units nothing is using any more. Returns the count removed.
    pub async fn sweep(&self) -> Result<usize> {
        let units = self.runtime.list_units().await?;
        let mut removed = 0;
        for unit in units {
            if !self.is_reclaimable(&unit) {
                debug!(container_id = %unit.id, "Sweep skipped unit still in use");
                continue;
            }
            match self.runtime.remove(&unit.id).await {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(container_id = %unit.id, error = %e, "Failed to sweep container"),
            }
        }
        Ok(removed)
    }
}
