/// Timeout Supervisor - races a running unit against its deadline
///
/// The stdin feed and the wait for termination run on their own tokio task.
/// If the deadline passes first the task is aborted and the unit is killed
/// from the outside; nothing is ever signalled to the program itself.
///
/// Kill policy: up to `kill_attempts` kills with linear backoff, then the
/// termination is awaited for at most the grace period. Whatever happens,
/// the caller gets control back within `timeout + grace` (plus removal).

use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, RawOutput, StdinSink};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tanuki_common::config::SandboxConfig;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout_at;
use tracing::{debug, error, warn};

/// What the supervisor observed about one unit
#[derive(Debug, Default)]
pub struct Supervised {
    /// `None` when no exit status could be obtained
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub output: RawOutput,
    pub elapsed: Duration,
    /// Engine-side notes (wait/log failures, kill trouble) for stderr
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TimeoutSupervisor {
    grace: Duration,
    kill_attempts: u32,
    kill_backoff: Duration,
}

impl TimeoutSupervisor {
    pub fn new(grace: Duration, kill_attempts: u32, kill_backoff: Duration) -> Self {
        Self {
            grace,
            kill_attempts: kill_attempts.max(1),
            kill_backoff,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(config.grace(), config.kill_attempts, config.kill_backoff())
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn attempts(&self) -> u32 {
        self.kill_attempts
    }

    pub fn backoff(&self) -> Duration {
        self.kill_backoff
    }

    /// Feed stdin, wait for the unit under `timeout`, then collect its logs.
    /// Does not remove the unit.
    #[tracing::instrument(skip(self, runtime, stdin), fields(timeout_ms = timeout.as_millis() as u64))]
    pub async fn supervise(
        &self,
        runtime: &Arc<dyn ContainerRuntime>,
        container_id: &str,
        stdin: Option<(StdinSink, String)>,
        timeout: Duration,
    ) -> Supervised {
        let start_time = Instant::now();
        let mut report = Supervised::default();

        let task_runtime = Arc::clone(runtime);
        let task_id = container_id.to_string();
        let mut run_task = tokio::spawn(async move {
            if let Some((mut sink, input)) = stdin {
                // The program may exit without reading; a closed pipe is not an error here
                if let Err(e) = feed_stdin(&mut sink, &input).await {
                    debug!(container_id = %task_id, error = %e, "Stdin feed ended early");
                }
            }
            task_runtime.wait(&task_id).await
        });

        match tokio::time::timeout(timeout, &mut run_task).await {
            Ok(Ok(Ok(code))) => {
                debug!(container_id = %container_id, exit_code = code, "Unit exited");
                report.exit_code = Some(code);
            }
            Ok(Ok(Err(e))) => {
                warn!(container_id = %container_id, error = %e, "Failed to wait for unit");
                report.diagnostics.push(format!("[Failed to wait for execution unit: {}]", e));
            }
            Ok(Err(join_error)) => {
                error!(container_id = %container_id, error = %join_error, "Supervised task failed");
                report.diagnostics.push(format!("[Supervised task failed: {}]", join_error));
            }
            Err(_) => {
                report.timed_out = true;
                run_task.abort();
                warn!(
                    container_id = %container_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Execution timed out - killing unit"
                );
            }
        }
        report.elapsed = start_time.elapsed();

        let grace_deadline = tokio::time::Instant::now() + self.grace;

        if report.exit_code.is_none() {
            if let Err(e) = self.force_terminate(runtime, container_id, grace_deadline).await {
                error!(
                    container_id = %container_id,
                    error = %e,
                    alert = true,
                    "Unit did not acknowledge forced termination"
                );
                report.diagnostics.push(format!("[Failed to kill execution unit: {}]", e));
            }
        }

        // Logs strictly before removal, which the caller performs afterwards
        match timeout_at(grace_deadline, runtime.logs(container_id)).await {
            Ok(Ok(output)) => report.output = output,
            Ok(Err(e)) => {
                warn!(container_id = %container_id, error = %e, "Failed to read unit logs");
                report.diagnostics.push(format!("[Failed to read output: {}]", e));
            }
            Err(_) => {
                warn!(container_id = %container_id, "Reading unit logs exceeded grace period");
                report.diagnostics.push("[Output retrieval timed out]".to_string());
            }
        }

        report
    }

    /// Kill with bounded retries, then wait for the unit to actually stop
    async fn force_terminate(
        &self,
        runtime: &Arc<dyn ContainerRuntime>,
        container_id: &str,
        deadline: tokio::time::Instant,
    ) -> Result<(), RuntimeError> {
        let killed = timeout_at(
            deadline,
            with_retry(self.kill_attempts, self.kill_backoff, "kill", || {
                runtime.kill(container_id)
            }),
        )
        .await;

        match killed {
            Ok(result) => result?,
            Err(_) => return Err(RuntimeError::Other("kill exceeded grace period".to_string())),
        }

        match timeout_at(deadline, runtime.wait(container_id)).await {
            Ok(Ok(code)) => {
                debug!(container_id = %container_id, exit_code = code, "Unit terminated after kill");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RuntimeError::Other(
                "unit still running after kill and grace period".to_string(),
            )),
        }
    }
}

async fn feed_stdin(sink: &mut StdinSink, input: &str) -> std::io::Result<()> {
    sink.write_all(input.as_bytes()).await?;
    sink.flush().await?;
    // Half-close: the program sees end-of-input
    sink.shutdown().await
}

/// Run `op` up to `attempts` times, sleeping `backoff * attempt` between tries
pub(crate) async fn with_retry<T, F, Fut>(
    attempts: u32,
    backoff: Duration,
    what: &str,
    mut op: F,
) -> Result<T, RuntimeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(operation = what, attempt, error = %e, "Container operation failed, retrying");
                tokio::time::sleep(backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
