// Docker container runtime using Bollard
use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, RawOutput, StdinSink, UnitInfo, UnitSpec, SANDBOX_LABEL};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, KillContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Upper bound on processes inside one unit (fork bombs)
const PIDS_LIMIT: i64 = 256;

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn container_config(spec: &UnitSpec) -> Config<String> {
        Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(vec!["HOME=/tmp".to_string()]),
            working_dir: Some(spec.mount_point.clone()),
            labels: Some(spec.labels.clone()),
            network_disabled: Some(true), // SECURITY: No network access
            open_stdin: Some(spec.open_stdin),
            // Close stdin once the single attached client detaches, so the program sees EOF
            stdin_once: Some(spec.open_stdin),
            attach_stdin: Some(spec.open_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{}:ro",
                    spec.workspace.display(),
                    spec.mount_point
                )]),
                memory: Some(spec.memory_bytes),
                memory_swap: Some(spec.memory_bytes),
                nano_cpus: Some(spec.nano_cpus),
                network_mode: Some("none".to_string()),
                pids_limit: Some(PIDS_LIMIT),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                readonly_rootfs: Some(false), // Allow writes to /tmp for compilation
                auto_remove: Some(false),     // Logs are read before we remove it ourselves
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_image(
        &self,
        context: &Path,
        dockerfile: &Path,
        tag: &str,
        no_cache: bool,
    ) -> Result<(), RuntimeError> {
        let mut docker_args = vec![
            "build".to_string(),
            "-t".to_string(),
            tag.to_string(),
            "-f".to_string(),
            dockerfile.to_string_lossy().to_string(),
        ];

        if no_cache {
            docker_args.push("--no-cache".to_string());
        }

        // Build context goes last
        docker_args.push(context.to_string_lossy().to_string());

        info!(command = %format!("docker {}", docker_args.join(" ")), "Building runtime image");

        let status = Command::new("docker")
            .args(&docker_args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;

        if !status.success() {
            return Err(RuntimeError::Other(format!(
                "docker build for '{}' exited with {}",
                tag, status
            )));
        }

        Ok(())
    }

    async fn create(&self, spec: &UnitSpec) -> Result<String, RuntimeError> {
        let create_options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), Self::container_config(spec))
            .await?;

        for warning in &container.warnings {
            warn!(container_id = %container.id, warning = %warning, "Docker warning on create");
        }

        Ok(container.id)
    }

    async fn attach_stdin(&self, id: &str) -> Result<StdinSink, RuntimeError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stream: Some(true),
            ..Default::default()
        };

        let attached = self.docker.attach_container(id, Some(options)).await?;
        Ok(attached.input)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut wait_stream = self.docker.wait_container(id, Some(wait_options));
        match wait_stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Bollard reports a non-zero exit status as an error
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(RuntimeError::Other(format!(
                "no wait response from container {}",
                id
            ))),
        }
    }

    async fn logs(&self, id: &str) -> Result<RawOutput, RuntimeError> {
        let logs_options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        });

        let mut output = RawOutput::default();
        let mut logs_stream = self.docker.logs(id, logs_options);

        while let Some(chunk) = logs_stream.next().await {
            match chunk? {
                LogOutput::StdOut { message } => output.stdout.extend_from_slice(&message),
                LogOutput::StdErr { message } => output.stderr.extend_from_slice(&message),
                _ => {}
            }
        }

        Ok(output)
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // 409: container is not running any more
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                debug!(container_id = %id, "Kill skipped, container already stopped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let remove_options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.docker.remove_container(id, Some(remove_options)).await?;
        Ok(())
    }

    async fn list_units(&self) -> Result<Vec<UnitInfo>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", SANDBOX_LABEL)]);

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                c.id.map(|id| UnitInfo {
                    id,
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(open_stdin: bool) -> UnitSpec {
        UnitSpec {
            name: "tanuki-test".to_string(),
            image: "tanuki-sandbox:latest".to_string(),
            command: vec!["python3".to_string(), "main.py".to_string()],
            workspace: PathBuf::from("/tmp/tanuki-ws-1-abc"),
            mount_point: "/app".to_string(),
            nano_cpus: 500_000_000,
            memory_bytes: 128 * 1024 * 1024,
            open_stdin,
            labels: HashMap::from([(SANDBOX_LABEL.to_string(), "true".to_string())]),
        }
    }

    #[test]
    fn test_container_config_isolation() {
        let config = DockerRuntime::container_config(&spec(false));
        let host = config.host_config.unwrap();

        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.binds.unwrap(), vec!["/tmp/tanuki-ws-1-abc:/app:ro".to_string()]);
        assert_eq!(config.working_dir.as_deref(), Some("/app"));
        assert_eq!(host.memory, Some(128 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.auto_remove, Some(false));
        assert_eq!(config.open_stdin, Some(false));
    }

    #[test]
    fn test_container_config_with_stdin() {
        let config = DockerRuntime::container_config(&spec(true));
        assert_eq!(config.open_stdin, Some(true));
        assert_eq!(config.stdin_once, Some(true));
        assert_eq!(config.attach_stdin, Some(true));
    }
}
