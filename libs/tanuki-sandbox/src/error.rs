use thiserror::Error;

/// Failures of the container runtime API itself (daemon, socket, CLI)
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    /// True when the daemon reports that the container no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RuntimeError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            })
        )
    }
}

/// Errors surfaced by the sandbox engine.
///
/// Only the pre-launch variants (`UnsupportedLanguage`, `InvalidRequest`,
/// `Workspace`) escape [`crate::SandboxEngine::execute`]; everything that
/// happens after launch is folded into an `ExecutionResult`.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Workspace error: {context}: {source}")]
    Workspace {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch execution unit: {0}")]
    Launch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl SandboxError {
    pub fn workspace(context: impl Into<String>, source: std::io::Error) -> Self {
        SandboxError::Workspace {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;
