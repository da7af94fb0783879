//! Sandboxed execution of untrusted programs in throwaway Docker containers.
//!
//! [`SandboxEngine::execute`] takes an [`ExecutionRequest`] and always hands
//! back an [`ExecutionResult`] once the program has been launched; only
//! requests rejected up front (unknown language, bad limits) produce an error.

pub mod container;
pub mod docker;
pub mod engine;
pub mod error;
pub mod provisioner;
pub mod registry;
pub mod runtime;
pub mod supervisor;
pub mod workspace;

#[cfg(test)]
mod mock_runtime;

pub use engine::SandboxEngine;
pub use error::{Result, RuntimeError, SandboxError};
pub use registry::{LanguageProfile, LanguageRegistry};
pub use tanuki_common::config::SandboxConfig;
pub use tanuki_common::types::{ExecutionRequest, ExecutionResult, Language};
