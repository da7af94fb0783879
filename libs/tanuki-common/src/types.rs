use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default CPU quota for a single execution, as a fraction of one core
pub const DEFAULT_CPU_LIMIT: f64 = 0.5;

/// Default memory ceiling for a single execution (128 MB)
pub const DEFAULT_MEMORY_LIMIT: u64 = 128 * 1024 * 1024;

/// Languages the sandbox image carries a toolchain for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Java,
    Cpp,
    Go,
    Rust,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::Python,
        Language::JavaScript,
        Language::Java,
        Language::Cpp,
        Language::Go,
        Language::Rust,
    ];

    /// Parse a caller-supplied identifier. Case-insensitive, accepts common aliases.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Some(Language::JavaScript),
            "java" => Some(Language::Java),
            "cpp" | "c++" | "cxx" => Some(Language::Cpp),
            "go" | "golang" => Some(Language::Go),
            "rust" | "rs" => Some(Language::Rust),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::Go => "go",
            Language::Rust => "rust",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single request to run untrusted code.
///
/// `language` is kept exactly as the caller sent it; the engine resolves it
/// against its registry so that unknown identifiers are rejected before any
/// resource is allocated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub language: String,
    pub source: String,
    #[serde(default)]
    pub stdin: Option<String>,
    /// Fraction of one core; `None` takes the engine's configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<f64>,
    /// Bytes; `None` takes the engine's configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u64>,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
}

impl ExecutionRequest {
    /// Build a request that uses the engine's default CPU and memory limits.
    /// The timeout has no default.
    pub fn new(language: impl Into<String>, source: impl Into<String>, timeout: Duration) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
            stdin: None,
            cpu_limit: None,
            memory_limit: None,
            timeout,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_cpu_limit(mut self, cpu_limit: f64) -> Self {
        self.cpu_limit = Some(cpu_limit);
        self
    }

    pub fn with_memory_limit(mut self, memory_limit: u64) -> Self {
        self.memory_limit = Some(memory_limit);
        self
    }
}

/// Captured behaviour of one execution.
///
/// Every field is always populated. When `timed_out` is set the exit code is
/// not meaningful and is reported as [`ExecutionResult::TIMEOUT_EXIT_CODE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub timed_out: bool,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    pub const TIMEOUT_EXIT_CODE: i64 = -1;
    pub const ENGINE_FAILURE_EXIT_CODE: i64 = 1;

    /// A result describing an engine-side failure (launch error, runtime API error)
    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Self::ENGINE_FAILURE_EXIT_CODE,
            timed_out: false,
            execution_time_ms: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Parse a human byte quantity such as `128m`, `1g`, `512k`, `64mb` or a
/// plain byte count.
pub fn parse_memory_limit(value: &str) -> Option<u64> {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        return None;
    }

    let digits_end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(digits_end);
    let number: u64 = number.parse().ok()?;

    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        _ => return None,
    };

    number.checked_mul(multiplier)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
