use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tanuki_common::config::SandboxConfig;
use tanuki_common::types::{parse_memory_limit, ExecutionRequest};
use tanuki_sandbox::docker::DockerRuntime;
use tanuki_sandbox::provisioner::ImageProvisioner;
use tanuki_sandbox::runtime::ContainerRuntime;
use tanuki_sandbox::{LanguageRegistry, SandboxEngine};

pub struct RunArgs {
    pub language: String,
    pub file: PathBuf,
    pub stdin: Option<String>,
    pub stdin_file: Option<PathBuf>,
    pub timeout_ms: u64,
    pub cpu: Option<f64>,
    pub memory: Option<String>,
}

fn load_registry(config: &SandboxConfig) -> Result<LanguageRegistry> {
    match &config.languages_file {
        Some(path) => LanguageRegistry::load(path),
        None => Ok(LanguageRegistry::builtin()),
    }
}

fn docker_runtime() -> Result<Arc<dyn ContainerRuntime>> {
    let runtime = DockerRuntime::connect()
        .context("Failed to connect to Docker. Is Docker installed and running?")?;
    Ok(Arc::new(runtime))
}

/// Build the sandbox image unconditionally
pub async fn build_image(config: &SandboxConfig, no_cache: bool) -> Result<()> {
    println!("🐳 Building sandbox image: {}", config.image);
    println!("📂 Build context: {}", config.build_context.display());
    println!("📄 Dockerfile: {}", config.dockerfile.display());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

    let provisioner = ImageProvisioner::new(docker_runtime()?, config);
    provisioner
        .build(no_cache)
        .await
        .context("Docker build failed")?;

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ Sandbox image built successfully!");
    Ok(())
}

/// Assemble a request from command line arguments. Unset limits are left to
/// the engine, which applies the configured defaults.
pub fn build_request(args: RunArgs) -> Result<ExecutionRequest> {
    let source = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;

    let stdin = match (args.stdin, args.stdin_file) {
        (Some(text), _) => Some(text),
        (None, Some(path)) => Some(
            std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
        ),
        (None, None) => None,
    };

    let memory_limit = match args.memory {
        Some(value) => match parse_memory_limit(&value) {
            Some(bytes) => Some(bytes),
            None => bail!("Invalid memory limit '{}' (expected e.g. 128m, 1g)", value),
        },
        None => None,
    };

    let mut request = ExecutionRequest::new(args.language, source, Duration::from_millis(args.timeout_ms));
    request.stdin = stdin;
    request.cpu_limit = args.cpu;
    request.memory_limit = memory_limit;

    Ok(request)
}

/// Execute one file and print the JSON result on stdout
pub async fn run(config: &SandboxConfig, args: RunArgs) -> Result<()> {
    let request = build_request(args)?;

    let engine = SandboxEngine::start(config)
        .await
        .context("Failed to start sandbox engine")?;
    let result = engine.execute(&request).await?;

    let json = serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
    println!("{}", json);
    Ok(())
}

/// List the languages the registry resolves
pub fn list_languages(config: &SandboxConfig) -> Result<()> {
    let registry = load_registry(config)?;
    let languages = registry.list_languages();

    println!("📋 Supported Languages:\n");
    println!("{:<12} {:<12} {}", "Language", "Source", "Command");
    println!("{}", "─".repeat(100));

    for language in &languages {
        let profile = registry.resolve(language.as_str())?;
        println!(
            "{:<12} {:<12} {}",
            language,
            profile.source_filename,
            profile.command.join(" ")
        );
    }

    println!("\n✅ Total: {} language(s)", languages.len());
    Ok(())
}

/// Remove leftover sandbox units and workspaces of dead processes
pub async fn sweep(config: &SandboxConfig) -> Result<()> {
    println!("🧹 Sweeping leftover sandbox resources...");

    let engine = SandboxEngine::new(docker_runtime()?, load_registry(config)?, config)?;
    let (units, workspaces) = engine.sweep().await?;

    println!("  - containers removed: {}", units);
    println!("  - workspaces removed: {}", workspaces);
    println!("✅ Sweep complete!");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(file: PathBuf) -> RunArgs {
        RunArgs {
            language: "python".to_string(),
            file,
            stdin: None,
            stdin_file: None,
            timeout_ms: 2000,
            cpu: None,
            memory: None,
        }
    }

    #[test]
    fn test_build_request_leaves_limits_to_engine() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.py");
        std::fs::write(&file, "print(input())").unwrap();

        let request = build_request(args(file)).unwrap();

        assert_eq!(request.source, "print(input())");
        assert_eq!(request.cpu_limit, None);
        assert_eq!(request.memory_limit, None);
        assert_eq!(request.timeout, Duration::from_millis(2000));
        assert!(request.stdin.is_none());
    }

    #[test]
    fn test_build_request_reads_stdin_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.py");
        let input = dir.path().join("input.txt");
        std::fs::write(&file, "print(input())").unwrap();
        std::fs::write(&input, "ping\n").unwrap();

        let mut run_args = args(file);
        run_args.stdin_file = Some(input);
        run_args.memory = Some("256m".to_string());
        run_args.cpu = Some(1.5);
        let request = build_request(run_args).unwrap();

        assert_eq!(request.stdin.as_deref(), Some("ping\n"));
        assert_eq!(request.cpu_limit, Some(1.5));
        assert_eq!(request.memory_limit, Some(256 * 1024 * 1024));
    }

    #[test]
    fn test_build_request_rejects_bad_memory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.py");
        std::fs::write(&file, "pass").unwrap();

        let mut run_args = args(file);
        run_args.memory = Some("lots".to_string());
        assert!(build_request(run_args).is_err());
    }

    #[test]
    fn test_missing_source_file() {
        let result = build_request(args(PathBuf::from("/nonexistent/main.py")));
        assert!(result.is_err());
    }
}
