mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tanuki-cli")]
#[command(about = "Tanuki CLI - Run untrusted code in throwaway sandbox containers", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the sandbox runtime image
    BuildImage {
        /// Skip build cache
        #[arg(long, default_value = "false")]
        no_cache: bool,
    },

    /// Execute a source file inside the sandbox and print the result as JSON
    Run {
        /// Language identifier (python, javascript, java, cpp, go, rust)
        #[arg(short, long)]
        language: String,

        /// Source file to execute
        #[arg(short, long)]
        file: PathBuf,

        /// Text fed to the program's standard input
        #[arg(long, conflicts_with = "stdin_file")]
        stdin: Option<String>,

        /// File whose contents are fed to standard input
        #[arg(long)]
        stdin_file: Option<PathBuf>,

        /// Wall-clock limit in milliseconds
        #[arg(short, long, default_value = "10000")]
        timeout_ms: u64,

        /// CPU limit as a fraction of one core (defaults to TANUKI_DEFAULT_CPU)
        #[arg(long)]
        cpu: Option<f64>,

        /// Memory limit such as 128m or 1g (defaults to TANUKI_DEFAULT_MEMORY)
        #[arg(short, long)]
        memory: Option<String>,
    },

    /// List supported languages
    Languages,

    /// Remove leftover sandbox containers and stale workspaces
    Sweep,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Logs go to stderr so `run` keeps stdout for the JSON result
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = tanuki_common::config::SandboxConfig::from_env();

    match cli.command {
        Commands::BuildImage { no_cache } => {
            commands::build_image(&config, no_cache).await?;
        }
        Commands::Run {
            language,
            file,
            stdin,
            stdin_file,
            timeout_ms,
            cpu,
            memory,
        } => {
            let args = commands::RunArgs {
                language,
                file,
                stdin,
                stdin_file,
                timeout_ms,
                cpu,
                memory,
            };
            commands::run(&config, args).await?;
        }
        Commands::Languages => {
            commands::list_languages(&config)?;
        }
        Commands::Sweep => {
            commands::sweep(&config).await?;
        }
    }

    Ok(())
}
