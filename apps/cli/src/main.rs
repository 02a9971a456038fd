//! civitdl CLI - batch downloader for Civitai models
//!
//! Enumerates models and versions from the Civitai API and downloads them
//! with resume, checksum verification and persistent bookkeeping.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// civitdl - Resumable batch downloader for Civitai
#[derive(Parser)]
#[command(name = "civitdl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for civitdl (config and state database)
    #[arg(long, env = "CIVITDL_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human", global = true)]
    output_format: OutputFormat,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download everything matching a selection
    Download(DownloadArgs),

    /// List tracked assets
    Status {
        /// Only show assets in this status (pending, in_progress, completed, failed, skipped)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// List permanently failed assets
    Failed,

    /// Give failed assets a fresh attempt budget
    RetryFailed,

    /// Show/update configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Args)]
struct DownloadArgs {
    /// Free-text search query
    #[arg(short, long)]
    query: Option<String>,

    /// Only models by this creator
    #[arg(short, long)]
    username: Option<String>,

    /// Only models with this tag
    #[arg(long)]
    tag: Option<String>,

    /// Model types (Checkpoint, LORA, ...)
    #[arg(long = "type")]
    types: Vec<String>,

    /// Base models (SD 1.5, SDXL 1.0, ...)
    #[arg(long = "base-model")]
    base_models: Vec<String>,

    /// Sort order passed to the API
    #[arg(long)]
    sort: Option<String>,

    /// Time period passed to the API
    #[arg(long)]
    period: Option<String>,

    /// Include NSFW models
    #[arg(long)]
    nsfw: bool,

    /// Model ids (every version unless --latest-only)
    #[arg(short, long = "model")]
    models: Vec<u64>,

    /// Model-version ids
    #[arg(long = "version")]
    versions: Vec<u64>,

    /// Only the newest version of each model
    #[arg(long)]
    latest_only: bool,

    /// Stop after this many assets
    #[arg(long)]
    max_items: Option<u64>,

    /// Number of parallel workers
    #[arg(short, long)]
    concurrency: Option<u32>,

    /// Global speed limit in bytes/sec
    #[arg(long)]
    speed_limit: Option<u64>,

    /// Destination root
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// API key
    #[arg(long, env = "CIVITAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("civitdl"))
            .unwrap_or_else(|| PathBuf::from(".civitdl"))
    });

    let format = cli.output_format;
    match cli.command {
        Commands::Download(args) => return commands::download(data_dir, args, format).await,

        Commands::Status { status } => commands::show_status(data_dir, status, format).await?,

        Commands::Failed => commands::list_failed(data_dir, format).await?,

        Commands::RetryFailed => commands::retry_failed(data_dir, format).await?,

        Commands::Config { action } => commands::config_action(data_dir, action, format).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "civitdl", &mut std::io::stdout());
        }
    }

    Ok(ExitCode::SUCCESS)
}
