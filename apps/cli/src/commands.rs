//! CLI command implementations

use crate::output::{format_bytes, format_duration, print_output};
use crate::progress::DownloadProgress;
use crate::{ConfigAction, DownloadArgs, OutputFormat};
use anyhow::{anyhow, bail, Result};
use civitdl_core::{CivitdlCore, ConfigStorage};
use civitdl_types::{AssetQuery, AssetStatus, AssetVersion, Config, RunSummary, Selection};
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing::warn;

// ============================================================================
// Download
// ============================================================================

fn selection_from(args: &DownloadArgs) -> Result<Selection> {
    if !args.versions.is_empty() {
        return Ok(Selection::Versions {
            ids: args.versions.clone(),
        });
    }
    if !args.models.is_empty() {
        return Ok(Selection::Models {
            ids: args.models.clone(),
            latest_only: args.latest_only,
        });
    }

    let query = AssetQuery {
        query: args.query.clone(),
        username: args.username.clone(),
        tag: args.tag.clone(),
        types: args.types.clone(),
        base_models: args.base_models.clone(),
        sort: args.sort.clone(),
        period: args.period.clone(),
        nsfw: args.nsfw.then_some(true),
        latest_only: args.latest_only,
    };
    if query.query.is_none() && query.username.is_none() && query.tag.is_none() && query.types.is_empty() {
        bail!("Nothing selected: pass --query, --username, --tag, --type, --model or --version");
    }
    Ok(Selection::Query(query))
}

pub async fn download(data_dir: PathBuf, args: DownloadArgs, format: OutputFormat) -> Result<ExitCode> {
    let selection = selection_from(&args)?;

    let storage = ConfigStorage::new(data_dir.clone()).await?;
    let mut config = storage.load_config().await?;
    if let Some(key) = args.api_key.clone() {
        config.api_key = Some(key);
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if args.speed_limit.is_some() {
        config.speed_limit = args.speed_limit;
    }
    if args.max_items.is_some() {
        config.max_items = args.max_items;
    }
    if let Some(output) = args.output.clone() {
        config.download_root = output;
    }

    let core = CivitdlCore::with_config(data_dir, config).await?;

    // Ctrl-C parks in-flight transfers instead of killing them
    let cancel_core = core.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} Stopping, parking unfinished downloads...", style("!").yellow().bold());
            cancel_core.cancel();
        }
    });

    let progress_task = match format {
        OutputFormat::Human => {
            let mut events = core.subscribe();
            let progress = DownloadProgress::new();
            Some(tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            if progress.handle_event(&event).await {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Progress display skipped {} events", n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                progress.clear().await;
            }))
        }
        _ => None,
    };

    let started = Instant::now();
    let result = core.download(&selection, None, None).await;
    if let Some(task) = progress_task {
        if result.is_err() {
            task.abort();
        }
        let _ = task.await;
    }
    core.close().await;

    let summary = result?;
    print_summary(&summary, started.elapsed(), format)?;

    if summary.has_failures() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn print_summary(summary: &RunSummary, elapsed: std::time::Duration, format: OutputFormat) -> Result<()> {
    if let OutputFormat::Json = format {
        return print_output(summary, format);
    }

    println!();
    let headline = if summary.cancelled {
        style("Download stopped").yellow().bold()
    } else {
        style("Download finished").green().bold()
    };
    println!("{} in {}", headline, format_duration(elapsed));
    println!("  Completed: {}", style(summary.completed).green());
    println!("  Skipped:   {}", summary.skipped);
    println!("  Failed:    {}", style(summary.failed).red());
    println!("  Transferred: {}", format_bytes(summary.bytes_transferred));
    if summary.parked > 0 {
        println!("  Parked for next run: {}", summary.parked);
    }

    if !summary.failures.is_empty() {
        println!();
        println!("{}", style("Failed assets:").red().bold());
        for failure in &summary.failures {
            println!(
                "  {} {} ({}) after {} attempt(s): {}",
                style("✗").red(),
                failure.filename,
                failure.id,
                failure.attempts,
                style(&failure.error).dim()
            );
        }
    }
    Ok(())
}

// ============================================================================
// State Commands
// ============================================================================

pub async fn show_status(data_dir: PathBuf, status: Option<String>, format: OutputFormat) -> Result<()> {
    let filter = status
        .map(|s| s.parse::<AssetStatus>().map_err(|e| anyhow!(e)))
        .transpose()?;
    let core = CivitdlCore::new(data_dir).await?;
    let assets = core.list_assets(filter).await?;
    let counts = core.status_counts().await?;
    core.close().await;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&assets)?);
        }
        OutputFormat::Table => print_asset_table(&assets),
        OutputFormat::Human => {
            if assets.is_empty() {
                println!("{}", style("No assets found").dim());
            }
            for asset in &assets {
                print_asset_summary(asset);
            }
            println!();
            println!(
                "{} total: {} completed, {} pending, {} in progress, {} failed, {} skipped",
                style(counts.total()).bold(),
                counts.completed,
                counts.pending,
                counts.in_progress,
                counts.failed,
                counts.skipped
            );
        }
    }

    Ok(())
}

pub async fn list_failed(data_dir: PathBuf, format: OutputFormat) -> Result<()> {
    let core = CivitdlCore::new(data_dir).await?;
    let max_attempts = core.config().max_attempts;
    let failed: Vec<_> = core
        .list_assets(Some(AssetStatus::Failed))
        .await?
        .into_iter()
        .filter(|a| a.attempts >= max_attempts)
        .collect();
    core.close().await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&failed)?),
        OutputFormat::Table => print_asset_table(&failed),
        OutputFormat::Human => {
            if failed.is_empty() {
                println!("{} No failed assets", style("✓").green().bold());
            }
            for asset in &failed {
                println!(
                    "{} {} ({})",
                    style("✗").red(),
                    style(&asset.filename).bold(),
                    asset.id
                );
                println!(
                    "    {}",
                    style(asset.last_error.as_deref().unwrap_or("unknown error")).red()
                );
            }
        }
    }
    Ok(())
}

pub async fn retry_failed(data_dir: PathBuf, format: OutputFormat) -> Result<()> {
    let core = CivitdlCore::new(data_dir).await?;
    let count = core.retry_failed().await?;
    core.close().await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "requeued": count })),
        _ => println!(
            "{} {} failed asset(s) will be retried on the next download",
            style("✓").green().bold(),
            count
        ),
    }
    Ok(())
}

fn print_asset_table(assets: &[AssetVersion]) {
    use tabled::{Table, Tabled};

    #[derive(Tabled)]
    struct AssetRow {
        id: String,
        filename: String,
        size: String,
        status: String,
        attempts: u32,
    }

    let rows: Vec<AssetRow> = assets
        .iter()
        .map(|a| AssetRow {
            id: a.id.clone(),
            filename: if a.filename.chars().count() > 40 {
                format!("{}...", a.filename.chars().take(37).collect::<String>())
            } else {
                a.filename.clone()
            },
            size: a
                .size
                .or(a.expected_size)
                .map(format_bytes)
                .unwrap_or_else(|| "?".to_string()),
            status: a.status.to_string(),
            attempts: a.attempts,
        })
        .collect();

    println!("{}", Table::new(rows));
}

fn print_asset_summary(asset: &AssetVersion) {
    let status_icon = match asset.status {
        AssetStatus::Completed => style("✓").green(),
        AssetStatus::InProgress => style("↓").cyan(),
        AssetStatus::Pending => style("·").dim(),
        AssetStatus::Failed => style("✗").red(),
        AssetStatus::Skipped => style("○").dim(),
    };

    println!(
        "{} {} {} {}",
        status_icon,
        style(&asset.filename).bold(),
        style(&asset.id).dim(),
        style(asset.status).dim()
    );
    if let Some(error) = &asset.last_error {
        if asset.status != AssetStatus::Completed {
            println!("    Error: {}", style(error).red());
        }
    }
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    data_dir: PathBuf,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    let storage = ConfigStorage::new(data_dir).await?;

    match action {
        None | Some(ConfigAction::Show) => {
            let config = storage.load_config().await?;
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&redacted(&config))?);
                }
                _ => print_config(&config, &storage),
            }
        }

        Some(ConfigAction::Get { key }) => {
            let config = storage.load_config().await?;
            let value = serde_json::to_value(&config)?;
            let field = value
                .get(&key)
                .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;
            match field {
                serde_json::Value::String(s) => println!("{}", s),
                other => println!("{}", other),
            }
        }

        Some(ConfigAction::Set { key, value }) => {
            let config = storage.load_config().await?;
            let updated = set_config_value(&config, &key, &value)?;
            storage.save_config(&updated).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset { yes }) => {
            let confirmed = yes
                || dialoguer::Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?;

            if confirmed {
                storage.reset_config().await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}

/// Apply `key = value` to a config, accepting JSON literals or bare strings
fn set_config_value(config: &Config, key: &str, value: &str) -> Result<Config> {
    let mut json = serde_json::to_value(config)?;
    let object = json
        .as_object_mut()
        .ok_or_else(|| anyhow!("Config is not an object"))?;
    if !object.contains_key(key) {
        bail!("Unknown config key: {}", key);
    }

    let parsed = match value {
        "none" | "null" => serde_json::Value::Null,
        _ => serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string())),
    };
    object.insert(key.to_string(), parsed);

    let updated: Config = serde_json::from_value(json)
        .map_err(|e| anyhow!("Invalid value for {}: {}", key, e))?;
    updated.validate().map_err(|e| anyhow!(e))?;
    Ok(updated)
}

fn redacted(config: &Config) -> Config {
    let mut config = config.clone();
    if config.api_key.is_some() {
        config.api_key = Some("********".to_string());
    }
    config
}

fn print_config(config: &Config, storage: &ConfigStorage) {
    println!("civitdl Configuration ({}):", storage.config_path().display());
    println!();
    println!("  API: {}", config.api_base_url);
    println!(
        "  API key: {}",
        if config.api_key.is_some() { "set" } else { "not set" }
    );
    println!("  Download root: {}", config.download_root.display());
    println!("  Layout: {:?}", config.layout);
    println!("  Workers: {}", config.concurrency);
    println!(
        "  Max concurrent transfers: {}",
        config
            .max_concurrent_transfers
            .map(|n| n.to_string())
            .unwrap_or_else(|| "one per worker".to_string())
    );
    println!(
        "  Global speed limit: {}",
        config
            .speed_limit
            .map(|s| format_bytes(s) + "/s")
            .unwrap_or_else(|| "Unlimited".to_string())
    );
    println!("  Max attempts: {}", config.max_attempts);
    println!(
        "  Retry delay: {}ms - {}ms",
        config.retry_base_delay_ms, config.retry_max_delay_ms
    );
    println!("  Verify completed files: {}", config.verify_completed);
    println!("  State database: {}", storage.state_db_path().display());
}
