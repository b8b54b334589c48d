use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dailywall_core::{parse_resolution, resolve_host};
use dailywall_storage::StoreFormat;
use dailywall_sync::{run_sync_once, RunStatus, SyncConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "dailywall")]
#[command(about = "Download new homepage images of the day for every market")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    overrides: Overrides,

    /// YAML file with config overrides
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level, used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Args)]
struct Overrides {
    /// Target folder for images, record log and run log
    #[arg(long, global = true)]
    folder: Option<PathBuf>,

    /// Days before today, -1..=7
    #[arg(long, global = true, allow_hyphen_values = true)]
    days: Option<i32>,

    /// Images per market ending at `days`, 0..=7
    #[arg(long, global = true)]
    num: Option<u32>,

    /// `global`, `cn` or a base URL
    #[arg(long, global = true)]
    host: Option<String>,

    /// Image size as WxH
    #[arg(long, global = true)]
    resolution: Option<String>,

    /// Record store format: delimited or json
    #[arg(long, global = true)]
    store: Option<StoreFormat>,

    /// Skip images whose URL contains this text, e.g. `_ROW`; repeatable
    #[arg(long, global = true, value_name = "TEXT")]
    exclude: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, dedupe and download new images (default)
    Sync {
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print previously downloaded images
    Show {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List configured market codes
    Markets,
}

fn build_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = SyncConfig::from_env();
    if let Some(path) = &cli.config {
        config.apply_file(path)?;
    }

    let o = &cli.overrides;
    if let Some(folder) = &o.folder {
        config.folder = folder.clone();
    }
    if let Some(days) = o.days {
        config.day_offset = days;
    }
    if let Some(num) = o.num {
        config.count = num;
    }
    if let Some(host) = &o.host {
        config.host = resolve_host(host);
    }
    if let Some(resolution) = &o.resolution {
        config.resolution = parse_resolution(resolution)
            .with_context(|| format!("invalid --resolution {resolution:?}, expected WxH"))?;
    }
    if let Some(store) = o.store {
        config.store_format = store;
    }
    if !o.exclude.is_empty() {
        config.exclude = o.exclude.clone();
    }
    Ok(config)
}

fn init_logging(level: &str, log_file: Option<PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "dailywall={level},dailywall_sync={level},\
             dailywall_adapters={level},dailywall_storage={level}"
        ))
    });

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => {
            config.ensure_folder()?;
            init_logging(&cli.log_level, Some(config.log_path()))?;
            info!(
                folder = %config.folder.display(),
                host = %config.host,
                days = config.day_offset,
                num = config.count,
                resolution = %config.resolution_token(),
                markets = config.markets.len(),
                "starting homepage image sync"
            );

            match run_sync_once(config).await {
                Ok(summary) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&summary)?);
                    } else {
                        println!(
                            "sync complete: run_id={} fetched={} excluded={} new={} downloaded={} failed={}",
                            summary.run_id,
                            summary.fetched,
                            summary.excluded,
                            summary.deduplicated,
                            summary.downloaded,
                            summary.failed
                        );
                    }
                }
                Err(err) => {
                    error!(status = ?RunStatus::Aborted, "sync aborted: {err:#}");
                    return Err(err);
                }
            }
        }
        Commands::Show { limit } => {
            init_logging(&cli.log_level, None)?;
            let store = config.store_format.open(&config.folder);
            let records = store
                .load()
                .await
                .with_context(|| format!("loading {}", config.store_path().display()))?;
            let skip = limit.map_or(0, |n| records.len().saturating_sub(n));
            for record in records.iter().skip(skip) {
                println!("[{}] {}", record.market, record);
            }
        }
        Commands::Markets => {
            for market in &config.markets {
                println!("{market}");
            }
        }
    }

    Ok(())
}
