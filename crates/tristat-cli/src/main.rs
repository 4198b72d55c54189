use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use tristat_adapters::Harvester;
use tristat_pipeline::{export, Pipeline, PipelineConfig};
use tristat_storage::{ApiClient, ApiClientConfig, EventCache};

#[derive(Debug, Parser)]
#[command(name = "tristat")]
#[command(about = "Triathlon results reconciliation")]
struct Cli {
    /// Pipeline config file; defaults to $TRISTAT_CONFIG or ./tristat.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Newline-delimited JSON logs (also enabled by TRISTAT_LOG_JSON=1).
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch new events from the federation API into the cache.
    Harvest,
    /// Rebuild the dataset from the cache and write a report directory.
    Reconcile,
    /// Summarize recent reconciliation runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

fn load_config(path: Option<PathBuf>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::load(&path)?,
        None => PipelineConfig::from_env()?,
    };
    config.validate().context("invalid pipeline config")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_logs = cli.json_logs
        || std::env::var("TRISTAT_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");
    init_tracing(json_logs, Level::INFO);

    let config = load_config(cli.config)?;

    match cli.command.unwrap_or(Commands::Reconcile) {
        Commands::Harvest => {
            let mut api = ApiClientConfig {
                api_key: std::env::var("TRISTAT_API_KEY").ok(),
                ..ApiClientConfig::default()
            };
            if let Ok(base_url) = std::env::var("TRISTAT_API_BASE_URL") {
                api.base_url = base_url;
            }
            let client = ApiClient::new(api)?;
            let cache = EventCache::new(config.paths.cache_dir());
            let summary = Harvester::new(client, cache, config.harvest.clone())
                .run()
                .await?;
            info!(saved = summary.events_saved.len(), "harvest finished");
            println!(
                "harvest complete: queries_sent={} listed={} saved={} already_cached={} ignored={}",
                summary.queries_sent,
                summary.events_listed,
                summary.events_saved.len(),
                summary.events_already_cached,
                summary.events_ignored.len()
            );
        }
        Commands::Reconcile => {
            let summary = Pipeline::new(config).run_once().await?;
            println!(
                "reconcile complete: run_id={} loaded={} kept={} excluded={} conflicts={} reports={}",
                summary.run_id,
                summary.counts.loaded,
                summary.counts.kept,
                summary.counts.excluded,
                summary.counts.conflicts,
                summary.reports_dir
            );
        }
        Commands::Report { runs } => {
            println!(
                "{}",
                export::report_markdown(&config.paths.reports_dir(), runs)?
            );
        }
    }

    Ok(())
}
