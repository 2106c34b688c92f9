//! CLI command definitions for vlm-worker.
//!
//! Every subcommand loads [`WorkerConfig`] (defaults, `--config` file,
//! `VLM_WORKER_*` environment), applies its own flags on top, and runs one
//! batch against the configured store.

use crate::llm::DEFAULT_RETRY_PAUSE;
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{
    ingest, load_prompts, BatchDriver, DriverOptions, RunStats, ShutdownSignal, WorkerConfig,
};
use crate::quality::RepetitionDetector;
use crate::server::ServerManager;
use crate::storage::{DocumentStore, ItemStatus, LocalAssetStore, SqliteDocumentStore};
use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Batch captioning worker for a local llama.cpp inference server.
#[derive(Parser)]
#[command(name = "vlm-worker")]
#[command(about = "Caption, moderate and annotate images with local vision-language models")]
#[command(version)]
#[command(
    long_about = "vlm-worker claims pending images from a document store, runs them through a locally\nmanaged llama-server, and merges the results back without overwriting earlier ones.\n\nExample usage:\n  vlm-worker ingest --prefix twitter/\n  vlm-worker caption --models minicpm,joycaption --explain\n  vlm-worker age-estimate --caption-model minicpm --age-model qwen3 --max-items 500"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file.
    #[arg(short, long, env = "VLM_WORKER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Write Prometheus metrics in text format to this file when the command ends.
    #[arg(long, env = "VLM_WORKER_METRICS_FILE", global = true)]
    pub metrics_file: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Claim the pending backlog and caption it with one or more vision models.
    ///
    /// Nothing is claimed while fewer than `--min-backlog` items are pending.
    /// Each model gets its own server for the whole batch.
    #[command(alias = "cap")]
    Caption(CaptionArgs),

    /// Backfill age estimates for curated items from an existing caption.
    #[command(name = "age-estimate", alias = "age")]
    AgeEstimate(AgeEstimateArgs),

    /// Register images under the asset root as pending work items.
    Ingest(IngestArgs),

    /// Print item counts per status.
    Status(StatusArgs),
}

/// Arguments for `vlm-worker caption`.
#[derive(Parser, Debug)]
pub struct CaptionArgs {
    /// Comma-separated vision model keys (defaults to `caption_models` from config).
    #[arg(short, long, value_delimiter = ',')]
    pub models: Vec<String>,

    /// Also ask for an explanation of the moderation rating.
    #[arg(long)]
    pub explain: bool,

    /// Report what would be done without claiming or starting a server.
    #[arg(long)]
    pub dry_run: bool,

    /// Minimum pending backlog before anything is claimed.
    #[arg(long)]
    pub min_backlog: Option<u64>,

    /// Pause between items in milliseconds.
    #[arg(long)]
    pub item_pause_ms: Option<u64>,
}

/// Arguments for `vlm-worker age-estimate`.
#[derive(Parser, Debug)]
pub struct AgeEstimateArgs {
    /// Caption model whose output is estimated from.
    #[arg(long)]
    pub caption_model: Option<String>,

    /// Text model producing the estimate.
    #[arg(long)]
    pub age_model: Option<String>,

    /// Candidates requested per page.
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Stop after this many items.
    #[arg(short = 'n', long)]
    pub max_items: Option<usize>,

    /// List candidates without starting a server or writing.
    #[arg(long)]
    pub dry_run: bool,

    /// Pause between items in milliseconds.
    #[arg(long)]
    pub item_pause_ms: Option<u64>,
}

/// Arguments for `vlm-worker ingest`.
#[derive(Parser, Debug)]
pub struct IngestArgs {
    /// Only register keys below this prefix (e.g. `twitter/`).
    #[arg(short, long)]
    pub prefix: Option<String>,

    /// Count images without writing.
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for `vlm-worker status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Print counts as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and run the selected command.
///
/// For control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = WorkerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_metrics().context("Failed to initialize metrics")?;

    let result = match cli.command {
        Commands::Caption(args) => run_caption_command(config, args).await,
        Commands::AgeEstimate(args) => run_age_estimate_command(config, args).await,
        Commands::Ingest(args) => run_ingest_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
    };

    if let Some(path) = cli.metrics_file.as_deref() {
        if let Err(e) = write_metrics(path) {
            warn!(path = %path.display(), error = %e, "Failed to write metrics file");
        }
    }
    result
}

// ============================================================================
// Command implementations
// ============================================================================

async fn run_caption_command(mut config: WorkerConfig, args: CaptionArgs) -> anyhow::Result<()> {
    if !args.models.is_empty() {
        config.caption_models = args.models;
    }
    if let Some(min_backlog) = args.min_backlog {
        config.min_backlog = min_backlog;
    }
    if let Some(pause) = args.item_pause_ms {
        config.item_pause_ms = pause;
    }
    config.validate()?;

    let options = DriverOptions {
        dry_run: args.dry_run,
        item_pause: config.item_pause(),
        batch_size: config.batch_size,
        generate_explanation: args.explain,
        ..DriverOptions::default()
    };

    let store = open_store(&config).await?;
    let shutdown = ShutdownSignal::new();
    let driver = build_driver(&config, Arc::clone(&store), options, shutdown.clone())?;
    let listener = shutdown.install_ctrl_c_handler();

    let result = driver.run_caption(&config.caption_models).await;
    listener.abort();
    store.close().await;

    let stats = result.context("Caption run failed")?;
    report(&stats);
    Ok(())
}

async fn run_age_estimate_command(
    mut config: WorkerConfig,
    args: AgeEstimateArgs,
) -> anyhow::Result<()> {
    if let Some(model) = args.caption_model {
        config.caption_source_model = model;
    }
    if let Some(model) = args.age_model {
        config.age_model = model;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(pause) = args.item_pause_ms {
        config.item_pause_ms = pause;
    }
    config.validate()?;

    let options = DriverOptions {
        dry_run: args.dry_run,
        item_pause: config.item_pause(),
        max_items: args.max_items,
        batch_size: config.batch_size,
        ..DriverOptions::default()
    };

    let store = open_store(&config).await?;
    let shutdown = ShutdownSignal::new();
    let driver = build_driver(&config, Arc::clone(&store), options, shutdown.clone())?;
    let listener = shutdown.install_ctrl_c_handler();

    let result = driver
        .run_age_estimation(&config.caption_source_model, &config.age_model)
        .await;
    listener.abort();
    store.close().await;

    let stats = result.context("Age estimation run failed")?;
    report(&stats);
    Ok(())
}

async fn run_ingest_command(config: WorkerConfig, args: IngestArgs) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let assets = LocalAssetStore::new(&config.asset_root);

    let result = ingest(store.as_ref(), &assets, args.prefix.as_deref(), args.dry_run).await;
    store.close().await;
    let stats = result.context("Ingest failed")?;

    println!(
        "Discovered {} image(s), registered {} new item(s){}",
        stats.discovered,
        stats.created,
        if args.dry_run { " (dry run)" } else { "" }
    );
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    database: String,
    total: u64,
    counts: BTreeMap<&'static str, u64>,
}

async fn run_status_command(config: WorkerConfig, args: StatusArgs) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let result = store.status_counts().await;
    store.close().await;
    let by_status = result.context("Failed to count items")?;

    let counts: BTreeMap<&'static str, u64> = ItemStatus::ALL
        .iter()
        .map(|status| (status.as_str(), by_status.get(status).copied().unwrap_or(0)))
        .collect();
    let output = StatusOutput {
        database: config.database_path.display().to_string(),
        total: counts.values().sum(),
        counts,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", output.database);
        for (status, count) in &output.counts {
            println!("  {:<11} {}", status, count);
        }
        println!("  {:<11} {}", "total", output.total);
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

async fn open_store(config: &WorkerConfig) -> anyhow::Result<Arc<SqliteDocumentStore>> {
    let store = SqliteDocumentStore::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open {}", config.database_path.display()))?;
    Ok(Arc::new(store))
}

fn build_driver(
    config: &WorkerConfig,
    store: Arc<SqliteDocumentStore>,
    options: DriverOptions,
    shutdown: ShutdownSignal,
) -> anyhow::Result<BatchDriver> {
    let prompts = load_prompts(config.prompts_dir.as_deref()).context("Failed to load prompts")?;
    let server = ServerManager::new(config.server_config())?;
    shutdown.kill_on_force_exit(server.kill_switch());
    let detector =
        RepetitionDetector::new(config.repetition_min_length, config.repetition_threshold);

    info!(
        database = %config.database_path.display(),
        assets = %config.asset_root.display(),
        models_dir = %config.models_dir.display(),
        dry_run = options.dry_run,
        "Worker configured"
    );

    Ok(BatchDriver::new(
        store,
        Arc::new(LocalAssetStore::new(&config.asset_root)),
        server,
        options,
    )
    .with_prompts(prompts)
    .with_models_dir(&config.models_dir)
    .with_min_backlog(config.min_backlog)
    .with_detector(Arc::new(detector))
    .with_retries(config.max_attempts, DEFAULT_RETRY_PAUSE)
    .with_shutdown(shutdown))
}

fn report(stats: &RunStats) {
    println!(
        "Selected {}, succeeded {}, failed {}, skipped {}, degraded {}, unparsed {}{}",
        stats.selected,
        stats.succeeded,
        stats.failed,
        stats.skipped,
        stats.degraded,
        stats.parse_failures,
        if stats.interrupted { " (interrupted)" } else { "" }
    );
    if stats.unfinished > 0 {
        println!(
            "{} claimed item(s) were left in processing",
            stats.unfinished
        );
    }
}

fn write_metrics(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, export_metrics())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_caption_models_are_comma_separated() {
        let cli = Cli::try_parse_from([
            "vlm-worker",
            "caption",
            "--models",
            "minicpm,joycaption",
            "--explain",
        ])
        .unwrap();
        match cli.command {
            Commands::Caption(args) => {
                assert_eq!(args.models, vec!["minicpm", "joycaption"]);
                assert!(args.explain);
                assert!(!args.dry_run);
            }
            _ => panic!("expected caption"),
        }
    }

    #[test]
    fn test_age_estimate_flags() {
        let cli = Cli::try_parse_from([
            "vlm-worker",
            "--log-level",
            "debug",
            "age",
            "--age-model",
            "qwen3",
            "-n",
            "25",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::AgeEstimate(args) => {
                assert_eq!(args.age_model.as_deref(), Some("qwen3"));
                assert_eq!(args.caption_model, None);
                assert_eq!(args.max_items, Some(25));
                assert!(args.dry_run);
            }
            _ => panic!("expected age-estimate"),
        }
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["vlm-worker", "status", "--config", "worker.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("worker.yaml")));
        assert!(matches!(cli.command, Commands::Status(StatusArgs { json: false })));
    }

    #[tokio::test]
    async fn test_status_and_ingest_against_temp_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let assets = dir.path().join("images");
        std::fs::create_dir_all(assets.join("twitter")).unwrap();
        std::fs::write(assets.join("twitter/a.png"), b"png").unwrap();
        std::fs::write(assets.join("twitter/b.jpg"), b"jpg").unwrap();

        let config = WorkerConfig {
            database_path: dir.path().join("db.sqlite"),
            asset_root: assets,
            ..WorkerConfig::default()
        };

        run_ingest_command(
            config.clone(),
            IngestArgs {
                prefix: None,
                dry_run: false,
            },
        )
        .await
        .unwrap();
        run_status_command(config.clone(), StatusArgs { json: true })
            .await
            .unwrap();

        let store = open_store(&config).await.unwrap();
        assert_eq!(store.count_by_status(ItemStatus::Pending).await.unwrap(), 2);
        store.close().await;
    }
}
