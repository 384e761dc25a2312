//! Harvest Ingest - batch document acquisition tool

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use harvest_common::logging::{init_logging, LogConfig, LogLevel};
use harvest_common::EntityKey;
use harvest_ingest::{build_controller, catalog, HarvestConfig, LedgerStore};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "harvest-ingest")]
#[command(author, version, about = "Batch acquisition of per-company filings")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    overrides: Overrides,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch every pending entity, resuming from the ledger
    Run,

    /// Create the ledger from the catalog without fetching anything
    Init,

    /// Print ledger progress
    Status,
}

/// Command line overrides; anything unset falls back to HARVEST_* variables
#[derive(Args, Debug)]
struct Overrides {
    /// Entity catalog (company_tickers.json)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Progress ledger CSV
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,

    /// Root directory for fetched documents
    #[arg(long, global = true)]
    documents_root: Option<PathBuf>,

    /// Only consider the first N catalog entries
    #[arg(long, global = true)]
    limit: Option<usize>,

    /// Maximum entities in flight
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Entities per wave
    #[arg(long, global = true)]
    wave_size: Option<usize>,

    /// Global request ceiling
    #[arg(long, global = true)]
    requests_per_second: Option<u32>,

    /// Delete entity directories after fetching instead of queueing them
    #[arg(long, global = true)]
    purge: bool,
}

impl Overrides {
    fn apply(self, config: &mut HarvestConfig) {
        if let Some(path) = self.catalog {
            config.catalog_path = path;
        }
        if let Some(path) = self.ledger {
            config.ledger_path = path;
        }
        if let Some(path) = self.documents_root {
            config.documents_root = path;
        }
        if self.limit.is_some() {
            config.catalog_limit = self.limit;
        }
        if let Some(n) = self.concurrency {
            config.concurrency = n;
        }
        if let Some(n) = self.wave_size {
            config.wave_size = n;
        }
        if let Some(n) = self.requests_per_second {
            config.requests_per_second = n;
        }
        if self.purge {
            config.purge_after_fetch = true;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig {
        level: log_level,
        log_file_prefix: "harvest-ingest".to_string(),
        ..LogConfig::default()
    };

    // Environment variables take precedence over the flag
    let log_config = log_config.clone().with_env_overrides().unwrap_or_else(|e| {
        eprintln!("Ignoring invalid logging environment: {e}");
        log_config
    });

    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        },
    };

    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Harvest failed");
            ExitCode::FAILURE
        },
    }
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let mut config = HarvestConfig::from_env().context("Failed to load configuration")?;
    cli.overrides.apply(&mut config);

    match cli.command {
        Command::Run => run(&config).await,
        Command::Init => init(&config).await,
        Command::Status => status(&config),
    }
}

async fn run(config: &HarvestConfig) -> Result<ExitCode> {
    config.validate()?;

    let universe = catalog::load_catalog(&config.catalog_path, config.catalog_limit).await?;
    let controller = build_controller(config)?;

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown requested, finishing in-flight entities");
            signal.cancel();
        }
    });

    let report = controller.run(&universe, &cancel).await?;

    for (key, failure) in &report.failed {
        warn!(
            entity = %key,
            kind = %failure.kind,
            attempts = failure.attempts,
            reason = %failure.reason,
            "Left pending for the next run"
        );
    }

    info!(
        run_id = %report.run_id,
        progress = %report.progress(),
        succeeded = report.succeeded,
        failed = report.failed.len(),
        interrupted = report.interrupted,
        "Harvest complete"
    );

    Ok(if report.has_failures() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

async fn init(config: &HarvestConfig) -> Result<ExitCode> {
    let universe = catalog::load_catalog(&config.catalog_path, config.catalog_limit).await?;
    let keys: Vec<EntityKey> = universe.into_iter().map(|item| item.key).collect();

    let ledger = LedgerStore::new(&config.ledger_path).load_or_seed(&keys)?;
    info!(
        path = %config.ledger_path.display(),
        progress = %ledger.progress(),
        "Ledger ready"
    );
    Ok(ExitCode::SUCCESS)
}

fn status(config: &HarvestConfig) -> Result<ExitCode> {
    let ledger = LedgerStore::new(&config.ledger_path).load()?;
    let progress = ledger.progress();

    info!(
        path = %config.ledger_path.display(),
        processed = progress.processed,
        total = progress.total,
        pending = progress.pending(),
        "Ledger status"
    );
    println!("{progress} processed, {} pending", progress.pending());
    Ok(ExitCode::SUCCESS)
}
