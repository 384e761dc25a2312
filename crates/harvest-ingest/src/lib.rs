//! Harvest Ingest Library
//!
//! Batch acquisition of per-entity document sets from a rate-limited
//! source, with durable progress across runs.
//!
//! # Components
//!
//! - [`rate_limit`]: process-wide FIFO admission gate
//! - [`fetch`]: one jittered attempt against a [`source::DocumentSource`]
//! - [`retry`]: exponential backoff around attempts
//! - [`dispatch`]: bounded-concurrency fan-out, outcomes in completion order
//! - [`ledger`]: crash-safe `entity_key,processed` CSV
//! - [`controller`]: the wave loop tying it together
//!
//! # Example
//!
//! ```no_run
//! use harvest_ingest::{build_controller, catalog, HarvestConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HarvestConfig::from_env()?;
//!     config.validate()?;
//!
//!     let universe = catalog::load_catalog(&config.catalog_path, config.catalog_limit).await?;
//!     let report = build_controller(&config)?
//!         .run(&universe, &CancellationToken::new())
//!         .await?;
//!     println!("{}", report.progress());
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod fetch;
pub mod handoff;
pub mod ledger;
pub mod rate_limit;
pub mod retry;
pub mod source;
pub mod store;

pub use config::HarvestConfig;
pub use controller::{RunController, RunReport, RunSettings};
pub use ledger::{Ledger, LedgerError, LedgerStore};
pub use retry::{BackoffPolicy, FailureKind, FinalOutcome};

use dispatch::Dispatcher;
use fetch::FetchAttempt;
use handoff::{DocumentHandoff, JsonLinesHandoff, PurgeHandoff};
use rate_limit::RateLimiter;
use retry::RetryScheduler;
use source::{DocumentSource, EdgarSource};
use std::sync::Arc;
use store::DocumentStore;

/// Wire the EDGAR source and the configured handoff into a controller
pub fn build_controller(config: &HarvestConfig) -> anyhow::Result<RunController> {
    let source: Arc<dyn DocumentSource> = Arc::new(EdgarSource::new(config.edgar.clone())?);
    let handoff: Arc<dyn DocumentHandoff> = if config.purge_after_fetch {
        Arc::new(PurgeHandoff)
    } else {
        Arc::new(JsonLinesHandoff::new(&config.handoff_path))
    };
    assemble(config, source, handoff)
}

/// Wire an arbitrary source and handoff into a controller
pub fn assemble(
    config: &HarvestConfig,
    source: Arc<dyn DocumentSource>,
    handoff: Arc<dyn DocumentHandoff>,
) -> anyhow::Result<RunController> {
    let limiter = Arc::new(RateLimiter::new(config.rate_limit())?);
    let documents = DocumentStore::new(&config.documents_root);

    let attempt = Arc::new(FetchAttempt::new(
        source,
        limiter,
        documents.clone(),
        config.jitter(),
    ));
    let scheduler = Arc::new(RetryScheduler::new(attempt, config.backoff_policy()));
    let dispatcher = Dispatcher::new(scheduler, config.concurrency);

    Ok(RunController::new(
        dispatcher,
        documents,
        LedgerStore::new(&config.ledger_path),
        handoff,
        config.run_settings(),
    ))
}
