//! Run configuration
//!
//! Loaded from `HARVEST_*` environment variables (after `.env`), then
//! optionally overridden from the command line.

use crate::controller::RunSettings;
use crate::dispatch::{default_concurrency, MAX_CONCURRENCY};
use crate::fetch::Jitter;
use crate::rate_limit::RateLimitConfig;
use crate::retry::BackoffPolicy;
use crate::source::EdgarConfig;
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Complete configuration of one acquisition run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// `company_tickers.json` style catalog
    pub catalog_path: PathBuf,

    /// Progress ledger CSV
    pub ledger_path: PathBuf,

    /// Root of the per-entity document directories
    pub documents_root: PathBuf,

    /// JSON lines queue read by the downstream consumer
    pub handoff_path: PathBuf,

    /// Delete entity directories after fetching instead of queueing them
    pub purge_after_fetch: bool,

    /// Process only the first N catalog entries
    pub catalog_limit: Option<usize>,

    pub edgar: EdgarConfig,

    pub requests_per_second: u32,
    pub concurrency: usize,
    pub wave_size: usize,

    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_ms: u64,

    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    pub wave_pause_min_ms: u64,
    pub wave_pause_max_ms: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("company_tickers.json"),
            ledger_path: PathBuf::from("processing_status.csv"),
            documents_root: PathBuf::from("data/filings"),
            handoff_path: PathBuf::from("data/handoff.jsonl"),
            purge_after_fetch: false,
            catalog_limit: None,
            edgar: EdgarConfig::default(),
            requests_per_second: 10,
            concurrency: default_concurrency(),
            wave_size: 25,
            max_retries: 3,
            initial_backoff_ms: 2_000,
            backoff_factor: 2.0,
            max_backoff_ms: 120_000,
            jitter_min_ms: 1_000,
            jitter_max_ms: 2_000,
            wave_pause_min_ms: 1_000,
            wave_pause_max_ms: 2_000,
        }
    }
}

/// Parse the variable `key` when it is set and non-blank
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid value {raw:?} for {key}: {e}")),
        _ => Ok(None),
    }
}

/// Overwrite `target` with the parsed variable, if set
fn apply<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = parse_var(lookup, key)? {
        *target = value;
    }
    Ok(())
}

impl HarvestConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> anyhow::Result<Self> {
        // A missing .env file is normal
        let _ = dotenvy::dotenv();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// Unset variables keep their defaults; malformed values are errors.
    /// The result is not validated, so command line overrides can still be
    /// applied.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        apply(&lookup, "HARVEST_CATALOG_PATH", &mut config.catalog_path)?;
        apply(&lookup, "HARVEST_LEDGER_PATH", &mut config.ledger_path)?;
        apply(&lookup, "HARVEST_DOCUMENTS_ROOT", &mut config.documents_root)?;
        apply(&lookup, "HARVEST_HANDOFF_PATH", &mut config.handoff_path)?;
        apply(&lookup, "HARVEST_PURGE_AFTER_FETCH", &mut config.purge_after_fetch)?;
        config.catalog_limit = parse_var(&lookup, "HARVEST_CATALOG_LIMIT")?;

        apply(&lookup, "HARVEST_USER_AGENT", &mut config.edgar.user_agent)?;
        apply(&lookup, "HARVEST_SUBMISSIONS_BASE_URL", &mut config.edgar.submissions_base_url)?;
        apply(&lookup, "HARVEST_ARCHIVES_BASE_URL", &mut config.edgar.archives_base_url)?;
        apply(&lookup, "HARVEST_FORM_TYPE", &mut config.edgar.form_type)?;
        config.edgar.filing_limit = parse_var(&lookup, "HARVEST_FILING_LIMIT")?;
        apply(&lookup, "HARVEST_REQUEST_TIMEOUT_SECS", &mut config.edgar.timeout_secs)?;

        apply(&lookup, "HARVEST_REQUESTS_PER_SECOND", &mut config.requests_per_second)?;
        apply(&lookup, "HARVEST_CONCURRENCY", &mut config.concurrency)?;
        apply(&lookup, "HARVEST_WAVE_SIZE", &mut config.wave_size)?;

        apply(&lookup, "HARVEST_MAX_RETRIES", &mut config.max_retries)?;
        apply(&lookup, "HARVEST_INITIAL_BACKOFF_MS", &mut config.initial_backoff_ms)?;
        apply(&lookup, "HARVEST_BACKOFF_FACTOR", &mut config.backoff_factor)?;
        apply(&lookup, "HARVEST_MAX_BACKOFF_MS", &mut config.max_backoff_ms)?;

        apply(&lookup, "HARVEST_JITTER_MIN_MS", &mut config.jitter_min_ms)?;
        apply(&lookup, "HARVEST_JITTER_MAX_MS", &mut config.jitter_max_ms)?;
        apply(&lookup, "HARVEST_WAVE_PAUSE_MIN_MS", &mut config.wave_pause_min_ms)?;
        apply(&lookup, "HARVEST_WAVE_PAUSE_MAX_MS", &mut config.wave_pause_max_ms)?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Err(e) = self.edgar.validate() {
            bail!("HARVEST_USER_AGENT / EDGAR settings: {e}");
        }
        if self.requests_per_second == 0 {
            bail!("HARVEST_REQUESTS_PER_SECOND must be greater than 0");
        }
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            bail!("HARVEST_CONCURRENCY must be between 1 and {MAX_CONCURRENCY}");
        }
        if self.wave_size == 0 {
            bail!("HARVEST_WAVE_SIZE must be greater than 0");
        }
        if self.catalog_limit == Some(0) {
            bail!("HARVEST_CATALOG_LIMIT must be greater than 0 when set");
        }
        if let Err(e) = self.backoff_policy().validate() {
            bail!("Invalid retry settings: {e}");
        }
        if self.jitter_min_ms > self.jitter_max_ms {
            bail!("HARVEST_JITTER_MIN_MS cannot exceed HARVEST_JITTER_MAX_MS");
        }
        if self.wave_pause_min_ms > self.wave_pause_max_ms {
            bail!("HARVEST_WAVE_PAUSE_MIN_MS cannot exceed HARVEST_WAVE_PAUSE_MAX_MS");
        }
        Ok(())
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.requests_per_second)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            backoff_factor: self.backoff_factor,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn jitter(&self) -> Jitter {
        Jitter::new(
            Duration::from_millis(self.jitter_min_ms),
            Duration::from_millis(self.jitter_max_ms),
        )
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            wave_size: self.wave_size,
            wave_pause: Jitter::new(
                Duration::from_millis(self.wave_pause_min_ms),
                Duration::from_millis(self.wave_pause_max_ms),
            ),
        }
    }
}
