//! Shared fixtures for harvest-ingest integration tests
//!
//! [`ScriptedSource`] replays a per-entity list of outcomes so tests can
//! drive the retry, dispatch and run layers without a network.

#![allow(dead_code)]

use async_trait::async_trait;
use harvest_common::{EntityKey, WorkItem};
use harvest_ingest::controller::{RunController, RunSettings};
use harvest_ingest::dispatch::Dispatcher;
use harvest_ingest::fetch::{FetchAttempt, Jitter};
use harvest_ingest::handoff::DocumentHandoff;
use harvest_ingest::rate_limit::RateLimiter;
use harvest_ingest::retry::{BackoffPolicy, RetryScheduler};
use harvest_ingest::source::{DocumentSource, FetchError, FetchedDocument};
use harvest_ingest::store::{DocumentStore, FetchedEntity};
use harvest_ingest::LedgerStore;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What one attempt for an entity does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Succeed,
    Retryable,
    Fatal,
    Panic,
}

/// Document source replaying scripted outcomes per entity.
///
/// Entities without a script succeed. Once a script runs out its last step
/// repeats.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: HashMap<String, Vec<Step>>,
    delays: HashMap<String, Duration>,
    attempts: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter even when the attempt panics
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, key: &str, steps: &[Step]) -> Self {
        self.scripts.insert(key.to_string(), steps.to_vec());
        self
    }

    /// Simulated transfer time for every attempt of `key`
    pub fn delay(mut self, key: &str, delay: Duration) -> Self {
        self.delays.insert(key.to_string(), delay);
        self
    }

    /// Same simulated transfer time for each of `keys`
    pub fn delay_all(mut self, keys: &[&str], delay: Duration) -> Self {
        for key in keys {
            self.delays.insert(key.to_string(), delay);
        }
        self
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.lock().unwrap().values().sum()
    }

    pub fn attempted_keys(&self) -> HashSet<String> {
        self.attempts.lock().unwrap().keys().cloned().collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, key: &str) -> Step {
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(key.to_string()).or_insert(0);
        *count += 1;

        match self.scripts.get(key) {
            Some(steps) if !steps.is_empty() => {
                let index = (*count as usize - 1).min(steps.len() - 1);
                steps[index]
            },
            _ => Step::Succeed,
        }
    }
}

#[async_trait]
impl DocumentSource for ScriptedSource {
    async fn fetch(
        &self,
        item: &WorkItem,
        dest: &Path,
        gate: &RateLimiter,
    ) -> Result<Vec<FetchedDocument>, FetchError> {
        gate.acquire().await;
        let key = item.key.as_str();
        let step = self.next_step(key);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if let Some(delay) = self.delays.get(key) {
            tokio::time::sleep(*delay).await;
        }

        match step {
            Step::Succeed => {
                let body = format!("filing for {key}");
                std::fs::write(dest.join("filing.txt"), &body)?;
                Ok(vec![FetchedDocument {
                    relative_path: PathBuf::from("filing.txt"),
                    size: body.len() as u64,
                    sha256: String::new(),
                    source_url: format!("mem://{key}"),
                }])
            },
            Step::Retryable => {
                // Partial output must never surface
                std::fs::write(dest.join("partial.txt"), b"trunc")?;
                Err(FetchError::RateLimited {
                    status: 429,
                    url: format!("mem://{key}"),
                })
            },
            Step::Fatal => Err(FetchError::NotFound(format!("no filings for {key}"))),
            Step::Panic => panic!("scripted panic for {key}"),
        }
    }
}

/// Handoff that records deliveries and can refuse chosen entities
#[derive(Default)]
pub struct RecordingHandoff {
    delivered: Mutex<Vec<EntityKey>>,
    refuse: HashSet<String>,
}

impl RecordingHandoff {
    pub fn refusing(keys: &[&str]) -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            refuse: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|k| k.to_string())
            .collect()
    }
}

#[async_trait]
impl DocumentHandoff for RecordingHandoff {
    async fn deliver(&self, entity: &FetchedEntity) -> anyhow::Result<()> {
        if self.refuse.contains(entity.key.as_str()) {
            anyhow::bail!("consumer queue full");
        }
        assert!(entity.directory.join("manifest.json").exists());
        self.delivered.lock().unwrap().push(entity.key.clone());
        Ok(())
    }
}

pub fn key(name: &str) -> EntityKey {
    EntityKey::new(name).unwrap()
}

pub fn items(names: &[&str]) -> Vec<WorkItem> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| WorkItem::new(key(name), format!("{name} Corp"), i as u64 + 1))
        .collect()
}

pub fn no_backoff_policy(max_retries: u32) -> BackoffPolicy {
    BackoffPolicy {
        max_retries,
        initial_backoff: Duration::from_millis(10),
        backoff_factor: 2.0,
        max_backoff: Duration::from_millis(50),
    }
}

pub fn scheduler(
    source: Arc<dyn DocumentSource>,
    limiter: RateLimiter,
    root: &Path,
    policy: BackoffPolicy,
) -> Arc<RetryScheduler> {
    jittered_scheduler(source, limiter, root, policy, Jitter::none())
}

/// Scheduler whose attempts each sleep `jitter` first
pub fn jittered_scheduler(
    source: Arc<dyn DocumentSource>,
    limiter: RateLimiter,
    root: &Path,
    policy: BackoffPolicy,
    jitter: Jitter,
) -> Arc<RetryScheduler> {
    let attempt = Arc::new(FetchAttempt::new(
        source,
        Arc::new(limiter),
        DocumentStore::new(root),
        jitter,
    ));
    Arc::new(RetryScheduler::new(attempt, policy))
}

/// Everything a run needs, rooted in one scratch directory
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub source: Arc<ScriptedSource>,
    pub handoff: Arc<RecordingHandoff>,
}

impl Harness {
    pub fn new(source: ScriptedSource) -> Self {
        Self::with_handoff(source, RecordingHandoff::default())
    }

    pub fn with_handoff(source: ScriptedSource, handoff: RecordingHandoff) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            source: Arc::new(source),
            handoff: Arc::new(handoff),
        }
    }

    pub fn documents_root(&self) -> PathBuf {
        self.dir.path().join("filings")
    }

    pub fn ledger_store(&self) -> LedgerStore {
        LedgerStore::new(self.dir.path().join("processing_status.csv"))
    }

    pub fn controller(
        &self,
        limiter: RateLimiter,
        policy: BackoffPolicy,
        concurrency: usize,
        wave_size: usize,
    ) -> RunController {
        self.paced_controller(
            limiter,
            policy,
            concurrency,
            RunSettings {
                wave_size,
                wave_pause: Jitter::none(),
            },
        )
    }

    pub fn paced_controller(
        &self,
        limiter: RateLimiter,
        policy: BackoffPolicy,
        concurrency: usize,
        settings: RunSettings,
    ) -> RunController {
        let scheduler = scheduler(self.source.clone(), limiter, &self.documents_root(), policy);
        RunController::new(
            Dispatcher::new(scheduler, concurrency),
            DocumentStore::new(self.documents_root()),
            self.ledger_store(),
            self.handoff.clone(),
            settings,
        )
    }

    /// Ledger contents as `(key, processed)` pairs in ledger order
    pub fn ledger_rows(&self) -> Vec<(String, bool)> {
        self.ledger_store()
            .load()
            .unwrap()
            .rows()
            .iter()
            .map(|row| (row.entity_key.to_string(), row.processed))
            .collect()
    }
}
