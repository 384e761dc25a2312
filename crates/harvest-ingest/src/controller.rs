//! Run loop: ledger in, waves out, ledger persisted after every wave

use crate::dispatch::Dispatcher;
use crate::fetch::Jitter;
use crate::handoff::DocumentHandoff;
use crate::ledger::{Ledger, LedgerError, LedgerStore, Progress};
use crate::retry::{FailureKind, FailureReport, FinalOutcome};
use crate::store::DocumentStore;
use futures::StreamExt;
use harvest_common::{EntityKey, WorkItem};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

/// Wave sizing and pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    /// Entities dispatched per wave; the ledger is persisted after each wave
    pub wave_size: usize,

    /// Pause between consecutive waves
    pub wave_pause: Jitter,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            wave_size: 25,
            wave_pause: Jitter::new(
                std::time::Duration::from_secs(1),
                std::time::Duration::from_secs(2),
            ),
        }
    }
}

/// Summary of one run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,

    /// Universe size
    pub total: usize,

    /// Processed entities after the run, including earlier runs
    pub processed: usize,

    /// Entities that succeeded in this run
    pub succeeded: usize,

    /// Entities that ended `Failed` in this run, in completion order
    pub failed: Vec<(EntityKey, FailureReport)>,

    /// Waves dispatched
    pub waves: usize,

    /// Whether the run stopped early because of cancellation
    pub interrupted: bool,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn progress(&self) -> Progress {
        Progress {
            processed: self.processed,
            total: self.total,
        }
    }
}

/// Drives pending entities through the dispatcher until none remain
pub struct RunController {
    dispatcher: Dispatcher,
    documents: DocumentStore,
    ledger: LedgerStore,
    handoff: Arc<dyn DocumentHandoff>,
    settings: RunSettings,
}

impl RunController {
    pub fn new(
        dispatcher: Dispatcher,
        documents: DocumentStore,
        ledger: LedgerStore,
        handoff: Arc<dyn DocumentHandoff>,
        settings: RunSettings,
    ) -> Self {
        Self {
            dispatcher,
            documents,
            ledger,
            handoff,
            settings: RunSettings {
                wave_size: settings.wave_size.max(1),
                ..settings
            },
        }
    }

    /// Run until every entity of `universe` is processed, failed for this
    /// run, or `cancel` fires.
    ///
    /// Only ledger errors abort the run; entity failures are collected in
    /// the report and stay pending for the next invocation.
    pub async fn run(
        &self,
        universe: &[WorkItem],
        cancel: &CancellationToken,
    ) -> Result<RunReport, LedgerError> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id, universe, cancel)
            .instrument(tracing::info_span!("run", %run_id))
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        universe: &[WorkItem],
        cancel: &CancellationToken,
    ) -> Result<RunReport, LedgerError> {
        let started = Instant::now();

        // No attempts are in flight yet, so anything in staging is debris
        match self.documents.sweep_staging() {
            Ok(0) => {},
            Ok(removed) => info!(removed, "Removed abandoned staging directories"),
            Err(e) => warn!(error = %e, "Failed to sweep staging directories"),
        }

        let keys: Vec<EntityKey> = universe.iter().map(|item| item.key.clone()).collect();
        let mut ledger = self.ledger.load_or_seed(&keys)?;

        // One work item per key; a repeated key keeps its first item
        let mut by_key: HashMap<&EntityKey, &WorkItem> = HashMap::with_capacity(universe.len());
        for item in universe {
            by_key.entry(&item.key).or_insert(item);
        }
        let pending: Vec<&WorkItem> = ledger
            .pending()
            .iter()
            .filter_map(|key| by_key.get(key).copied())
            .collect();

        info!(
            universe = universe.len(),
            pending = pending.len(),
            progress = %ledger.progress(),
            concurrency = self.dispatcher.concurrency(),
            wave_size = self.settings.wave_size,
            "Starting run"
        );

        let mut report = RunReport {
            run_id,
            total: ledger.len(),
            processed: ledger.processed_count(),
            succeeded: 0,
            failed: Vec::new(),
            waves: 0,
            interrupted: false,
        };

        for (index, wave) in pending.chunks(self.settings.wave_size).enumerate() {
            if index > 0 && !self.pause_between_waves(cancel).await {
                report.interrupted = true;
                break;
            }
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }

            let items: Vec<WorkItem> = wave.iter().map(|item| (*item).clone()).collect();
            let admitted = self
                .run_wave(index + 1, items, cancel, &mut ledger, &mut report)
                .await?;
            report.waves += 1;

            if admitted < wave.len() {
                info!(wave = index + 1, not_started = wave.len() - admitted, "Run cancelled");
                report.interrupted = true;
                break;
            }
        }

        report.interrupted |= cancel.is_cancelled();
        self.ledger.persist(&ledger)?;
        report.processed = ledger.processed_count();

        info!(
            progress = %report.progress(),
            succeeded = report.succeeded,
            failed = report.failed.len(),
            waves = report.waves,
            interrupted = report.interrupted,
            elapsed_secs = started.elapsed().as_secs(),
            "Run finished"
        );
        Ok(report)
    }

    /// Dispatch one wave and fold its outcomes into the ledger.
    ///
    /// Returns how many entities of the wave were started.
    async fn run_wave(
        &self,
        number: usize,
        items: Vec<WorkItem>,
        cancel: &CancellationToken,
        ledger: &mut Ledger,
        report: &mut RunReport,
    ) -> Result<usize, LedgerError> {
        info!(wave = number, size = items.len(), "Starting wave");

        let mut outcomes = std::pin::pin!(self.dispatcher.dispatch(items, cancel.clone()));
        let mut completed: Vec<EntityKey> = Vec::new();
        let mut started = 0usize;
        let mut failures = 0usize;

        while let Some((key, outcome)) = outcomes.next().await {
            started += 1;
            match outcome {
                FinalOutcome::Succeeded { entity, attempts } => {
                    match self.handoff.deliver(&entity).await {
                        Ok(()) => {
                            info!(
                                entity = %key,
                                attempts,
                                documents = entity.manifest.documents.len(),
                                bytes = entity.manifest.total_bytes(),
                                "Entity fetched"
                            );
                            completed.push(key);
                        },
                        Err(e) => {
                            error!(entity = %key, error = %e, "Handoff failed");
                            failures += 1;
                            report.failed.push((
                                key,
                                FailureReport {
                                    kind: FailureKind::Handoff,
                                    attempts,
                                    reason: format!("{e:#}"),
                                },
                            ));
                        },
                    }
                },
                FinalOutcome::Failed(failure) => {
                    error!(
                        entity = %key,
                        kind = %failure.kind,
                        attempts = failure.attempts,
                        reason = %failure.reason,
                        "Entity failed"
                    );
                    failures += 1;
                    report.failed.push((key, failure));
                },
            }
        }

        let marked = ledger.mark_processed(&completed);
        self.ledger.persist(ledger)?;
        report.succeeded += marked;

        info!(
            wave = number,
            succeeded = completed.len(),
            failed = failures,
            progress = %ledger.progress(),
            "Finished wave"
        );
        Ok(started)
    }

    /// Returns `false` when cancelled during the pause
    async fn pause_between_waves(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = self.settings.wave_pause.sleep() => true,
            _ = cancel.cancelled() => false,
        }
    }
}
