//! Per-entity retry with exponential backoff
//!
//! ```text
//! Pending -> Attempting -> Succeeded
//!                       -> Attempting   (retryable failure, budget left)
//!                       -> Failed       (retryable failure, budget spent)
//!                       -> Failed       (fatal failure, immediately)
//! ```
//!
//! The backoff sleep happens outside the rate limiter, so an entity waiting
//! to retry never holds up admissions for other entities.

use crate::fetch::{AttemptOutcome, FetchAttempt};
use crate::store::FetchedEntity;
use harvest_common::WorkItem;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry budget and backoff curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Total attempts allowed per entity per run
    pub max_retries: u32,

    /// Delay before the second attempt
    pub initial_backoff: Duration,

    /// Growth factor applied after every retry
    pub backoff_factor: f64,

    /// Upper bound for any single delay
    pub max_backoff: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(120),
        }
    }
}

impl BackoffPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries == 0 {
            return Err("max retries must be at least 1".into());
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(format!(
                "backoff factor must be a finite number >= 1.0 (got {})",
                self.backoff_factor
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err("initial backoff cannot exceed max backoff".into());
        }
        Ok(())
    }

    /// The sequence of delays slept between attempts: initial, initial*factor, ... capped
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut state = BackoffState::new(self);
        std::iter::from_fn(move || Some(state.advance()))
    }
}

/// Transient per-entity state while an entity is being retried
#[derive(Debug)]
struct BackoffState {
    current: Duration,
    factor: f64,
    max: Duration,
}

impl BackoffState {
    fn new(policy: &BackoffPolicy) -> Self {
        Self {
            current: policy.initial_backoff,
            factor: policy.backoff_factor,
            max: policy.max_backoff,
        }
    }

    /// Return the delay for this retry and grow the next one
    fn advance(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        let grown = self.current.as_secs_f64() * self.factor;
        self.current = if grown >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(grown)
        };
        delay
    }
}

/// Why an entity ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The source reported a permanent error
    Fatal,
    /// Every attempt failed transiently
    RetriesExhausted,
    /// Shutdown was requested while waiting to retry
    Interrupted,
    /// The worker panicked
    Panicked,
    /// Fetched, but the downstream consumer did not accept the documents
    Handoff,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Fatal => write!(f, "fatal"),
            FailureKind::RetriesExhausted => write!(f, "retries exhausted"),
            FailureKind::Interrupted => write!(f, "interrupted"),
            FailureKind::Panicked => write!(f, "panicked"),
            FailureKind::Handoff => write!(f, "handoff failed"),
        }
    }
}

/// Details of a terminal failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub attempts: u32,
    /// Last failure reason reported by the fetch layer
    pub reason: String,
}

/// Terminal outcome of one entity within a run
#[derive(Debug)]
pub enum FinalOutcome {
    Succeeded { entity: FetchedEntity, attempts: u32 },
    Failed(FailureReport),
}

impl FinalOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FinalOutcome::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            FinalOutcome::Succeeded { attempts, .. } => *attempts,
            FinalOutcome::Failed(report) => report.attempts,
        }
    }

    fn failed(kind: FailureKind, attempts: u32, reason: impl Into<String>) -> Self {
        FinalOutcome::Failed(FailureReport {
            kind,
            attempts,
            reason: reason.into(),
        })
    }

    /// Outcome for an entity whose worker died without reporting
    pub fn panicked(reason: impl Into<String>) -> Self {
        Self::failed(FailureKind::Panicked, 0, reason)
    }
}

/// Wraps [`FetchAttempt`] with the retry state machine
pub struct RetryScheduler {
    attempt: Arc<FetchAttempt>,
    policy: BackoffPolicy,
}

impl RetryScheduler {
    pub fn new(attempt: Arc<FetchAttempt>, policy: BackoffPolicy) -> Self {
        Self { attempt, policy }
    }

    /// Drive one entity to a terminal outcome.
    ///
    /// Cancellation is honoured only between attempts; an attempt that has
    /// started always runs to completion.
    pub async fn run(&self, item: &WorkItem, cancel: &CancellationToken) -> FinalOutcome {
        let mut backoff: Option<BackoffState> = None;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let reason = match self.attempt.run(item).await {
                AttemptOutcome::Success(entity) => {
                    return FinalOutcome::Succeeded { entity, attempts };
                },
                AttemptOutcome::FatalFailure(reason) => {
                    return FinalOutcome::failed(FailureKind::Fatal, attempts, reason);
                },
                AttemptOutcome::RetryableFailure(reason) => reason,
            };

            if attempts >= self.policy.max_retries {
                return FinalOutcome::failed(FailureKind::RetriesExhausted, attempts, reason);
            }

            let delay = backoff
                .get_or_insert_with(|| BackoffState::new(&self.policy))
                .advance();
            warn!(
                entity = %item.key,
                attempt = attempts,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "Transient failure, backing off"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = cancel.cancelled() => {
                    debug!(entity = %item.key, "Shutdown requested during backoff");
                    return FinalOutcome::failed(
                        FailureKind::Interrupted,
                        attempts,
                        format!("interrupted before retry; last error: {reason}"),
                    );
                },
            }
        }
    }
}
