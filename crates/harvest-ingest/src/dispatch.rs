//! Bounded-concurrency fan-out of work items
//!
//! Every item runs on its own task so a panic in the fetch layer is confined
//! to that entity; at most `concurrency` tasks are in flight at any time and
//! outcomes are yielded in completion order.

use crate::retry::{FinalOutcome, RetryScheduler};
use futures::stream::{self, Stream, StreamExt};
use harvest_common::{EntityKey, WorkItem};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Upper bound on entities in flight, whatever the configuration asks for
pub const MAX_CONCURRENCY: usize = 64;

/// Default worker count: a small multiple of available parallelism.
///
/// Workers mostly wait on the rate limiter and the network, so running more
/// of them than cores is harmless; the cap bounds open connections.
pub fn default_concurrency() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores * 2).clamp(2, 32)
}

/// Fans work items out to the retry scheduler
#[derive(Clone)]
pub struct Dispatcher {
    scheduler: Arc<RetryScheduler>,
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(scheduler: Arc<RetryScheduler>, concurrency: usize) -> Self {
        Self {
            scheduler,
            concurrency: concurrency.clamp(1, MAX_CONCURRENCY),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Submit `items` and yield `(key, outcome)` pairs as entities finish.
    ///
    /// Once `cancel` fires no further items are started; entities already in
    /// flight still report an outcome.
    pub fn dispatch(
        &self,
        items: Vec<WorkItem>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = (EntityKey, FinalOutcome)> + Send + 'static {
        let scheduler = self.scheduler.clone();
        let admit = cancel.clone();

        stream::iter(items)
            .take_while(move |_| futures::future::ready(!admit.is_cancelled()))
            .map(move |item| {
                let scheduler = scheduler.clone();
                let cancel = cancel.clone();
                async move {
                    let key = item.key.clone();
                    let task = tokio::spawn(async move { scheduler.run(&item, &cancel).await });
                    match task.await {
                        Ok(outcome) => (key, outcome),
                        Err(join_error) => {
                            error!(entity = %key, error = %join_error, "Worker task aborted");
                            let outcome =
                                FinalOutcome::panicked(format!("worker task aborted: {join_error}"));
                            (key, outcome)
                        },
                    }
                }
            })
            .buffer_unordered(self.concurrency)
    }
}
