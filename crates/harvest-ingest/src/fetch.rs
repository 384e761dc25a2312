//! One request cycle for one entity

use crate::rate_limit::RateLimiter;
use crate::source::{DocumentSource, FailureClass};
use crate::store::{DocumentStore, FetchedEntity};
use harvest_common::WorkItem;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Result of a single attempt. Consumed by the retry scheduler, never persisted.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success(FetchedEntity),
    RetryableFailure(String),
    FatalFailure(String),
}

/// Random delay range, sampled uniformly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Jitter {
    pub min: Duration,
    pub max: Duration,
}

impl Jitter {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    pub async fn sleep(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Runs one fetch of one entity: jitter, fetch into staging, commit
pub struct FetchAttempt {
    source: Arc<dyn DocumentSource>,
    limiter: Arc<RateLimiter>,
    store: DocumentStore,
    jitter: Jitter,
}

impl FetchAttempt {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        limiter: Arc<RateLimiter>,
        store: DocumentStore,
        jitter: Jitter,
    ) -> Self {
        Self {
            source,
            limiter,
            store,
            jitter,
        }
    }

    pub async fn run(&self, item: &WorkItem) -> AttemptOutcome {
        // Desynchronize workers before touching the source
        self.jitter.sleep().await;

        let staging = match self.store.stage(&item.key) {
            Ok(staging) => staging,
            Err(e) => {
                return AttemptOutcome::FatalFailure(format!(
                    "failed to create staging directory: {e}"
                ))
            },
        };

        let documents = match self.source.fetch(item, staging.path(), &self.limiter).await {
            Ok(documents) => documents,
            Err(e) => {
                debug!(entity = %item.key, error = %e, "Fetch attempt failed");
                return match e.class() {
                    FailureClass::Retryable => AttemptOutcome::RetryableFailure(e.to_string()),
                    FailureClass::Fatal => AttemptOutcome::FatalFailure(e.to_string()),
                };
            },
        };

        match self.store.commit(item, staging, documents) {
            Ok(fetched) => AttemptOutcome::Success(fetched),
            Err(e) => AttemptOutcome::FatalFailure(format!("failed to commit documents: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FetchError, FetchedDocument};
    use async_trait::async_trait;
    use harvest_common::EntityKey;
    use std::path::{Path, PathBuf};

    /// Writes a document, then fails with the configured error
    struct HalfWrite(fn() -> FetchError);

    #[async_trait]
    impl DocumentSource for HalfWrite {
        async fn fetch(
            &self,
            _item: &WorkItem,
            dest: &Path,
            gate: &RateLimiter,
        ) -> Result<Vec<FetchedDocument>, FetchError> {
            gate.acquire().await;
            std::fs::write(dest.join("partial.htm"), b"<html>")?;
            Err((self.0)())
        }
    }

    struct OneDocument;

    #[async_trait]
    impl DocumentSource for OneDocument {
        async fn fetch(
            &self,
            _item: &WorkItem,
            dest: &Path,
            gate: &RateLimiter,
        ) -> Result<Vec<FetchedDocument>, FetchError> {
            gate.acquire().await;
            std::fs::write(dest.join("doc.htm"), b"<html></html>")?;
            Ok(vec![FetchedDocument {
                relative_path: PathBuf::from("doc.htm"),
                size: 13,
                sha256: String::new(),
                source_url: "mem://doc".to_string(),
            }])
        }
    }

    fn attempt(source: Arc<dyn DocumentSource>, root: &Path) -> FetchAttempt {
        FetchAttempt::new(
            source,
            Arc::new(RateLimiter::unthrottled()),
            DocumentStore::new(root),
            Jitter::none(),
        )
    }

    fn item() -> WorkItem {
        WorkItem::new(EntityKey::new("AAPL").unwrap(), "Apple Inc.", 320193)
    }

    #[test]
    fn test_jitter_sample_within_range() {
        let jitter = Jitter::new(Duration::from_millis(10), Duration::from_millis(20));
        for _ in 0..100 {
            let d = jitter.sample();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
        assert_eq!(Jitter::none().sample(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_success_materializes_entity_directory() {
        let root = tempfile::tempdir().unwrap();
        let attempt = attempt(Arc::new(OneDocument), root.path());

        match attempt.run(&item()).await {
            AttemptOutcome::Success(fetched) => {
                assert_eq!(fetched.directory, root.path().join("AAPL"));
                assert!(fetched.directory.join("doc.htm").exists());
                assert_eq!(fetched.manifest.documents.len(), 1);
            },
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retryable_failure_leaves_no_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let attempt = attempt(
            Arc::new(HalfWrite(|| FetchError::RateLimited {
                status: 429,
                url: "u".into(),
            })),
            root.path(),
        );

        assert!(matches!(
            attempt.run(&item()).await,
            AttemptOutcome::RetryableFailure(_)
        ));
        assert!(!root.path().join("AAPL").exists());
        assert_eq!(std::fs::read_dir(root.path().join(".staging")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fatal_failure_is_classified() {
        let root = tempfile::tempdir().unwrap();
        let attempt = attempt(
            Arc::new(HalfWrite(|| FetchError::NotFound("CIK0000000001".into()))),
            root.path(),
        );

        match attempt.run(&item()).await {
            AttemptOutcome::FatalFailure(reason) => assert!(reason.contains("not found")),
            other => panic!("expected fatal failure, got {other:?}"),
        }
        assert!(!root.path().join("AAPL").exists());
    }
}
