//! Delivery of fetched entities to the downstream consumer
//!
//! An entity only counts as processed once its handoff succeeded. When
//! delivery fails the entity stays pending in the ledger and is fetched
//! again on the next run.

use crate::store::FetchedEntity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_common::EntityKey;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Consumer of completed entity directories
#[async_trait]
pub trait DocumentHandoff: Send + Sync {
    async fn deliver(&self, entity: &FetchedEntity) -> anyhow::Result<()>;
}

/// One line of the handoff queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub entity_key: EntityKey,
    pub registry_id: u64,
    pub directory: PathBuf,
    pub documents: usize,
    pub total_bytes: u64,
    pub fetched_at: DateTime<Utc>,
}

impl From<&FetchedEntity> for HandoffRecord {
    fn from(entity: &FetchedEntity) -> Self {
        Self {
            entity_key: entity.key.clone(),
            registry_id: entity.manifest.registry_id,
            directory: entity.directory.clone(),
            documents: entity.manifest.documents.len(),
            total_bytes: entity.manifest.total_bytes(),
            fetched_at: entity.manifest.fetched_at,
        }
    }
}

/// Appends a [`HandoffRecord`] per entity to a JSON lines file that the
/// consumer tails. Directories are left in place for the consumer.
pub struct JsonLinesHandoff {
    path: PathBuf,
    // Serializes appends so records never interleave
    write_lock: Mutex<()>,
}

impl JsonLinesHandoff {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DocumentHandoff for JsonLinesHandoff {
    async fn deliver(&self, entity: &FetchedEntity) -> anyhow::Result<()> {
        let record = HandoffRecord::from(entity);
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        serde_jsonlines::append_json_lines(&self.path, [&record])?;

        debug!(entity = %entity.key, queue = %self.path.display(), "Queued entity for processing");
        Ok(())
    }
}

/// Deletes the entity directory once fetched.
///
/// Used when the documents have no consumer beyond the fetch itself, e.g.
/// when only the ledger is of interest.
#[derive(Debug, Default)]
pub struct PurgeHandoff;

#[async_trait]
impl DocumentHandoff for PurgeHandoff {
    async fn deliver(&self, entity: &FetchedEntity) -> anyhow::Result<()> {
        match tokio::fs::remove_dir_all(&entity.directory).await {
            Ok(()) => {
                debug!(entity = %entity.key, path = %entity.directory.display(), "Removed entity directory");
                Ok(())
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
