//! Per-entity document directories
//!
//! Layout under the documents root:
//!
//! ```text
//! <root>/<entity_key>/manifest.json
//! <root>/<entity_key>/<form>/<accession>/<document>
//! <root>/.staging/<entity_key>-XXXXXX/     (in-flight attempts)
//! ```
//!
//! Attempts write into a private staging directory which is renamed into
//! place only once every document is on disk. A failed, cancelled or
//! panicked attempt drops its staging directory, so `<root>/<entity_key>`
//! is either absent or complete.

use crate::source::FetchedDocument;
use chrono::{DateTime, Utc};
use harvest_common::{EntityKey, WorkItem};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use tempfile::TempDir;
use tracing::{debug, warn};

const STAGING_DIR: &str = ".staging";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Contents of `manifest.json`, written last into a completed entity directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityManifest {
    pub entity_key: EntityKey,
    pub registry_id: u64,
    pub title: String,
    pub fetched_at: DateTime<Utc>,
    pub documents: Vec<FetchedDocument>,
}

impl EntityManifest {
    pub fn total_bytes(&self) -> u64 {
        self.documents.iter().map(|d| d.size).sum()
    }
}

/// An entity directory that has been moved into place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedEntity {
    pub key: EntityKey,
    pub directory: PathBuf,
    pub manifest: EntityManifest,
}

/// Documents root, partitioned by entity key
#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn entity_dir(&self, key: &EntityKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Create an empty private directory for one attempt.
    ///
    /// The directory is removed when the returned guard drops unless it was
    /// committed first.
    pub fn stage(&self, key: &EntityKey) -> io::Result<TempDir> {
        let staging_root = self.staging_root();
        std::fs::create_dir_all(&staging_root)?;
        tempfile::Builder::new()
            .prefix(&format!("{key}-"))
            .tempdir_in(staging_root)
    }

    /// Write the manifest and move a staged directory to its final location.
    ///
    /// An existing directory for the entity (left by a previous run whose
    /// downstream consumer did not remove it) is replaced.
    pub fn commit(
        &self,
        item: &WorkItem,
        staging: TempDir,
        documents: Vec<FetchedDocument>,
    ) -> io::Result<FetchedEntity> {
        let manifest = EntityManifest {
            entity_key: item.key.clone(),
            registry_id: item.registry_id,
            title: item.title.clone(),
            fetched_at: Utc::now(),
            documents,
        };

        let manifest_json = serde_json::to_vec_pretty(&manifest).map_err(io::Error::other)?;
        std::fs::write(staging.path().join(MANIFEST_FILE), manifest_json)?;

        let target = self.entity_dir(&item.key);
        if target.exists() {
            debug!(entity = %item.key, path = %target.display(), "Replacing existing entity directory");
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(staging.path(), &target)?;
        // The guard's cleanup now targets a path that no longer exists.
        drop(staging);

        Ok(FetchedEntity {
            key: item.key.clone(),
            directory: target,
            manifest,
        })
    }

    /// Remove staging directories abandoned by a crashed process.
    ///
    /// Must not run while attempts are in flight.
    pub fn sweep_staging(&self) -> io::Result<usize> {
        let staging_root = self.staging_root();
        let entries = match std::fs::read_dir(&staging_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            match std::fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale staging directory"),
            }
        }
        Ok(removed)
    }
}
