//! Entity catalog loading
//!
//! The catalog is the SEC `company_tickers.json` file:
//!
//! ```json
//! {"0": {"cik_str": 320193, "ticker": "AAPL", "title": "Apple Inc."}, ...}
//! ```
//!
//! A plain JSON array of the same entries is accepted too. The order of the
//! resulting universe follows the numeric keys (or array order), and is the
//! order entities are submitted in.

use harvest_common::{EntityKey, WorkItem};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("catalog contains no usable entities")]
    Empty,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(deserialize_with = "registry_id")]
    cik_str: u64,
    ticker: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    Indexed(BTreeMap<String, CatalogEntry>),
    List(Vec<CatalogEntry>),
}

/// CIKs show up both as numbers and as zero-padded strings
fn registry_id<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn ordered_entries(file: CatalogFile) -> Vec<CatalogEntry> {
    match file {
        CatalogFile::List(entries) => entries,
        CatalogFile::Indexed(map) => {
            let mut indexed: Vec<(u64, String, CatalogEntry)> = map
                .into_iter()
                .map(|(k, v)| (k.parse().unwrap_or(u64::MAX), k, v))
                .collect();
            // Numeric order, non-numeric keys last in lexical order
            indexed.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
            indexed.into_iter().map(|(_, _, entry)| entry).collect()
        },
    }
}

/// Build the run universe from catalog JSON.
///
/// Entries with an invalid or repeated ticker are skipped with a warning.
/// `limit` keeps only the first N entities.
pub fn parse_catalog(json: &str, limit: Option<usize>) -> Result<Vec<WorkItem>, CatalogError> {
    let file: CatalogFile = serde_json::from_str(json)?;

    let mut seen = HashSet::new();
    let mut items = Vec::new();
    let mut skipped = 0usize;

    for entry in ordered_entries(file) {
        if limit.is_some_and(|limit| items.len() >= limit) {
            break;
        }

        let key = match EntityKey::new(entry.ticker.trim()) {
            Ok(key) => key,
            Err(e) => {
                warn!(ticker = %entry.ticker, error = %e, "Skipping catalog entry");
                skipped += 1;
                continue;
            },
        };
        if !seen.insert(key.clone()) {
            warn!(ticker = %key, "Skipping duplicate catalog entry");
            skipped += 1;
            continue;
        }

        items.push(WorkItem::new(key, entry.title, entry.cik_str));
    }

    if items.is_empty() {
        return Err(CatalogError::Empty);
    }
    if skipped > 0 {
        warn!(skipped, "Catalog entries skipped");
    }
    Ok(items)
}

/// Read and parse the catalog file
pub async fn load_catalog(
    path: &Path,
    limit: Option<usize>,
) -> Result<Vec<WorkItem>, CatalogError> {
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let items = parse_catalog(&json, limit)?;
    info!(path = %path.display(), entities = items.len(), "Loaded catalog");
    Ok(items)
}
