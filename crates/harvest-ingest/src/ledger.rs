//! Durable per-entity progress
//!
//! The ledger is a two-column CSV (`entity_key,processed`) holding exactly
//! one row per entity of the universe. Rows are seeded once and never added
//! or removed; `processed` only ever moves from `false` to `true`.
//!
//! Every write replaces the whole file atomically (temp file in the same
//! directory, fsync, rename, then fsync of the directory), so a crash
//! mid-persist leaves the previous ledger intact. An unreadable ledger halts
//! the run instead of being reset.

use harvest_common::{EntityKey, EntityStatus};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("ledger {path} does not exist")]
    Missing { path: PathBuf },

    #[error(
        "ledger {path} does not match the universe ({missing} universe keys absent, {unknown} ledger keys not in universe)"
    )]
    UniverseMismatch {
        path: PathBuf,
        missing: usize,
        unknown: usize,
    },
}

/// Snapshot of run-wide progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.processed as f64 * 100.0 / self.total as f64
        }
    }

    pub fn pending(&self) -> usize {
        self.total - self.processed
    }
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({:.2}%)", self.processed, self.total, self.percent())
    }
}

/// In-memory ledger, in universe order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    rows: Vec<EntityStatus>,
    index: HashMap<EntityKey, usize>,
}

impl Ledger {
    /// Fresh ledger with every key pending; duplicate keys keep their first position
    pub fn seed(keys: impl IntoIterator<Item = EntityKey>) -> Self {
        let mut ledger = Self::default();
        for key in keys {
            if !ledger.index.contains_key(&key) {
                ledger.index.insert(key.clone(), ledger.rows.len());
                ledger.rows.push(EntityStatus::pending(key));
            }
        }
        ledger
    }

    fn from_rows(rows: Vec<EntityStatus>) -> Result<Self, String> {
        let mut index = HashMap::with_capacity(rows.len());
        for (position, row) in rows.iter().enumerate() {
            if index.insert(row.entity_key.clone(), position).is_some() {
                return Err(format!("duplicate entity key {}", row.entity_key));
            }
        }
        Ok(Self { rows, index })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[EntityStatus] {
        &self.rows
    }

    pub fn processed_count(&self) -> usize {
        self.rows.iter().filter(|r| r.processed).count()
    }

    pub fn progress(&self) -> Progress {
        Progress {
            processed: self.processed_count(),
            total: self.len(),
        }
    }

    /// Keys not yet processed, in universe order
    pub fn pending(&self) -> Vec<EntityKey> {
        self.rows
            .iter()
            .filter(|r| !r.processed)
            .map(|r| r.entity_key.clone())
            .collect()
    }

    /// Mark keys processed; returns how many flipped from pending.
    ///
    /// Already-processed keys are a no-op. Unknown keys are ignored.
    pub fn mark_processed<'a>(&mut self, keys: impl IntoIterator<Item = &'a EntityKey>) -> usize {
        let mut flipped = 0;
        for key in keys {
            match self.index.get(key) {
                Some(&i) if !self.rows[i].processed => {
                    self.rows[i].processed = true;
                    flipped += 1;
                },
                Some(_) => {},
                None => warn!(entity = %key, "Ignoring key outside the ledger universe"),
            }
        }
        flipped
    }

    fn check_universe(&self, universe: &[EntityKey], path: &Path) -> Result<(), LedgerError> {
        let universe: HashSet<&EntityKey> = universe.iter().collect();
        let missing = universe
            .iter()
            .filter(|k| !self.index.contains_key(**k))
            .count();
        let unknown = self
            .rows
            .iter()
            .filter(|r| !universe.contains(&r.entity_key))
            .count();

        if missing == 0 && unknown == 0 {
            Ok(())
        } else {
            Err(LedgerError::UniverseMismatch {
                path: path.to_path_buf(),
                missing,
                unknown,
            })
        }
    }
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(alias = "ticker")]
    entity_key: String,
    processed: String,
}

#[derive(Debug, Serialize)]
struct CsvRowRef<'a> {
    entity_key: &'a str,
    processed: bool,
}

/// Flush a directory entry so a completed rename survives power loss
#[cfg(unix)]
fn sync_directory(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

// Directories cannot be opened as files here; rename durability is left to the OS
#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// File-backed ledger storage
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn corrupt(&self, reason: impl Into<String>) -> LedgerError {
        LedgerError::Corrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    /// Read the persisted ledger
    pub fn load(&self) -> Result<Ledger, LedgerError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LedgerError::Missing {
                    path: self.path.clone(),
                })
            },
            Err(e) => return Err(self.io_error(e)),
        };

        let mut reader = csv::Reader::from_reader(file);
        let headers = reader
            .headers()
            .map_err(|e| self.corrupt(format!("unreadable header: {e}")))?
            .clone();
        let has_key = headers.iter().any(|h| h == "entity_key" || h == "ticker");
        if !has_key || !headers.iter().any(|h| h == "processed") {
            return Err(self.corrupt(format!(
                "expected columns entity_key,processed but found {:?}",
                headers.iter().collect::<Vec<_>>()
            )));
        }

        let mut rows = Vec::new();
        for (line, record) in reader.deserialize::<CsvRow>().enumerate() {
            // Header is line 1
            let line = line + 2;
            let record = record.map_err(|e| self.corrupt(format!("line {line}: {e}")))?;
            let entity_key = EntityKey::new(record.entity_key)
                .map_err(|e| self.corrupt(format!("line {line}: {e}")))?;
            let processed = parse_flag(&record.processed).ok_or_else(|| {
                self.corrupt(format!(
                    "line {line}: invalid processed flag {:?}",
                    record.processed
                ))
            })?;
            rows.push(EntityStatus {
                entity_key,
                processed,
            });
        }

        Ledger::from_rows(rows).map_err(|reason| self.corrupt(reason))
    }

    /// Load the ledger, creating it with every key pending when absent.
    ///
    /// An existing ledger must cover exactly `universe`.
    pub fn load_or_seed(&self, universe: &[EntityKey]) -> Result<Ledger, LedgerError> {
        match self.load() {
            Ok(ledger) => {
                ledger.check_universe(universe, &self.path)?;
                Ok(ledger)
            },
            Err(LedgerError::Missing { .. }) => {
                let ledger = Ledger::seed(universe.iter().cloned());
                self.persist(&ledger)?;
                info!(
                    path = %self.path.display(),
                    entities = ledger.len(),
                    "Seeded new ledger"
                );
                Ok(ledger)
            },
            Err(e) => Err(e),
        }
    }

    /// Atomically replace the persisted ledger
    pub fn persist(&self, ledger: &Ledger) -> Result<(), LedgerError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| self.io_error(e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| self.io_error(e))?;
        {
            let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
            for row in ledger.rows() {
                writer
                    .serialize(CsvRowRef {
                        entity_key: row.entity_key.as_str(),
                        processed: row.processed,
                    })
                    .map_err(|e| self.io_error(std::io::Error::other(e)))?;
            }
            writer.flush().map_err(|e| self.io_error(e))?;
        }
        tmp.as_file_mut().flush().map_err(|e| self.io_error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_error(e.error))?;
        sync_directory(&dir).map_err(|e| self.io_error(e))?;

        Ok(())
    }
}
