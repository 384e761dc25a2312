//! Common types used across Harvest

use crate::error::HarvestError;
use serde::{Deserialize, Serialize};

/// Identifier naming one unit of work (a ticker symbol, e.g. `AAPL`).
///
/// Keys double as directory names under the documents root, so they are
/// validated on construction: non-empty, no path separators, no `.`/`..`,
/// no whitespace or control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(key: impl Into<String>) -> Result<Self, HarvestError> {
        let key = key.into();
        let reason = if key.is_empty() {
            Some("key is empty")
        } else if key == "." || key == ".." {
            Some("key is a relative path component")
        } else if key.contains(['/', '\\']) {
            Some("key contains a path separator")
        } else if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
            Some("key contains whitespace or control characters")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(HarvestError::InvalidEntityKey { key, reason }),
            None => Ok(Self(key)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EntityKey {
    type Error = HarvestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityKey> for String {
    fn from(key: EntityKey) -> Self {
        key.0
    }
}

impl std::str::FromStr for EntityKey {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for EntityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One unit of work submitted to the dispatcher.
///
/// Built once per run from the catalog and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Entity key (ticker)
    pub key: EntityKey,

    /// Display title, e.g. the company name
    pub title: String,

    /// Numeric registry id (SEC CIK)
    pub registry_id: u64,
}

impl WorkItem {
    pub fn new(key: EntityKey, title: impl Into<String>, registry_id: u64) -> Self {
        Self {
            key,
            title: title.into(),
            registry_id,
        }
    }
}

/// One persisted ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStatus {
    pub entity_key: EntityKey,
    pub processed: bool,
}

impl EntityStatus {
    pub fn pending(entity_key: EntityKey) -> Self {
        Self {
            entity_key,
            processed: false,
        }
    }
}
