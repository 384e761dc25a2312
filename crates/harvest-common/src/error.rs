//! Error types for Harvest

use thiserror::Error;

/// Result type alias for Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Main error type shared by the Harvest crates
#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid entity key {key:?}: {reason}")]
    InvalidEntityKey { key: String, reason: &'static str },

    #[error("Configuration error: {0}")]
    Config(String),
}
