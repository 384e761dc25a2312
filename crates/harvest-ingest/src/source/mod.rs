//! External document sources
//!
//! A [`DocumentSource`] knows how to pull every document belonging to one
//! entity into a directory. Its errors carry the retry classification used
//! by the fetch layer: rate limiting and network trouble are worth another
//! try, everything else is not.
//!
//! EDGAR answers an exceeded request rate with HTTP 403 ("Request Rate
//! Threshold Exceeded") as well as 429, so both count as rate limiting.

pub mod edgar;

use crate::rate_limit::RateLimiter;
use async_trait::async_trait;
use harvest_common::WorkItem;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use edgar::{EdgarConfig, EdgarSource};

/// Whether a failed attempt may succeed if repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    Fatal,
}

/// Error raised by a document source for one entity
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited by source (HTTP {status}): {url}")]
    RateLimited { status: u16, url: String },

    #[error("source unavailable (HTTP {status}): {url}")]
    Unavailable { status: u16, url: String },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request rejected (HTTP {status}): {url}")]
    Rejected { status: u16, url: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("failed to write documents: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Classify an unsuccessful HTTP status
    pub fn from_status(status: StatusCode, url: &str) -> Self {
        let url = url.to_string();
        match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN => FetchError::RateLimited {
                status: status.as_u16(),
                url,
            },
            StatusCode::NOT_FOUND | StatusCode::GONE => FetchError::NotFound(url),
            StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => FetchError::Unavailable {
                status: status.as_u16(),
                url,
            },
            _ => FetchError::Rejected {
                status: status.as_u16(),
                url,
            },
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            FetchError::RateLimited { .. }
            | FetchError::Unavailable { .. }
            | FetchError::Timeout(_)
            | FetchError::Connection(_) => FailureClass::Retryable,
            FetchError::NotFound(_)
            | FetchError::Rejected { .. }
            | FetchError::Malformed(_)
            | FetchError::Io(_) => FailureClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Retryable
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        if let Some(status) = err.status() {
            return FetchError::from_status(status, &url);
        }
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else if err.is_decode() {
            FetchError::Malformed(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() {
            // Body errors are connections dropped mid-transfer
            FetchError::Connection(err.to_string())
        } else {
            FetchError::Malformed(err.to_string())
        }
    }
}

/// One document written by a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedDocument {
    /// Path relative to the entity directory
    pub relative_path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub source_url: String,
}

/// Pulls the document set of one entity from the external source.
///
/// Implementations must call [`RateLimiter::acquire`] on `gate` before every
/// request they issue, and write only below `dest`, which is an empty
/// directory owned by the caller for the duration of the call.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(
        &self,
        item: &WorkItem,
        dest: &Path,
        gate: &RateLimiter,
    ) -> Result<Vec<FetchedDocument>, FetchError>;
}
