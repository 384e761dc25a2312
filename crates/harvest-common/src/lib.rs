//! Harvest Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Harvest workspace.
//!
//! # Overview
//!
//! This crate provides functionality used by every Harvest workspace member:
//!
//! - **Types**: entity keys, work items and ledger rows
//! - **Error Handling**: the shared error and result types
//! - **Checksums**: SHA-256 digests for fetched documents
//! - **Logging**: tracing subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use harvest_common::{EntityKey, Result};
//! use harvest_common::checksum::compute_sha256;
//!
//! fn digest(key: &str, path: &str) -> Result<()> {
//!     let key = EntityKey::new(key)?;
//!     let digest = compute_sha256(&mut std::fs::File::open(path)?)?;
//!     tracing::info!(entity = %key, %digest, "Document digest");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{HarvestError, Result};
pub use types::{EntityKey, EntityStatus, WorkItem};
