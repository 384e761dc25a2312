//! Checksum utilities for fetched documents

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;

/// Incremental SHA-256 digest, fed chunk by chunk while a document streams to disk
#[derive(Default, Clone)]
pub struct DocumentDigest {
    hasher: Sha256,
    len: u64,
}

impl DocumentDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Number of bytes fed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Consume the digest, returning the lowercase hex encoding
    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Compute the SHA-256 of any readable source
pub fn compute_sha256<R: Read>(reader: &mut R) -> Result<String> {
    let mut digest = DocumentDigest::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        digest.update(&buffer[..bytes_read]);
    }

    Ok(digest.finalize_hex())
}
