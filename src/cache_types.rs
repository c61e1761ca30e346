//! Cache Types Module
//!
//! Typed records shared by the cache store, the pipeline and the catalog:
//! the content-addressed [`CacheKey`], the committed [`CacheEntry`] and the
//! resolved [`MediaRecord`].

use crate::{RelayError, Result};
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

/// A lazy, finite, ordered sequence of byte chunks.
pub type ChunkStream = BoxStream<'static, Result<Bytes>>;

/// Extension for committed cache files
pub const CACHE_FILE_EXTENSION: &str = "cache";

/// Extension for staged (uncommitted) cache files
pub const STAGED_FILE_EXTENSION: &str = "tmp";

/// 256-bit content address for one remote object.
///
/// Derived from the `(channel_id, message_id, remote_file_id)` triple that
/// locates the object upstream, so identical triples map to the same key in
/// every process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Derive the key for an upstream object locator
    pub fn derive(channel_id: i64, message_id: i64, remote_file_id: &str) -> Self {
        let material = format!("{}_{}_{}", channel_id, message_id, remote_file_id);
        CacheKey(*blake3::hash(material.as_bytes()).as_bytes())
    }

    /// Lowercase hex rendering, used as the on-disk file stem
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// Parse a 64-character hex rendering back into a key
    pub fn from_hex(hex: &str) -> Result<Self> {
        blake3::Hash::from_hex(hex)
            .map(|hash| CacheKey(*hash.as_bytes()))
            .map_err(|e| RelayError::InvalidRecord(format!("invalid cache key '{}': {}", hex, e)))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix keeps log lines readable
        write!(f, "CacheKey({})", &self.to_hex()[..16])
    }
}

/// A cache entry as seen from outside the store
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: SystemTime,
    pub last_accessed_at: SystemTime,
    /// Always `true` for entries returned by lookups
    pub committed: bool,
}

/// Upstream location and size of a catalog object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: String,
    pub channel_id: i64,
    pub message_id: i64,
    pub remote_file_id: String,
    pub declared_size: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl MediaRecord {
    /// Create a record, rejecting empty identifiers
    pub fn new(
        id: impl Into<String>,
        channel_id: i64,
        message_id: i64,
        remote_file_id: impl Into<String>,
        declared_size: u64,
    ) -> Result<Self> {
        let record = Self {
            id: id.into(),
            channel_id,
            message_id,
            remote_file_id: remote_file_id.into(),
            declared_size,
            title: None,
            file_name: None,
        };
        record.validate()?;
        Ok(record)
    }

    /// Check the invariants the constructor enforces.
    ///
    /// Records deserialized from a catalog file go through this as well.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RelayError::InvalidRecord("record id is empty".to_string()));
        }
        if self.remote_file_id.trim().is_empty() {
            return Err(RelayError::InvalidRecord(format!(
                "record {} has an empty remote file id",
                self.id
            )));
        }
        Ok(())
    }

    /// Content address of the object this record points at
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::derive(self.channel_id, self.message_id, &self.remote_file_id)
    }
}
