//! Catalog Module
//!
//! The [`MetadataStore`] seam through which the pipeline resolves an opaque
//! object id to its upstream location, and [`CatalogFile`], the concrete store
//! the binary uses: a versioned JSON snapshot loaded into memory.

use crate::cache_types::MediaRecord;
use crate::{RelayError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Snapshot layout version understood by this build
pub const SCHEMA_VERSION: u32 = 1;

/// Resolves object ids to media records
pub trait MetadataStore: Send + Sync + 'static {
    /// Fails with `NotFound` when the id is unknown
    fn resolve(&self, object_id: &str) -> impl Future<Output = Result<MediaRecord>> + Send;
}

/// On-disk form of the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    pub records: Vec<MediaRecord>,
}

/// In-memory catalog backed by a JSON snapshot file
pub struct CatalogFile {
    path: PathBuf,
    records: DashMap<String, MediaRecord>,
}

impl CatalogFile {
    /// Load the snapshot at `path`.
    ///
    /// A missing file yields an empty catalog. A snapshot written with a
    /// different schema version, or holding an invalid record, is rejected.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let records = DashMap::new();

        match tokio::fs::read(&path).await {
            Ok(raw) => {
                let snapshot: CatalogSnapshot = serde_json::from_slice(&raw)?;
                if snapshot.schema_version != SCHEMA_VERSION {
                    return Err(RelayError::ConfigError(format!(
                        "Catalog {:?} has schema version {}, expected {}",
                        path, snapshot.schema_version, SCHEMA_VERSION
                    )));
                }
                for record in snapshot.records {
                    record.validate()?;
                    if let Some(previous) = records.insert(record.id.clone(), record) {
                        warn!("Duplicate catalog id {}, keeping the later record", previous.id);
                    }
                }
                info!(
                    "Catalog loaded: path={:?}, records={}, saved_at={}",
                    path,
                    records.len(),
                    snapshot.saved_at.to_rfc3339()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No catalog at {:?}, starting empty", path);
            }
            Err(e) => {
                return Err(RelayError::IoError(format!(
                    "Failed to read catalog {:?}: {}",
                    path, e
                )))
            }
        }

        Ok(Self { path, records })
    }

    /// Write the catalog to its path through a temporary file and rename
    pub async fn save(&self) -> Result<()> {
        let mut records: Vec<MediaRecord> =
            self.records.iter().map(|item| item.value().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));

        let snapshot = CatalogSnapshot {
            schema_version: SCHEMA_VERSION,
            saved_at: Utc::now(),
            records,
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &json).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(RelayError::IoError(format!(
                "Failed to replace catalog {:?}: {}",
                self.path, e
            )));
        }

        debug!(
            "Catalog saved: path={:?}, records={}",
            self.path,
            snapshot.records.len()
        );
        Ok(())
    }

    /// Add or replace a record
    pub fn insert(&self, record: MediaRecord) -> Result<()> {
        record.validate()?;
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn get(&self, object_id: &str) -> Option<MediaRecord> {
        self.records.get(object_id).map(|record| record.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetadataStore for CatalogFile {
    async fn resolve(&self, object_id: &str) -> Result<MediaRecord> {
        self.get(object_id)
            .ok_or_else(|| RelayError::NotFound(format!("unknown object id '{}'", object_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, message_id: i64) -> MediaRecord {
        let mut record =
            MediaRecord::new(id, -1001, message_id, format!("file-{}", message_id), 1024).unwrap();
        record.title = Some("Night of the Comet".to_string());
        record
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_catalog() {
        let dir = TempDir::new().unwrap();
        let catalog = CatalogFile::load(dir.path().join("catalog.json")).await.unwrap();
        assert!(catalog.is_empty());
        assert!(matches!(
            catalog.resolve("anything").await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_save_then_load_preserves_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("catalog.json");

        let catalog = CatalogFile::load(path.clone()).await.unwrap();
        catalog.insert(record("movie:1", 1)).unwrap();
        catalog.insert(record("movie:2", 2)).unwrap();
        catalog.save().await.unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = CatalogFile::load(path).await.unwrap();
        assert_eq!(reloaded.len(), 2);
        let resolved = reloaded.resolve("movie:2").await.unwrap();
        assert_eq!(resolved, record("movie:2", 2));
    }

    #[tokio::test]
    async fn test_schema_mismatch_fails_loudly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        let snapshot = serde_json::json!({
            "schema_version": SCHEMA_VERSION + 1,
            "saved_at": "2026-01-01T00:00:00Z",
            "records": []
        });
        std::fs::write(&path, snapshot.to_string()).unwrap();

        let result = CatalogFile::load(path).await;
        assert!(matches!(result, Err(RelayError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_invalid_record_rejected_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        let snapshot = serde_json::json!({
            "schema_version": SCHEMA_VERSION,
            "saved_at": "2026-01-01T00:00:00Z",
            "records": [{
                "id": "movie:1",
                "channel_id": 1,
                "message_id": 1,
                "remote_file_id": "",
                "declared_size": 10
            }]
        });
        std::fs::write(&path, snapshot.to_string()).unwrap();

        assert!(matches!(
            CatalogFile::load(path).await,
            Err(RelayError::InvalidRecord(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_rejects_invalid_record() {
        let dir = TempDir::new().unwrap();
        let catalog = CatalogFile::load(dir.path().join("c.json")).await.unwrap();
        let mut bad = record("movie:1", 1);
        bad.remote_file_id.clear();
        assert!(catalog.insert(bad).is_err());
        assert!(catalog.is_empty());
    }
}
