//! Cache Store Module
//!
//! Content-addressed on-disk store of completed objects.
//!
//! Each committed object is one file named `{key}.cache` under the cache root.
//! Writes go to `{key}.tmp` first and only become visible to lookups after an
//! atomic rename, so a reader never observes a half-written object. The index
//! of committed entries lives in memory and is rebuilt on open by scanning the
//! directory; staged files found at that point belong to an interrupted run and
//! are deleted.
//!
//! Every read session holds a live-reference count on its entry until the
//! returned stream is dropped. Eviction refuses to delete referenced entries.

use crate::cache_types::{
    CacheEntry, CacheKey, ChunkStream, CACHE_FILE_EXTENSION, STAGED_FILE_EXTENSION,
};
use crate::{RelayError, Result};
use bytes::{Bytes, BytesMut};
use dashmap::{DashMap, DashSet};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Index record for one committed object
#[derive(Debug)]
struct IndexRecord {
    path: PathBuf,
    size_bytes: u64,
    created_at: SystemTime,
    last_accessed_at: SystemTime,
    readers: Arc<AtomicUsize>,
}

impl IndexRecord {
    fn to_entry(&self, key: CacheKey) -> CacheEntry {
        CacheEntry {
            key,
            path: self.path.clone(),
            size_bytes: self.size_bytes,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            committed: true,
        }
    }
}

/// Point-in-time view of an entry, as consumed by the eviction sweep
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub entry: CacheEntry,
    pub active_readers: usize,
}

struct StoreInner {
    root: PathBuf,
    chunk_size: usize,
    max_cache_size: u64,
    index: DashMap<CacheKey, IndexRecord>,
    staged: DashSet<CacheKey>,
}

impl StoreInner {
    fn committed_path(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(format!("{}.{}", key.to_hex(), CACHE_FILE_EXTENSION))
    }

    fn staged_path(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(format!("{}.{}", key.to_hex(), STAGED_FILE_EXTENSION))
    }
}

/// Handle to the on-disk cache. Cheap to clone.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    /// Open (or create) the store rooted at `root`.
    ///
    /// Deletes orphan staged files and rebuilds the index from the committed
    /// files found on disk.
    pub async fn open(root: PathBuf, chunk_size: usize, max_cache_size: u64) -> Result<Self> {
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            error!("Failed to create cache directory: path={:?}, error={}", root, e);
            RelayError::IoError(format!("Failed to create cache directory: {}", e))
        })?;

        let scan_root = root.clone();
        let (committed, orphans) = tokio::task::spawn_blocking(move || scan_cache_dir(&scan_root))
            .await
            .map_err(|e| RelayError::InternalError(format!("Cache scan task failed: {}", e)))??;

        let mut removed_orphans = 0usize;
        for orphan in orphans {
            match tokio::fs::remove_file(&orphan).await {
                Ok(()) => removed_orphans += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove staged file {:?}: {}", orphan, e),
            }
        }

        let index = DashMap::new();
        let mut total = 0u64;
        for (key, record) in committed {
            total += record.size_bytes;
            index.insert(key, record);
        }

        info!(
            "Cache store opened: root={:?}, entries={}, bytes={}, orphans_removed={}",
            root,
            index.len(),
            total,
            removed_orphans
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                root,
                chunk_size: chunk_size.max(1),
                max_cache_size,
                index,
                staged: DashSet::new(),
            }),
        })
    }

    /// Committed entry for `key`, if any. Staged writes are never returned.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.index.get(key).map(|record| record.to_entry(*key))
    }

    /// Objects at or above half the cache budget are never cached
    pub fn is_cacheable(&self, size: u64) -> bool {
        u128::from(size) * 2 < u128::from(self.inner.max_cache_size)
    }

    /// Start a staged write for `key`.
    ///
    /// Fails with [`RelayError::AlreadyInProgress`] while another staged write
    /// for the same key is alive.
    pub async fn begin_staged_write(&self, key: CacheKey) -> Result<WriteHandle> {
        if !self.inner.staged.insert(key) {
            return Err(RelayError::AlreadyInProgress(key.to_hex()));
        }

        let temp_path = self.inner.staged_path(&key);
        let final_path = self.inner.committed_path(&key);

        let file = match File::create(&temp_path).await {
            Ok(file) => file,
            Err(e) => {
                self.inner.staged.remove(&key);
                error!(
                    "Failed to create staged cache file: path={:?}, error={}",
                    temp_path, e
                );
                return Err(RelayError::CacheWrite(format!(
                    "Failed to create staged file: {}",
                    e
                )));
            }
        };

        debug!("Staged write started: key={}, path={:?}", key, temp_path);

        Ok(WriteHandle {
            key,
            temp_file: Some(file),
            temp_path,
            final_path,
            bytes_written: 0,
            created_at: SystemTime::now(),
            finalized: false,
            store: Arc::clone(&self.inner),
        })
    }

    /// Open a read session on a committed entry.
    ///
    /// The stream yields chunks of the configured chunk size from offset zero.
    /// `last_accessed_at` is updated once for the session, and the entry is
    /// protected from eviction until the stream is dropped.
    pub async fn read(&self, entry: &CacheEntry) -> Result<ChunkStream> {
        let now = SystemTime::now();
        let (path, guard) = {
            let mut record = self.inner.index.get_mut(&entry.key).ok_or_else(|| {
                RelayError::NotFound(format!("cache entry {} was evicted", entry.key))
            })?;
            record.last_accessed_at = now;
            let guard = ReadGuard::new(Arc::clone(&record.readers));
            (record.path.clone(), guard)
        };

        let file = File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                warn!("Indexed cache file missing on disk: {:?}", path);
                self.inner.index.remove(&entry.key);
                RelayError::NotFound(format!("cache file {:?} is missing", path))
            } else {
                RelayError::IoError(format!("Failed to open cache file {:?}: {}", path, e))
            }
        })?;

        touch_modified(path.clone(), now);

        debug!("Cache read session opened: key={}", entry.key);
        Ok(chunked_file_stream(file, self.inner.chunk_size, guard))
    }

    /// Sum of committed entry sizes
    pub fn committed_bytes(&self) -> u64 {
        self.inner
            .index
            .iter()
            .map(|record| record.size_bytes)
            .sum()
    }

    pub fn entry_count(&self) -> usize {
        self.inner.index.len()
    }

    /// Snapshot of every committed entry together with its reader count
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        self.inner
            .index
            .iter()
            .map(|item| EntrySnapshot {
                entry: item.value().to_entry(*item.key()),
                active_readers: item.value().readers.load(Ordering::SeqCst),
            })
            .collect()
    }

    /// Number of live read sessions on `key`
    pub fn active_readers(&self, key: &CacheKey) -> usize {
        self.inner
            .index
            .get(key)
            .map(|record| record.readers.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Delete a committed entry that has no live readers.
    ///
    /// Returns the reclaimed size, or `None` when the entry is referenced or
    /// no longer indexed.
    pub async fn evict(&self, key: &CacheKey) -> Result<Option<u64>> {
        // remove_if holds the shard lock, so no read session can attach
        // between the reference check and the removal
        let removed = self
            .inner
            .index
            .remove_if(key, |_, record| record.readers.load(Ordering::SeqCst) == 0);

        let Some((key, record)) = removed else {
            return Ok(None);
        };

        match tokio::fs::remove_file(&record.path).await {
            Ok(()) => {
                debug!("Evicted cache entry: key={}, bytes={}", key, record.size_bytes);
                Ok(Some(record.size_bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Cache file already gone during eviction: {:?}", record.path);
                Ok(Some(record.size_bytes))
            }
            Err(e) => {
                let message = format!("Failed to delete cache file {:?}: {}", record.path, e);
                self.inner.index.insert(key, record);
                Err(RelayError::IoError(message))
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn max_cache_size(&self) -> u64 {
        self.inner.max_cache_size
    }

    /// Whether a staged write for `key` is currently alive
    pub fn is_staged(&self, key: &CacheKey) -> bool {
        self.inner.staged.contains(key)
    }
}

/// Staged, uncommitted write of one object.
///
/// Data goes to a temporary file and is only published by [`commit`]. If the
/// handle is dropped without commit or abort, the temporary file is removed.
///
/// [`commit`]: WriteHandle::commit
pub struct WriteHandle {
    key: CacheKey,
    temp_file: Option<File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
    created_at: SystemTime,
    finalized: bool,
    store: Arc<StoreInner>,
}

impl WriteHandle {
    /// Append a chunk to the staged file
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.finalized {
            return Err(RelayError::CacheWrite(
                "Cannot append to a finalized staged write".to_string(),
            ));
        }

        let Some(file) = self.temp_file.as_mut() else {
            return Err(RelayError::CacheWrite(
                "Staged file not available".to_string(),
            ));
        };

        file.write_all(data).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::StorageFull || e.raw_os_error() == Some(28) {
                error!(
                    "Disk full while writing to cache: path={:?}, size={}",
                    self.temp_path,
                    data.len()
                );
                RelayError::CacheWrite(format!(
                    "Disk full: cannot write to cache (attempted {} bytes)",
                    data.len()
                ))
            } else {
                error!(
                    "Failed to append to staged file: path={:?}, error={}",
                    self.temp_path, e
                );
                RelayError::CacheWrite(format!("Failed to write to cache: {}", e))
            }
        })?;

        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Publish the staged file as a committed entry.
    ///
    /// The rename is atomic: the committed path holds either the complete
    /// object or nothing.
    pub async fn commit(mut self) -> Result<CacheEntry> {
        if self.finalized {
            return Err(RelayError::CacheWrite(
                "Staged write already finalized".to_string(),
            ));
        }

        if let Some(mut file) = self.temp_file.take() {
            file.flush().await.map_err(|e| {
                RelayError::CacheWrite(format!("Failed to flush staged file: {}", e))
            })?;
            file.sync_all().await.map_err(|e| {
                RelayError::CacheWrite(format!("Failed to sync staged file: {}", e))
            })?;
        }

        tokio::fs::rename(&self.temp_path, &self.final_path)
            .await
            .map_err(|e| {
                error!(
                    "Failed to rename staged file: temp={:?}, final={:?}, error={}",
                    self.temp_path, self.final_path, e
                );
                RelayError::CacheWrite(format!("Failed to commit cache file: {}", e))
            })?;

        self.finalized = true;
        let now = SystemTime::now();
        let record = IndexRecord {
            path: self.final_path.clone(),
            size_bytes: self.bytes_written,
            created_at: self.created_at,
            last_accessed_at: now,
            readers: Arc::new(AtomicUsize::new(0)),
        };
        let entry = record.to_entry(self.key);
        self.store.index.insert(self.key, record);
        self.store.staged.remove(&self.key);

        info!(
            "Committed cache entry: key={}, bytes={}",
            self.key, self.bytes_written
        );
        Ok(entry)
    }

    /// Discard the staged data
    pub async fn abort(mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        drop(self.temp_file.take());

        match tokio::fs::remove_file(&self.temp_path).await {
            Ok(()) => debug!("Aborted staged write: key={}", self.key),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove staged file: path={:?}, error={}",
                self.temp_path, e
            ),
        }
        self.store.staged.remove(&self.key);
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn staged_path(&self) -> &Path {
        &self.temp_path
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        warn!(
            "Staged write dropped without commit or abort, cleaning up: {:?}",
            self.temp_path
        );
        drop(self.temp_file.take());
        let _ = std::fs::remove_file(&self.temp_path);
        self.store.staged.remove(&self.key);
    }
}

/// Live-reference on an entry, released when the read stream is dropped
struct ReadGuard {
    readers: Arc<AtomicUsize>,
}

impl ReadGuard {
    fn new(readers: Arc<AtomicUsize>) -> Self {
        readers.fetch_add(1, Ordering::SeqCst);
        Self { readers }
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

fn chunked_file_stream(file: File, chunk_size: usize, guard: ReadGuard) -> ChunkStream {
    stream::unfold(Some((file, guard)), move |state| async move {
        let (mut file, guard) = state?;
        let mut buf = BytesMut::with_capacity(chunk_size);
        while buf.len() < chunk_size {
            match file.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    let err = RelayError::IoError(format!("Failed to read cache file: {}", e));
                    return Some((Err(err), None));
                }
            }
        }
        if buf.is_empty() {
            None
        } else {
            let chunk: Bytes = buf.freeze();
            Some((Ok(chunk), Some((file, guard))))
        }
    })
    .boxed()
}

/// Bump the file mtime so LRU order survives a restart. Best effort.
fn touch_modified(path: PathBuf, when: SystemTime) {
    tokio::task::spawn_blocking(move || {
        let result = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(when));
        if let Err(e) = result {
            debug!("Failed to update mtime for {:?}: {}", path, e);
        }
    });
}

type ScanResult = (Vec<(CacheKey, IndexRecord)>, Vec<PathBuf>);

fn scan_cache_dir(root: &Path) -> Result<ScanResult> {
    let mut committed = Vec::new();
    let mut orphans = Vec::new();

    for dir_entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let dir_entry = match dir_entry {
            Ok(dir_entry) => dir_entry,
            Err(e) => {
                warn!("Skipping unreadable cache directory entry: {}", e);
                continue;
            }
        };
        if !dir_entry.file_type().is_file() {
            continue;
        }

        let path = dir_entry.path();
        let extension = path.extension().and_then(|ext| ext.to_str());
        match extension {
            Some(STAGED_FILE_EXTENSION) => orphans.push(path.to_path_buf()),
            Some(CACHE_FILE_EXTENSION) => {
                let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                let key = match CacheKey::from_hex(stem) {
                    Ok(key) => key,
                    Err(_) => {
                        debug!("Ignoring foreign file in cache directory: {:?}", path);
                        continue;
                    }
                };
                let metadata = match dir_entry.metadata() {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        warn!("Failed to stat cache file {:?}: {}", path, e);
                        continue;
                    }
                };
                let modified = metadata.modified().unwrap_or_else(|_| SystemTime::now());
                let created = metadata.created().unwrap_or(modified);
                committed.push((
                    key,
                    IndexRecord {
                        path: path.to_path_buf(),
                        size_bytes: metadata.len(),
                        created_at: created,
                        last_accessed_at: modified,
                        readers: Arc::new(AtomicUsize::new(0)),
                    },
                ));
            }
            _ => {}
        }
    }

    Ok((committed, orphans))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir, chunk_size: usize, max: u64) -> CacheStore {
        CacheStore::open(dir.path().to_path_buf(), chunk_size, max)
            .await
            .unwrap()
    }

    async fn collect(stream: ChunkStream) -> Vec<Bytes> {
        stream.map(|chunk| chunk.unwrap()).collect().await
    }

    fn staged_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .count()
    }

    #[tokio::test]
    async fn test_commit_makes_entry_visible() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4, 1_000_000).await;
        let key = CacheKey::derive(1, 2, "f");

        let mut handle = store.begin_staged_write(key).await.unwrap();
        handle.append(b"hello ").await.unwrap();
        assert!(store.lookup(&key).is_none(), "staged data must be invisible");
        handle.append(b"world").await.unwrap();
        let entry = handle.commit().await.unwrap();

        assert!(entry.committed);
        assert_eq!(entry.size_bytes, 11);
        assert_eq!(store.lookup(&key).unwrap().size_bytes, 11);
        assert!(entry.path.exists());
        assert_eq!(staged_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_read_yields_fixed_size_chunks_from_zero() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4, 1_000_000).await;
        let key = CacheKey::derive(1, 2, "f");

        let mut handle = store.begin_staged_write(key).await.unwrap();
        handle.append(b"0123456789").await.unwrap();
        let entry = handle.commit().await.unwrap();

        let chunks = collect(store.read(&entry).await.unwrap()).await;
        assert_eq!(
            chunks,
            vec![
                Bytes::from_static(b"0123"),
                Bytes::from_static(b"4567"),
                Bytes::from_static(b"89")
            ]
        );

        // A second session restarts from offset zero
        let again = collect(store.read(&entry).await.unwrap()).await;
        assert_eq!(again.concat(), b"0123456789".to_vec());
    }

    #[tokio::test]
    async fn test_read_session_updates_access_once_and_holds_reference() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 2, 1_000_000).await;
        let key = CacheKey::derive(5, 6, "f");

        let mut handle = store.begin_staged_write(key).await.unwrap();
        handle.append(b"abcdef").await.unwrap();
        let entry = handle.commit().await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let mut stream = store.read(&entry).await.unwrap();
        let accessed = store.lookup(&key).unwrap().last_accessed_at;
        assert!(accessed > entry.last_accessed_at);
        assert_eq!(store.active_readers(&key), 1);

        while let Some(chunk) = stream.next().await {
            chunk.unwrap();
            assert_eq!(store.lookup(&key).unwrap().last_accessed_at, accessed);
        }
        drop(stream);
        assert_eq!(store.active_readers(&key), 0);
    }

    #[tokio::test]
    async fn test_concurrent_staged_write_refused() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4, 1_000_000).await;
        let key = CacheKey::derive(1, 1, "dup");

        let first = store.begin_staged_write(key).await.unwrap();
        let second = store.begin_staged_write(key).await;
        assert!(matches!(second, Err(RelayError::AlreadyInProgress(_))));

        first.abort().await;
        let third = store.begin_staged_write(key).await.unwrap();
        third.abort().await;
    }

    #[tokio::test]
    async fn test_drop_without_finalize_removes_staged_file() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4, 1_000_000).await;
        let key = CacheKey::derive(9, 9, "drop");

        {
            let mut handle = store.begin_staged_write(key).await.unwrap();
            handle.append(b"partial").await.unwrap();
        }

        assert_eq!(staged_files(dir.path()), 0);
        assert!(!store.is_staged(&key));
        assert!(store.lookup(&key).is_none());
    }

    #[tokio::test]
    async fn test_open_removes_orphans_and_rebuilds_index() {
        let dir = TempDir::new().unwrap();
        let key = CacheKey::derive(3, 4, "persisted");
        {
            let store = open_store(&dir, 4, 1_000_000).await;
            let mut handle = store.begin_staged_write(key).await.unwrap();
            handle.append(&[7u8; 100]).await.unwrap();
            handle.commit().await.unwrap();
        }
        let orphan = dir.path().join(format!("{}.tmp", CacheKey::derive(0, 0, "x")));
        std::fs::write(&orphan, b"interrupted").unwrap();
        std::fs::write(dir.path().join("README.txt"), b"not ours").unwrap();

        let reopened = open_store(&dir, 4, 1_000_000).await;
        assert!(!orphan.exists());
        assert_eq!(reopened.entry_count(), 1);
        assert_eq!(reopened.lookup(&key).unwrap().size_bytes, 100);
        assert_eq!(reopened.committed_bytes(), 100);
    }

    #[tokio::test]
    async fn test_cacheable_boundary() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4, 1000).await;
        assert!(store.is_cacheable(0));
        assert!(store.is_cacheable(499));
        assert!(!store.is_cacheable(500));
        assert!(!store.is_cacheable(501));
        assert!(!store.is_cacheable(u64::MAX));

        // Odd budgets compare against the exact half
        let odd_dir = TempDir::new().unwrap();
        let odd = open_store(&odd_dir, 4, 1001).await;
        assert!(odd.is_cacheable(500));
        assert!(!odd.is_cacheable(501));
    }

    #[tokio::test]
    async fn test_evict_skips_referenced_entry() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4, 1_000_000).await;
        let key = CacheKey::derive(1, 2, "busy");
        let mut handle = store.begin_staged_write(key).await.unwrap();
        handle.append(b"data").await.unwrap();
        let entry = handle.commit().await.unwrap();

        let stream = store.read(&entry).await.unwrap();
        assert_eq!(store.evict(&key).await.unwrap(), None);
        assert!(store.lookup(&key).is_some());

        drop(stream);
        assert_eq!(store.evict(&key).await.unwrap(), Some(4));
        assert!(store.lookup(&key).is_none());
        assert!(!entry.path.exists());
        assert!(matches!(
            store.read(&entry).await,
            Err(RelayError::NotFound(_))
        ));
    }

    /// An aborted staged write is never visible, whatever was appended
    #[quickcheck]
    fn prop_aborted_write_is_never_visible(payload: Vec<u8>, cut: usize) -> TestResult {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let dir = TempDir::new().unwrap();
            let store = open_store(&dir, 16, 1_000_000).await;
            let key = CacheKey::derive(1, 1, "prop");
            let written = if payload.is_empty() { 0 } else { cut % payload.len() };

            let mut handle = store.begin_staged_write(key).await.unwrap();
            handle.append(&payload[..written]).await.unwrap();
            handle.abort().await;

            TestResult::from_bool(store.lookup(&key).is_none() && staged_files(dir.path()) == 0)
        })
    }

    #[tokio::test]
    async fn test_abort_at_boundaries_leaves_nothing() {
        let object = vec![1u8; 64];
        for written in [0usize, object.len() - 1] {
            let dir = TempDir::new().unwrap();
            let store = open_store(&dir, 16, 1_000_000).await;
            let key = CacheKey::derive(2, 2, "edge");

            let mut handle = store.begin_staged_write(key).await.unwrap();
            handle.append(&object[..written]).await.unwrap();
            handle.abort().await;

            assert!(store.lookup(&key).is_none(), "visible after {} bytes", written);
            assert_eq!(staged_files(dir.path()), 0);
        }
    }
}
