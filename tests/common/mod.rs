//! Shared fixtures for integration tests: a scripted remote source with
//! fetch accounting and an in-memory catalog.

#![allow(dead_code)]

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use media_relay::admission::AdmissionController;
use media_relay::cache_store::CacheStore;
use media_relay::cache_types::{CacheKey, ChunkStream, MediaRecord};
use media_relay::catalog::MetadataStore;
use media_relay::context::RelayContext;
use media_relay::pipeline::{PipelineSettings, StreamPipeline};
use media_relay::remote::RemoteSource;
use media_relay::{RelayError, Result};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How the scripted remote serves one object
#[derive(Clone, Default)]
pub struct Script {
    pub data: Bytes,
    /// Fail the open call with this error
    pub open_error: Option<RelayError>,
    /// Yield this many chunks, then a transient failure
    pub fail_after_chunks: Option<usize>,
    pub chunk_delay: Duration,
}

impl Script {
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }
}

struct RemoteInner {
    scripts: DashMap<(i64, i64), Script>,
    fetches: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    gate: watch::Sender<bool>,
    /// Chunks emitted before each stream waits for the gate to open
    hold_after: AtomicUsize,
}

/// Remote source driven by per-object scripts
#[derive(Clone)]
pub struct ScriptedRemote {
    inner: Arc<RemoteInner>,
}

impl Default for ScriptedRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRemote {
    /// A remote with its gate open
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                scripts: DashMap::new(),
                fetches: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                gate: watch::channel(true).0,
                hold_after: AtomicUsize::new(usize::MAX),
            }),
        }
    }

    /// Every stream pauses after `chunks` chunks until [`open_gate`] is called
    ///
    /// [`open_gate`]: ScriptedRemote::open_gate
    pub fn hold_after(&self, chunks: usize) {
        self.inner.hold_after.store(chunks, Ordering::SeqCst);
        self.inner.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.inner.gate.send_replace(true);
    }

    pub fn script(&self, record: &MediaRecord, script: Script) {
        self.inner
            .scripts
            .insert((record.channel_id, record.message_id), script);
    }

    /// Number of `fetch` calls made so far
    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    /// Streams currently open
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Most streams ever open at once
    pub fn peak_active(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }
}

struct ActiveGuard {
    inner: Arc<RemoteInner>,
}

impl ActiveGuard {
    fn new(inner: Arc<RemoteInner>) -> Self {
        let now = inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak.fetch_max(now, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct StreamState {
    chunks: Vec<Bytes>,
    next: usize,
    script: Script,
    gate: watch::Receiver<bool>,
    hold_after: usize,
    _active: ActiveGuard,
}

impl RemoteSource for ScriptedRemote {
    async fn fetch(
        &self,
        channel_id: i64,
        message_id: i64,
        chunk_size: usize,
    ) -> Result<ChunkStream> {
        self.inner.fetches.fetch_add(1, Ordering::SeqCst);
        let script = self
            .inner
            .scripts
            .get(&(channel_id, message_id))
            .map(|script| script.clone())
            .ok_or_else(|| RelayError::NotFound(format!("{}/{}", channel_id, message_id)))?;
        if let Some(err) = script.open_error.clone() {
            return Err(err);
        }

        let chunks: Vec<Bytes> = script
            .data
            .chunks(chunk_size.max(1))
            .map(Bytes::copy_from_slice)
            .collect();
        let state = StreamState {
            chunks,
            next: 0,
            script,
            gate: self.inner.gate.subscribe(),
            hold_after: self.inner.hold_after.load(Ordering::SeqCst),
            _active: ActiveGuard::new(Arc::clone(&self.inner)),
        };

        Ok(stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            if state.next >= state.hold_after {
                let _ = state.gate.wait_for(|open| *open).await;
            }
            if !state.script.chunk_delay.is_zero() {
                tokio::time::sleep(state.script.chunk_delay).await;
            }
            if state.script.fail_after_chunks == Some(state.next) {
                let err = RelayError::TransientUpstream("connection reset".to_string());
                return Some((Err(err), None));
            }
            let chunk = state.chunks.get(state.next)?.clone();
            state.next += 1;
            Some((Ok(chunk), Some(state)))
        })
        .boxed())
    }
}

/// Catalog held in memory
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    records: Arc<DashMap<String, MediaRecord>>,
}

impl MemoryCatalog {
    pub fn insert(&self, record: MediaRecord) {
        self.records.insert(record.id.clone(), record);
    }
}

impl MetadataStore for MemoryCatalog {
    async fn resolve(&self, object_id: &str) -> Result<MediaRecord> {
        self.records
            .get(object_id)
            .map(|record| record.clone())
            .ok_or_else(|| RelayError::NotFound(object_id.to_string()))
    }
}

/// Deterministic payload of `len` bytes
pub fn payload(len: usize, seed: u8) -> Bytes {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect::<Vec<u8>>()
        .into()
}

pub fn record(id: &str, message_id: i64, declared_size: u64) -> MediaRecord {
    MediaRecord::new(id, -100777, message_id, format!("file-{}", message_id), declared_size)
        .expect("valid test record")
}

pub struct Harness {
    pub pipeline: StreamPipeline<MemoryCatalog, ScriptedRemote>,
    pub catalog: MemoryCatalog,
    pub remote: ScriptedRemote,
    pub context: RelayContext,
}

impl Harness {
    pub async fn new(cache_dir: &Path, max_cache_size: u64, max_concurrent: usize) -> Self {
        Self::with_timeouts(
            cache_dir,
            max_cache_size,
            max_concurrent,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
    }

    /// Harness with explicit per-chunk upstream and subscriber stall timeouts
    pub async fn with_timeouts(
        cache_dir: &Path,
        max_cache_size: u64,
        max_concurrent: usize,
        chunk_timeout: Duration,
        stall_timeout: Duration,
    ) -> Self {
        let store = CacheStore::open(cache_dir.to_path_buf(), 16, max_cache_size)
            .await
            .expect("open cache store");
        let context = RelayContext::new(AdmissionController::new(max_concurrent, Duration::ZERO), store)
            .with_stall_timeout(stall_timeout);
        let catalog = MemoryCatalog::default();
        let remote = ScriptedRemote::new();
        let pipeline = StreamPipeline::new(
            context.clone(),
            catalog.clone(),
            remote.clone(),
            PipelineSettings {
                chunk_size: 16,
                chunk_timeout,
            },
        );
        Self {
            pipeline,
            catalog,
            remote,
            context,
        }
    }

    /// Register an object in both the catalog and the remote
    pub fn add_object(&self, id: &str, message_id: i64, script: Script) -> MediaRecord {
        let record = record(id, message_id, script.data.len() as u64);
        self.catalog.insert(record.clone());
        self.remote.script(&record, script);
        record
    }

    pub fn key_of(&self, record: &MediaRecord) -> CacheKey {
        record.cache_key()
    }
}

/// Collect a whole body, failing on the first error item
pub async fn collect_ok(stream: impl futures::Stream<Item = Result<Bytes>> + Unpin) -> Bytes {
    let chunks: Vec<Bytes> = stream
        .map(|chunk| chunk.expect("chunk"))
        .collect()
        .await;
    chunks.concat().into()
}

/// Poll `condition` every few milliseconds until it holds
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Files in `dir` with the given extension
pub fn files_with_extension(dir: &Path, extension: &str) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| {
                    entry.path().extension().and_then(|ext| ext.to_str()) == Some(extension)
                })
                .count()
        })
        .unwrap_or(0)
}
