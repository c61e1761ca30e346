//! Stream Pipeline Module
//!
//! Per-request orchestration: resolve the object, serve it from the cache on
//! a hit, otherwise join or start the shared remote fetch for its key.
//!
//! A fetch run moves through admission, the remote read and the tee. Each
//! chunk goes to every subscriber and, for cacheable objects, to a staged
//! cache write. The staged write is committed only after the remote sequence
//! ended normally with the declared number of bytes; every other exit path
//! aborts it. The admission permit is scoped to the run and is released on
//! every exit path.

use crate::cache_types::{ChunkStream, MediaRecord};
use crate::catalog::MetadataStore;
use crate::context::RelayContext;
use crate::inflight::{FlightOutcome, FlightSink, Joined};
use crate::remote::RemoteSource;
use crate::{RelayError, Result};
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tunables the pipeline reads on every run
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub chunk_size: usize,
    /// Longest wait for one remote chunk before the fetch is failed
    pub chunk_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            chunk_timeout: Duration::from_secs(60),
        }
    }
}

/// Where the bytes of a response come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Cache,
    Remote,
}

impl StreamSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamSource::Cache => "HIT",
            StreamSource::Remote => "MISS",
        }
    }
}

/// Body of one served object
pub struct MediaStream {
    source: StreamSource,
    declared_size: u64,
    chunks: ChunkStream,
}

impl MediaStream {
    pub fn source(&self) -> StreamSource {
        self.source
    }

    /// Object size as known before streaming; zero when unknown
    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn into_chunks(self) -> ChunkStream {
        self.chunks
    }
}

impl Stream for MediaStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.chunks.poll_next_unpin(cx)
    }
}

struct PipelineInner<M, R> {
    context: RelayContext,
    catalog: M,
    remote: R,
    settings: PipelineSettings,
}

/// Serves objects from the cache or through a shared remote fetch
pub struct StreamPipeline<M, R> {
    inner: Arc<PipelineInner<M, R>>,
}

impl<M, R> Clone for StreamPipeline<M, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M, R> StreamPipeline<M, R>
where
    M: MetadataStore,
    R: RemoteSource,
{
    pub fn new(context: RelayContext, catalog: M, remote: R, settings: PipelineSettings) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                context,
                catalog,
                remote,
                settings,
            }),
        }
    }

    pub fn context(&self) -> &RelayContext {
        &self.inner.context
    }

    pub fn catalog(&self) -> &M {
        &self.inner.catalog
    }

    /// Serve one object.
    ///
    /// Resolves once the first chunk is available, so a failure before any
    /// byte was produced comes back as an error. Later failures show up as an
    /// `Err` item in the stream.
    pub async fn serve(&self, object_id: &str) -> Result<MediaStream> {
        let record = self.inner.catalog.resolve(object_id).await?;
        let key = record.cache_key();
        let store = &self.inner.context.store;

        loop {
            if let Some(entry) = store.lookup(&key) {
                match store.read(&entry).await {
                    Ok(chunks) => {
                        info!(
                            "Cache hit: object_id={}, key={:?}, bytes={}",
                            object_id, key, entry.size_bytes
                        );
                        return Ok(MediaStream {
                            source: StreamSource::Cache,
                            declared_size: entry.size_bytes,
                            chunks,
                        });
                    }
                    Err(RelayError::NotFound(_)) => {
                        debug!("Entry evicted between lookup and read: key={:?}", key);
                    }
                    Err(e) => return Err(e),
                }
            }

            let inner = Arc::clone(&self.inner);
            let fetch_record = record.clone();
            let joined = self
                .inner
                .context
                .dedup
                .join_or_start(key, move |sink| run_fetch(inner, fetch_record, sink));

            match joined {
                Joined::Live(mut subscription) => {
                    if subscription.is_leader() {
                        info!("Cache miss, fetching: object_id={}, key={:?}", object_id, key);
                    } else {
                        debug!("Joined in-flight fetch: object_id={}, key={:?}", object_id, key);
                    }
                    let first = match subscription.next().await {
                        Some(Ok(chunk)) => Some(chunk),
                        Some(Err(e)) => return Err(e),
                        None => None,
                    };
                    let chunks = stream::iter(first.map(Ok)).chain(subscription).boxed();
                    return Ok(MediaStream {
                        source: StreamSource::Remote,
                        declared_size: record.declared_size,
                        chunks,
                    });
                }
                Joined::Wait(waiter) => {
                    if store.is_cacheable(record.declared_size) {
                        debug!(
                            "Fetch already streaming, waiting for it to finish: key={:?}",
                            key
                        );
                    } else {
                        info!(
                            "Object too large to cache, waiting for the current transfer before refetching: object_id={}, key={:?}",
                            object_id, key
                        );
                    }
                    match waiter.outcome().await {
                        FlightOutcome::Failed(e) => return Err(e),
                        FlightOutcome::Completed | FlightOutcome::Cancelled => continue,
                    }
                }
            }
        }
    }
}

/// One remote fetch run, driven by the flight
async fn run_fetch<M, R>(
    inner: Arc<PipelineInner<M, R>>,
    record: MediaRecord,
    sink: FlightSink,
) -> Result<()>
where
    M: MetadataStore,
    R: RemoteSource,
{
    let key = sink.key();
    let store = &inner.context.store;
    let settings = &inner.settings;

    let _permit = inner
        .context
        .admission
        .acquire_or_cancel(sink.cancelled())
        .await?;

    let mut chunks = tokio::select! {
        opened = inner.remote.fetch(record.channel_id, record.message_id, settings.chunk_size) => opened?,
        _ = sink.cancelled() => {
            return Err(RelayError::Cancelled(format!("fetch for {} cancelled while opening", key)));
        }
    };

    let mut writer = if store.is_cacheable(record.declared_size) {
        match store.begin_staged_write(key).await {
            Ok(writer) => Some(writer),
            Err(e) => {
                warn!("Streaming without caching: key={:?}, error={}", key, e);
                None
            }
        }
    } else {
        debug!(
            "Object too large to cache: key={:?}, declared_size={}",
            key, record.declared_size
        );
        None
    };

    let mut total_bytes = 0u64;
    let result: Result<()> = loop {
        let next = tokio::select! {
            next = tokio::time::timeout(settings.chunk_timeout, chunks.next()) => next,
            _ = sink.cancelled() => {
                break Err(RelayError::Cancelled(format!("all clients left {}", key)));
            }
        };
        let chunk = match next {
            Err(_) => {
                break Err(RelayError::TimeoutError(format!(
                    "no chunk from upstream within {:?}",
                    settings.chunk_timeout
                )))
            }
            Ok(None) => break Ok(()),
            Ok(Some(Err(e))) => break Err(e),
            Ok(Some(Ok(chunk))) => chunk,
        };
        total_bytes += chunk.len() as u64;

        let append_error = match writer.as_mut() {
            Some(handle) => handle.append(&chunk).await.err(),
            None => None,
        };
        if let Some(e) = append_error {
            warn!(
                "Cache write failed, continuing without caching: key={:?}, error={}",
                key, e
            );
            if let Some(handle) = writer.take() {
                handle.abort().await;
            }
        }

        // Unknown-size objects are held to the same bound once they outgrow it
        let outgrown = record.declared_size == 0
            && writer
                .as_ref()
                .is_some_and(|handle| !store.is_cacheable(handle.bytes_written()));
        if outgrown {
            if let Some(handle) = writer.take() {
                info!(
                    "Object of unknown size too large to cache, streaming only: key={:?}, bytes={}",
                    key,
                    handle.bytes_written()
                );
                handle.abort().await;
            }
        }

        if let Err(e) = sink.send(chunk).await {
            break Err(e);
        }
    };
    drop(chunks);

    match result {
        Ok(()) => {
            if let Some(handle) = writer.take() {
                if record.declared_size > 0 && total_bytes != record.declared_size {
                    warn!(
                        "Upstream size mismatch, not caching: key={:?}, declared={}, received={}",
                        key, record.declared_size, total_bytes
                    );
                    handle.abort().await;
                } else if let Err(e) = handle.commit().await {
                    warn!("Failed to commit cache entry: key={:?}, error={}", key, e);
                }
            }
            info!(
                "Remote fetch complete: object_id={}, key={:?}, bytes={}",
                record.id, key, total_bytes
            );
            Ok(())
        }
        Err(e) => {
            if let Some(handle) = writer.take() {
                handle.abort().await;
            }
            if e.is_cancelled() {
                debug!("Remote fetch cancelled: key={:?}, bytes={}", key, total_bytes);
            } else {
                warn!(
                    "Remote fetch failed: key={:?}, after_bytes={}, error={}",
                    key, total_bytes, e
                );
            }
            Err(e)
        }
    }
}
