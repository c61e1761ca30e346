//! Shared relay state.
//!
//! [`RelayContext`] bundles the process-wide pieces every request touches:
//! the admission limiter, the fetch registry and the cache store. It is built
//! once at startup and handed to each component.

use crate::admission::AdmissionController;
use crate::cache_store::CacheStore;
use crate::config::Config;
use crate::inflight::FetchDeduplicator;
use crate::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Clone)]
pub struct RelayContext {
    pub admission: Arc<AdmissionController>,
    pub store: CacheStore,
    pub dedup: FetchDeduplicator,
    started_at: Instant,
}

impl RelayContext {
    pub fn new(admission: AdmissionController, store: CacheStore) -> Self {
        Self {
            admission: Arc::new(admission),
            store,
            dedup: FetchDeduplicator::new(),
            started_at: Instant::now(),
        }
    }

    /// Drop subscribers that stop reading for longer than `stall_timeout`
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.dedup = FetchDeduplicator::with_stall_timeout(stall_timeout);
        self
    }

    /// Open the cache store and build the limiter from configuration
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = CacheStore::open(
            config.cache.cache_dir.clone(),
            config.cache.chunk_size,
            config.cache.max_cache_size,
        )
        .await?;
        let admission = AdmissionController::new(
            config.admission.max_concurrent_fetches,
            config.admission.min_fetch_interval,
        );
        info!(
            "Relay context ready: max_concurrent_fetches={}, min_fetch_interval={:?}",
            admission.max_concurrent(),
            admission.min_interval()
        );
        Ok(Self::new(admission, store).with_stall_timeout(config.upstream.chunk_timeout))
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
