//! Eviction Module
//!
//! Periodic sweep that brings the cache back under budget. When committed
//! bytes exceed `max_cache_size`, the least recently accessed entries with no
//! live readers are deleted, oldest first, until the total is at most 80% of
//! the budget or nothing deletable remains.

use crate::cache_store::CacheStore;
use crate::shutdown::ShutdownSignal;
use crate::Result;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sweeps stop once the cache is at or below this share of the budget
const TARGET_PERCENT: u64 = 80;

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepResult {
    pub entries_evicted: usize,
    pub bytes_evicted: u64,
    /// Over-budget candidates passed over because a read session held them
    pub skipped_referenced: usize,
    pub size_before: u64,
    pub size_after: u64,
}

pub struct EvictionSweeper {
    store: CacheStore,
    max_cache_size: u64,
    interval: Duration,
}

impl EvictionSweeper {
    pub fn new(store: CacheStore, max_cache_size: u64, interval: Duration) -> Self {
        Self {
            store,
            max_cache_size,
            interval,
        }
    }

    /// Size the sweep reduces the cache to
    pub fn target_size(&self) -> u64 {
        target_size(self.max_cache_size)
    }

    /// Run one sweep
    pub async fn sweep(&self) -> Result<SweepResult> {
        let size_before = self.store.committed_bytes();
        let mut result = SweepResult {
            size_before,
            size_after: size_before,
            ..SweepResult::default()
        };

        if size_before <= self.max_cache_size {
            debug!(
                "Cache within budget: size={}, max={}",
                size_before, self.max_cache_size
            );
            return Ok(result);
        }

        let target = self.target_size();
        info!(
            "Cache over budget, evicting: size={}, max={}, target={}",
            size_before, self.max_cache_size, target
        );

        let mut candidates = self.store.entries();
        candidates.sort_by_key(|snapshot| snapshot.entry.last_accessed_at);

        let mut current = size_before;
        for snapshot in candidates {
            if current <= target {
                break;
            }
            let key = snapshot.entry.key;
            if snapshot.active_readers > 0 {
                result.skipped_referenced += 1;
                continue;
            }

            match self.store.evict(&key).await {
                Ok(Some(bytes)) => {
                    current = current.saturating_sub(bytes);
                    result.entries_evicted += 1;
                    result.bytes_evicted += bytes;
                }
                // A reader attached after the snapshot was taken
                Ok(None) => result.skipped_referenced += 1,
                Err(e) => warn!("Failed to evict cache entry {:?}: {}", key, e),
            }
        }

        result.size_after = self.store.committed_bytes();
        if result.size_after > target {
            warn!(
                "Eviction could not reach target: size={}, target={}, skipped_referenced={}",
                result.size_after, target, result.skipped_referenced
            );
        }
        info!(
            "Eviction sweep complete: evicted={} entries ({} bytes), size {} -> {}",
            result.entries_evicted, result.bytes_evicted, result.size_before, result.size_after
        );
        Ok(result)
    }

    /// Sweep on every interval tick until shutdown
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        info!(
            "Starting eviction sweeper (interval: {}s, max_cache_size: {})",
            self.interval.as_secs(),
            self.max_cache_size
        );
        let mut interval = tokio::time::interval(self.interval);
        // A slow sweep pushes the next one back instead of bursting
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!("Eviction sweep failed: {}", e);
                    }
                }
                _ = shutdown.wait_for_shutdown() => {
                    info!("Eviction sweeper received shutdown signal");
                    break;
                }
            }
        }
    }
}

fn target_size(max_cache_size: u64) -> u64 {
    (u128::from(max_cache_size) * u128::from(TARGET_PERCENT) / 100) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_types::CacheKey;
    use tempfile::TempDir;

    async fn store_with(dir: &TempDir, max: u64, sizes: &[usize]) -> (CacheStore, Vec<CacheKey>) {
        let store = CacheStore::open(dir.path().to_path_buf(), 64, max).await.unwrap();
        let mut keys = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            let key = CacheKey::derive(1, i as i64, "entry");
            let mut handle = store.begin_staged_write(key).await.unwrap();
            handle.append(&vec![0u8; *size]).await.unwrap();
            handle.commit().await.unwrap();
            keys.push(key);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        (store, keys)
    }

    #[test]
    fn test_target_is_eighty_percent() {
        assert_eq!(target_size(1000), 800);
        assert_eq!(target_size(1001), 800);
        assert_eq!(target_size(5 * 1024 * 1024 * 1024), 4 * 1024 * 1024 * 1024);
        assert_eq!(target_size(u64::MAX), (u128::from(u64::MAX) * 80 / 100) as u64);
    }

    #[tokio::test]
    async fn test_within_budget_is_noop() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_with(&dir, 1000, &[300, 300]).await;
        let sweeper = EvictionSweeper::new(store.clone(), 1000, Duration::from_secs(60));
        let result = sweeper.sweep().await.unwrap();
        assert_eq!(result.entries_evicted, 0);
        assert_eq!(result.size_after, 600);
        assert_eq!(store.entry_count(), 2);
    }

    #[tokio::test]
    async fn test_oldest_entry_goes_first() {
        let dir = TempDir::new().unwrap();
        let (store, keys) = store_with(&dir, 1000, &[400, 400, 400]).await;
        let sweeper = EvictionSweeper::new(store.clone(), 1000, Duration::from_secs(60));

        let result = sweeper.sweep().await.unwrap();
        assert_eq!(result.entries_evicted, 1);
        assert_eq!(result.size_before, 1200);
        assert_eq!(result.size_after, 800);
        assert!(store.lookup(&keys[0]).is_none());
        assert!(store.lookup(&keys[1]).is_some());
        assert!(store.lookup(&keys[2]).is_some());
    }
}
