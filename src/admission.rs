//! Admission Controller Module
//!
//! Bounds the number of concurrent remote fetches and paces fetch starts so the
//! remote source is never driven harder than it tolerates.
//!
//! # Architecture
//!
//! Admission is two gates passed in order:
//! 1. A fair counting semaphore holds one permit per concurrent fetch slot.
//!    Waiters are woken in FIFO order exactly when a slot frees.
//! 2. A pacing gate (a fair async mutex around the last start time) spaces
//!    successive starts at least `min_interval` apart across all callers.
//!
//! The returned [`AdmissionPermit`] releases its slot on drop, so every
//! successful acquire is paired with exactly one release on every exit path.

use crate::{RelayError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Shared limiter for remote fetches
pub struct AdmissionController {
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    min_interval: Duration,
    /// Start time of the most recent admitted fetch
    last_fetch_start: Mutex<Option<Instant>>,
}

/// Scoped ownership of one fetch slot.
///
/// Dropping the permit returns the slot to the controller.
#[derive(Debug)]
pub struct AdmissionPermit {
    _slot: OwnedSemaphorePermit,
    started_at: Instant,
}

impl AdmissionPermit {
    /// The pacing reference recorded when this permit was granted
    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

impl AdmissionController {
    /// Create a controller. A `max_concurrent` of zero is raised to one.
    pub fn new(max_concurrent: usize, min_interval: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            min_interval,
            last_fetch_start: Mutex::new(None),
        }
    }

    /// Wait until a slot is free and the pacing interval has elapsed.
    ///
    /// Never fails. Dropping the returned future while it waits leaves both
    /// the slot count and the pacing reference untouched.
    pub async fn acquire(&self) -> AdmissionPermit {
        let slot = match Arc::clone(&self.slots).acquire_owned().await {
            Ok(slot) => slot,
            // The semaphore is owned by self and never closed
            Err(_) => unreachable!("admission semaphore closed"),
        };

        let mut last_start = self.last_fetch_start.lock().await;
        if let Some(previous) = *last_start {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                trace!(
                    "Pacing fetch start for {:?}",
                    ready_at.saturating_duration_since(Instant::now())
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
        let started_at = Instant::now();
        *last_start = Some(started_at);
        drop(last_start);

        debug!(
            "Admitted remote fetch: in_use={}/{}",
            self.in_use(),
            self.max_concurrent
        );

        AdmissionPermit {
            _slot: slot,
            started_at,
        }
    }

    /// Cancellation-aware acquire.
    ///
    /// Returns [`RelayError::Cancelled`] if `cancelled` resolves before
    /// admission is granted. No slot is held in that case.
    pub async fn acquire_or_cancel<F>(&self, cancelled: F) -> Result<AdmissionPermit>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            permit = self.acquire() => Ok(permit),
            _ = cancelled => {
                debug!("Admission wait cancelled before a slot was granted");
                Err(RelayError::Cancelled("admission wait cancelled".to_string()))
            }
        }
    }

    /// Number of slots currently held
    pub fn in_use(&self) -> usize {
        self.max_concurrent - self.slots.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}
