//! In-flight fetch registry for download coalescing.
//!
//! Concurrent requests for the same uncached object share one remote fetch.
//!
//! # Architecture
//!
//! When several requests arrive for the same key:
//! 1. The first request registers an [`InFlightFetch`] and becomes its first
//!    subscriber. A detached driver task runs the fetch and fans every chunk
//!    out through a [`FlightSink`].
//! 2. Requests that arrive before the first chunk was sent subscribe and
//!    receive the full object, in order ([`Joined::Live`]).
//! 3. Requests that arrive later cannot see the whole object from the flight.
//!    They get a [`FlightWaiter`] ([`Joined::Wait`]) that resolves to the
//!    flight's outcome, after which the caller re-checks the cache.
//!
//! The driver is detached from every client, so one client disconnecting
//! never affects the others. When the last subscriber leaves, the flight is
//! cancelled and [`FlightSink::cancelled`] resolves.
//!
//! A subscriber that stays connected but stops reading is dropped from the
//! flight once a send to it has waited longer than the stall timeout. Its
//! stream ends with [`RelayError::TimeoutError`] after the chunks it already
//! buffered, and the remaining subscribers keep receiving.

use crate::cache_types::CacheKey;
use crate::{RelayError, Result};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Chunks buffered per subscriber before the flight waits on it
const SUBSCRIBER_BUFFER_CHUNKS: usize = 8;

/// Longest a single subscriber may hold up the flight
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// How a finished flight ended
#[derive(Debug, Clone, PartialEq)]
pub enum FlightOutcome {
    /// The remote sequence ended normally
    Completed,
    /// The fetch failed; every subscriber received this error
    Failed(RelayError),
    /// The last subscriber left before the fetch finished
    Cancelled,
}

/// Result of joining the registry for a key
pub enum Joined {
    /// Subscribed before the first chunk; receives the whole object
    Live(Subscription),
    /// The flight already delivered chunks; wait for it to finish.
    ///
    /// Waiting only pays off when the flight commits to the cache. For an
    /// uncacheable object the caller gets no bytes until the current transfer
    /// has ended, then starts a fetch of its own.
    Wait(FlightWaiter),
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Result<Bytes>>,
    stalled: Arc<AtomicBool>,
}

#[derive(Default)]
struct FlightState {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    /// Set once the first chunk went out; later joiners must wait
    started_sending: bool,
    /// No new subscribers and no more chunks
    closed: bool,
}

/// One shared remote fetch
pub struct InFlightFetch {
    key: CacheKey,
    state: Mutex<FlightState>,
    cancel: watch::Sender<bool>,
    outcome: watch::Sender<Option<FlightOutcome>>,
}

impl InFlightFetch {
    fn new(key: CacheKey) -> Self {
        Self {
            key,
            state: Mutex::new(FlightState::default()),
            cancel: watch::channel(false).0,
            outcome: watch::channel(None).0,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, FlightState> {
        // State stays consistent across a panicking holder
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Join the flight, as a live subscriber if no chunk was sent yet
    fn join(self: &Arc<Self>, is_leader: bool) -> Joined {
        let mut state = self.lock_state();
        if state.started_sending || state.closed {
            return Joined::Wait(FlightWaiter {
                key: self.key,
                outcome: self.outcome.subscribe(),
            });
        }

        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER_CHUNKS);
        let id = state.next_id;
        state.next_id += 1;
        let stalled = Arc::new(AtomicBool::new(false));
        state.subscribers.push(Subscriber {
            id,
            sender,
            stalled: Arc::clone(&stalled),
        });

        Joined::Live(Subscription {
            key: self.key,
            receiver,
            is_leader,
            stalled,
            stall_reported: false,
            _membership: Membership {
                flight: Arc::clone(self),
                id,
            },
        })
    }

    fn unsubscribe(&self, id: u64) {
        let mut state = self.lock_state();
        state.subscribers.retain(|subscriber| subscriber.id != id);
        if state.subscribers.is_empty() && !state.closed {
            state.closed = true;
            drop(state);
            debug!("Last subscriber left, cancelling flight: key={}", self.key);
            self.cancel.send_replace(true);
        }
    }

    fn subscriber_count(&self) -> usize {
        self.lock_state().subscribers.len()
    }
}

/// Tracks in-flight remote fetches, one per key
#[derive(Clone)]
pub struct FetchDeduplicator {
    flights: Arc<DashMap<CacheKey, Arc<InFlightFetch>>>,
    stall_timeout: Duration,
}

impl Default for FetchDeduplicator {
    fn default() -> Self {
        Self::with_stall_timeout(DEFAULT_STALL_TIMEOUT)
    }
}

impl FetchDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose flights drop subscribers that block a send for longer
    /// than `stall_timeout`
    pub fn with_stall_timeout(stall_timeout: Duration) -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
            stall_timeout,
        }
    }

    /// Join the flight for `key`, or start one with `fetch_fn`.
    ///
    /// `fetch_fn` is only invoked when no flight exists. Its future runs on a
    /// detached task and must push every chunk through the sink it is given.
    /// Returning `Ok(())` signals normal end-of-stream to all subscribers.
    pub fn join_or_start<F, Fut>(&self, key: CacheKey, fetch_fn: F) -> Joined
    where
        F: FnOnce(FlightSink) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (flight, joined) = match self.flights.entry(key) {
            Entry::Occupied(occupied) => {
                let joined = occupied.get().join(false);
                return joined;
            }
            Entry::Vacant(vacant) => {
                let flight = Arc::new(InFlightFetch::new(key));
                let joined = flight.join(true);
                vacant.insert(Arc::clone(&flight));
                (flight, joined)
            }
        };

        debug!("Starting remote fetch flight: key={}", key);

        let guard = FlightGuard {
            flight: Arc::clone(&flight),
            flights: Arc::clone(&self.flights),
            finished: false,
        };
        let fetch = fetch_fn(FlightSink {
            flight,
            stall_timeout: self.stall_timeout,
        });
        tokio::spawn(async move {
            let result = fetch.await;
            guard.finish(result).await;
        });

        joined
    }

    /// Number of flights currently registered
    pub fn in_flight_count(&self) -> usize {
        self.flights.len()
    }

    /// Live subscribers of the flight for `key`, zero if none exists
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.flights
            .get(key)
            .map(|flight| flight.subscriber_count())
            .unwrap_or(0)
    }
}

/// Fan-out side of a flight, handed to the fetch function
pub struct FlightSink {
    flight: Arc<InFlightFetch>,
    stall_timeout: Duration,
}

impl FlightSink {
    pub fn key(&self) -> CacheKey {
        self.flight.key
    }

    /// Deliver one chunk to every current subscriber, in order.
    ///
    /// Subscribers that went away, or that did not accept the chunk within
    /// the stall timeout, are dropped. Fails with [`RelayError::Cancelled`]
    /// once no subscriber remains.
    pub async fn send(&self, chunk: Bytes) -> Result<()> {
        let targets: Vec<(u64, mpsc::Sender<Result<Bytes>>, Arc<AtomicBool>)> = {
            let mut state = self.flight.lock_state();
            if state.closed {
                return Err(RelayError::Cancelled(format!(
                    "no subscribers left for {}",
                    self.flight.key
                )));
            }
            state.started_sending = true;
            state
                .subscribers
                .iter()
                .map(|subscriber| {
                    (
                        subscriber.id,
                        subscriber.sender.clone(),
                        Arc::clone(&subscriber.stalled),
                    )
                })
                .collect()
        };

        for (id, sender, stalled) in targets {
            match tokio::time::timeout(self.stall_timeout, sender.send(Ok(chunk.clone()))).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => self.flight.unsubscribe(id),
                Err(_) => {
                    warn!(
                        "Subscriber stopped reading, dropping it from the flight: key={}, waited={:?}",
                        self.flight.key, self.stall_timeout
                    );
                    stalled.store(true, Ordering::SeqCst);
                    self.flight.unsubscribe(id);
                }
            }
        }

        if self.flight.subscriber_count() == 0 {
            return Err(RelayError::Cancelled(format!(
                "no subscribers left for {}",
                self.flight.key
            )));
        }
        Ok(())
    }

    /// Resolves once the last subscriber has left
    pub async fn cancelled(&self) {
        let mut cancel = self.flight.cancel.subscribe();
        let _ = cancel.wait_for(|cancelled| *cancelled).await;
    }
}

/// Unregisters the flight and publishes its outcome, even if the driver
/// task panics or is dropped by runtime shutdown.
struct FlightGuard {
    flight: Arc<InFlightFetch>,
    flights: Arc<DashMap<CacheKey, Arc<InFlightFetch>>>,
    finished: bool,
}

impl FlightGuard {
    async fn finish(mut self, result: Result<()>) {
        let outcome = match result {
            Ok(()) => FlightOutcome::Completed,
            Err(err) if err.is_cancelled() => FlightOutcome::Cancelled,
            Err(err) => FlightOutcome::Failed(err),
        };

        let subscribers = self.close();
        if let FlightOutcome::Failed(err) = &outcome {
            warn!(
                "Remote fetch failed: key={}, subscribers={}, error={}",
                self.flight.key,
                subscribers.len(),
                err
            );
            for subscriber in &subscribers {
                let _ = subscriber.sender.send(Err(err.clone())).await;
            }
        }
        drop(subscribers);

        debug!(
            "Flight finished: key={}, outcome={:?}",
            self.flight.key, outcome
        );
        self.finished = true;
        self.flight.outcome.send_replace(Some(outcome));
    }

    /// Stop accepting joiners and unregister; returns the remaining subscribers
    fn close(&self) -> Vec<Subscriber> {
        let subscribers = {
            let mut state = self.flight.lock_state();
            state.closed = true;
            std::mem::take(&mut state.subscribers)
        };
        self.flights
            .remove_if(&self.flight.key, |_, flight| Arc::ptr_eq(flight, &self.flight));
        subscribers
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let err = RelayError::InternalError(format!(
            "fetch task for {} ended unexpectedly",
            self.flight.key
        ));
        for subscriber in self.close() {
            let _ = subscriber.sender.try_send(Err(err.clone()));
        }
        self.flight
            .outcome
            .send_replace(Some(FlightOutcome::Failed(err)));
    }
}

/// Ordered chunks of a flight, as seen by one subscriber
pub struct Subscription {
    key: CacheKey,
    receiver: mpsc::Receiver<Result<Bytes>>,
    is_leader: bool,
    /// Set by the flight when it gave up on this subscriber
    stalled: Arc<AtomicBool>,
    stall_reported: bool,
    _membership: Membership,
}

impl Subscription {
    /// Whether this subscription started the flight
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }
}

impl Stream for Subscription {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.poll_recv(cx) {
            Poll::Ready(None) if self.stalled.load(Ordering::SeqCst) && !self.stall_reported => {
                self.stall_reported = true;
                Poll::Ready(Some(Err(RelayError::TimeoutError(format!(
                    "subscriber of {} fell behind and was dropped",
                    self.key
                )))))
            }
            other => other,
        }
    }
}

struct Membership {
    flight: Arc<InFlightFetch>,
    id: u64,
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.flight.unsubscribe(self.id);
    }
}

/// Handle to a flight that had already started sending
pub struct FlightWaiter {
    key: CacheKey,
    outcome: watch::Receiver<Option<FlightOutcome>>,
}

impl FlightWaiter {
    /// Wait for the flight to finish
    pub async fn outcome(mut self) -> FlightOutcome {
        match self.outcome.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone().unwrap_or(FlightOutcome::Cancelled),
            Err(_) => FlightOutcome::Failed(RelayError::InternalError(format!(
                "flight for {} dropped without an outcome",
                self.key
            ))),
        }
    }
}
