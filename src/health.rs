//! Health Check Module
//!
//! Builds the `/health` report from the live relay state.

use crate::context::RelayContext;
use hyper::StatusCode;
use serde::{Deserialize, Serialize};

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Serving, but the cache is over budget until the next sweep
    Degraded,
    /// The cache directory is gone
    Unhealthy,
}

/// Snapshot of relay state served at `/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub active_fetches: usize,
    pub max_fetches: usize,
    pub in_flight: usize,
    pub cache_entries: usize,
    pub cache_bytes: u64,
    pub max_cache_bytes: u64,
    pub uptime_seconds: u64,
    pub version: String,
}

impl HealthReport {
    pub fn status_code(&self) -> StatusCode {
        match self.status {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Health check manager
#[derive(Clone)]
pub struct HealthManager {
    context: RelayContext,
}

impl HealthManager {
    pub fn new(context: RelayContext) -> Self {
        Self { context }
    }

    pub fn check_health(&self) -> HealthReport {
        let store = &self.context.store;
        let cache_bytes = store.committed_bytes();
        let max_cache_bytes = store.max_cache_size();

        let status = if !store.root().is_dir() {
            HealthStatus::Unhealthy
        } else if cache_bytes > max_cache_bytes {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            active_fetches: self.context.admission.in_use(),
            max_fetches: self.context.admission.max_concurrent(),
            in_flight: self.context.dedup.in_flight_count(),
            cache_entries: store.entry_count(),
            cache_bytes,
            max_cache_bytes,
            uptime_seconds: self.context.uptime().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
