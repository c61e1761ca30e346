//! Media Relay - streaming relay for slow, rate-limited media sources
//!
//! Streams large objects from a remote source to HTTP clients while
//! persisting them to a size-bounded, content-addressed disk cache. Remote
//! fetches are deduplicated per object, bounded in concurrency and paced.

pub mod admission;
pub mod cache_store;
pub mod cache_types;
pub mod catalog;
pub mod chunk_stream;
pub mod config;
pub mod context;
pub mod error;
pub mod eviction;
pub mod health;
pub mod http_server;
pub mod inflight;
pub mod logging;
pub mod pipeline;
pub mod remote;
pub mod shutdown;
pub mod upstream;

pub use error::{RelayError, Result};
