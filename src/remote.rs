//! Remote source seam.
//!
//! The pipeline only sees the upstream through [`RemoteSource`], so the
//! binary can plug in the HTTP adapter while tests drive a scripted source.

use crate::cache_types::ChunkStream;
use crate::Result;
use std::future::Future;

/// Client for the slow, rate-limited remote that holds the media
pub trait RemoteSource: Send + Sync + 'static {
    /// Open a lazy chunk sequence for the object posted at
    /// `(channel_id, message_id)`.
    ///
    /// Chunks should be `chunk_size` bytes, except possibly the last. Fails
    /// with `NotFound` when the object does not exist upstream and with
    /// `TransientUpstream` when the remote is throttling or unavailable.
    fn fetch(
        &self,
        channel_id: i64,
        message_id: i64,
        chunk_size: usize,
    ) -> impl Future<Output = Result<ChunkStream>> + Send;
}
