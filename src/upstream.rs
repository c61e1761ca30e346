//! HTTP upstream adapter.
//!
//! Implements [`RemoteSource`] against an HTTP gateway that exposes each
//! object at `{base_url}/{channel_id}/{message_id}`. The response body is
//! streamed, never buffered, and re-chunked to the requested chunk size.

use crate::cache_types::ChunkStream;
use crate::chunk_stream::Rechunk;
use crate::remote::RemoteSource;
use crate::{RelayError, Result};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http_body_util::{BodyStream, Empty};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::{debug, warn};

/// Remote source backed by a plain HTTP/1 gateway
#[derive(Clone)]
pub struct HttpRemoteSource {
    client: Client<HttpConnector, Empty<Bytes>>,
    base_url: String,
    request_timeout: Duration,
}

impl HttpRemoteSource {
    /// Create an adapter for `base_url`, e.g. `http://127.0.0.1:9000/media`
    pub fn new(base_url: &str, request_timeout: Duration, idle_timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        base_url.parse::<Uri>().map_err(|e| {
            RelayError::ConfigError(format!("Invalid upstream URL '{}': {}", base_url, e))
        })?;

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(idle_timeout)
            .build(HttpConnector::new());

        Ok(Self {
            client,
            base_url,
            request_timeout,
        })
    }

    fn object_uri(&self, channel_id: i64, message_id: i64) -> Result<Uri> {
        format!("{}/{}/{}", self.base_url, channel_id, message_id)
            .parse::<Uri>()
            .map_err(|e| RelayError::InternalError(format!("Failed to build upstream URI: {}", e)))
    }
}

/// Map an upstream status to the error the pipeline understands
fn status_error(status: StatusCode, uri: &Uri) -> Option<RelayError> {
    if status.is_success() {
        return None;
    }
    let message = format!("upstream answered {} for {}", status, uri);
    Some(match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => RelayError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => RelayError::TransientUpstream(message),
        s if s.is_server_error() => RelayError::TransientUpstream(message),
        _ => RelayError::HttpError(message),
    })
}

impl RemoteSource for HttpRemoteSource {
    async fn fetch(
        &self,
        channel_id: i64,
        message_id: i64,
        chunk_size: usize,
    ) -> Result<ChunkStream> {
        let uri = self.object_uri(channel_id, message_id)?;
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri.clone())
            .body(Empty::<Bytes>::new())
            .map_err(|e| RelayError::HttpError(format!("Failed to build request: {}", e)))?;

        debug!("Opening upstream stream: uri={}", uri);

        let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| RelayError::TimeoutError(format!("Upstream request to {} timed out", uri)))?
            .map_err(|e| {
                warn!("Upstream request failed: uri={}, error={}", uri, e);
                RelayError::TransientUpstream(format!("Failed to reach upstream: {}", e))
            })?;

        if let Some(err) = status_error(response.status(), &uri) {
            warn!("Upstream refused object: {}", err);
            return Err(err);
        }

        let frames = BodyStream::new(response.into_body())
            .map_err(|e| RelayError::TransientUpstream(format!("Upstream body error: {}", e)))
            .try_filter_map(|frame| futures::future::ready(Ok(frame.into_data().ok())))
            .boxed();

        Ok(Rechunk::new(frames, chunk_size).boxed())
    }
}
