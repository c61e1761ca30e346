//! HTTP Server Module
//!
//! Minimal HTTP/1 front end over the stream pipeline:
//!
//! | Route | Response |
//! |---|---|
//! | `GET /stream/{object_id}` | object bytes, `x-cache: HIT` or `MISS` |
//! | `HEAD /stream/{object_id}` | headers only, never starts a remote fetch |
//! | `GET /health` | JSON [`HealthReport`](crate::health::HealthReport) |
//!
//! Errors raised before the first body byte map to a status code. A failure
//! after streaming started aborts the response, so the client sees a
//! truncated body rather than a wrong one.

use crate::catalog::MetadataStore;
use crate::health::HealthManager;
use crate::pipeline::{StreamPipeline, StreamSource};
use crate::remote::RemoteSource;
use crate::{RelayError, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderValue, ALLOW, CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub type ResponseBody = UnsyncBoxBody<Bytes, RelayError>;

const STREAM_PREFIX: &str = "/stream/";
const HEALTH_PATH: &str = "/health";
const X_CACHE: &str = "x-cache";
const X_REQUEST_ID: &str = "x-request-id";
/// Seconds a client should back off after a transient upstream failure
const RETRY_AFTER_SECS: &str = "5";

/// HTTP front end
pub struct HttpServer<M, R> {
    listen_addr: SocketAddr,
    pipeline: StreamPipeline<M, R>,
    health: HealthManager,
    active_connections: Arc<AtomicUsize>,
}

impl<M, R> HttpServer<M, R>
where
    M: MetadataStore,
    R: RemoteSource,
{
    pub fn new(listen_addr: SocketAddr, pipeline: StreamPipeline<M, R>) -> Self {
        let health = HealthManager::new(pipeline.context().clone());
        Self {
            listen_addr,
            pipeline,
            health,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Accept connections until shutdown
    pub async fn start(&self, mut shutdown_signal: crate::shutdown::ShutdownSignal) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await.map_err(|e| {
            RelayError::IoError(format!("Failed to bind {}: {}", self.listen_addr, e))
        })?;
        info!("HTTP server listening on {}", self.listen_addr);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("HTTP connection from {}", addr);
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }

                            let pipeline = self.pipeline.clone();
                            let health = self.health.clone();
                            let active_connections = Arc::clone(&self.active_connections);
                            tokio::spawn(async move {
                                Self::serve_connection(stream, addr, pipeline, health, active_connections).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept HTTP connection: {}", e);
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("HTTP server received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        // Drain period: wait for in-flight connections to complete
        let drain_timeout = Duration::from_secs(5);
        let drain_start = std::time::Instant::now();
        let active = self.active_connections.load(Ordering::Relaxed);
        if active > 0 {
            info!(
                "HTTP server draining {} active connections (timeout: {:?})",
                active, drain_timeout
            );
            while self.active_connections.load(Ordering::Relaxed) > 0
                && drain_start.elapsed() < drain_timeout
            {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            let remaining = self.active_connections.load(Ordering::Relaxed);
            if remaining > 0 {
                warn!("HTTP server shutdown with {} connections still active", remaining);
            }
        }

        info!("HTTP server stopped");
        Ok(())
    }

    async fn serve_connection(
        stream: TcpStream,
        addr: SocketAddr,
        pipeline: StreamPipeline<M, R>,
        health: HealthManager,
        active_connections: Arc<AtomicUsize>,
    ) {
        let io = TokioIo::new(stream);
        active_connections.fetch_add(1, Ordering::Relaxed);

        let service = service_fn(move |req| {
            let pipeline = pipeline.clone();
            let health = health.clone();
            async move { handle_request(req, &pipeline, &health).await }
        });

        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            if err.is_canceled() || err.is_incomplete_message() || err.is_closed() {
                debug!("Client disconnected from {}: {}", addr, err);
            } else {
                error!("Error serving HTTP connection from {}: {}", addr, err);
            }
        }

        active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Route and answer one request
pub async fn handle_request<B, M, R>(
    req: Request<B>,
    pipeline: &StreamPipeline<M, R>,
    health: &HealthManager,
) -> std::result::Result<Response<ResponseBody>, Infallible>
where
    M: MetadataStore,
    R: RemoteSource,
{
    let request_id = Uuid::new_v4().to_string();
    let span = info_span!("request", request_id = %request_id);
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let mut response = async {
        debug!("Processing {} {}", method, path);

        if method != Method::GET && method != Method::HEAD {
            let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
            return response;
        }

        if path == HEALTH_PATH {
            return health_response(health, method == Method::HEAD);
        }

        match path.strip_prefix(STREAM_PREFIX) {
            Some(object_id) if !object_id.is_empty() && !object_id.contains('/') => {
                if method == Method::HEAD {
                    head_response(pipeline, object_id).await
                } else {
                    stream_response(pipeline, object_id).await
                }
            }
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        }
    }
    .instrument(span.clone())
    .await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    span.in_scope(|| info!("{} {} -> {}", method, path, response.status().as_u16()));
    Ok(response)
}

async fn stream_response<M, R>(pipeline: &StreamPipeline<M, R>, object_id: &str) -> Response<ResponseBody>
where
    M: MetadataStore,
    R: RemoteSource,
{
    let media = match pipeline.serve(object_id).await {
        Ok(media) => media,
        Err(e) => return error_response(&e),
    };

    let source = media.source();
    let declared_size = media.declared_size();
    let object = object_id.to_string();
    let frames = media
        .into_chunks()
        .inspect_err(move |e| {
            warn!("Stream aborted after body started: object_id={}, error={}", object, e);
        })
        .map_ok(Frame::data);

    let mut response = Response::new(BodyExt::boxed_unsync(StreamBody::new(frames)));
    set_object_headers(&mut response, source, declared_size);
    response
}

async fn head_response<M, R>(pipeline: &StreamPipeline<M, R>, object_id: &str) -> Response<ResponseBody>
where
    M: MetadataStore,
    R: RemoteSource,
{
    let record = match pipeline.catalog().resolve(object_id).await {
        Ok(record) => record,
        Err(e) => return error_response(&e),
    };

    let (source, size) = match pipeline.context().store.lookup(&record.cache_key()) {
        Some(entry) => (StreamSource::Cache, entry.size_bytes),
        None => (StreamSource::Remote, record.declared_size),
    };
    let mut response = Response::new(empty_body());
    set_object_headers(&mut response, source, size);
    response
}

fn set_object_headers(response: &mut Response<ResponseBody>, source: StreamSource, size: u64) {
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(X_CACHE, HeaderValue::from_static(source.as_str()));
    if size > 0 {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(size));
    }
}

fn health_response(health: &HealthManager, head_only: bool) -> Response<ResponseBody> {
    let report = health.check_health();
    let status = report.status_code();
    let body = match serde_json::to_vec_pretty(&report) {
        Ok(body) => body,
        Err(e) => {
            error!("Failed to serialize health report: {}", e);
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "health unavailable");
        }
    };

    let mut response = if head_only {
        Response::new(empty_body())
    } else {
        Response::new(full_body(Bytes::from(body)))
    };
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Map a pipeline error raised before any body byte was sent
pub fn error_response(err: &RelayError) -> Response<ResponseBody> {
    let status = err.status_code();
    if status.is_server_error() {
        warn!("Request failed: status={}, error={}", status.as_u16(), err);
    } else {
        debug!("Request rejected: status={}, error={}", status.as_u16(), err);
    }

    let mut response = text_response(status, &err.to_string());
    if status == StatusCode::SERVICE_UNAVAILABLE {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
    }
    response
}

fn text_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    let mut response = Response::new(full_body(Bytes::from(format!("{}\n", message))));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

fn empty_body() -> ResponseBody {
    full_body(Bytes::new())
}
