//! HTTP range API
//!
//! Serves reconstructed stream plaintext as byte ranges:
//!
//! - `GET /get/{name}` - resolve a name, reconstruct the requested range
//! - `HEAD /get/{name}` - headers only
//! - `GET /health` - node statistics
//!
//! A `Range: bytes=start-end` header (single range only) selects a
//! sub-range of the **served** stream size; without one the full stream is
//! returned, still carrying `Content-Range`. Bodies are streamed one blob
//! frame at a time, so a multi-megabyte stream never sits fully in memory.

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::manager::{NameResolver, StreamManager};

/// Response body: either a buffered payload or a per-blob frame stream
pub type BoxedBody = UnsyncBoxBody<Bytes, StoreError>;

fn full_body(data: impl Into<Bytes>) -> BoxedBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn empty_body() -> BoxedBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// HTTP server state
pub struct HttpServer {
    manager: Arc<StreamManager>,
    resolver: Arc<dyn NameResolver>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(
        manager: Arc<StreamManager>,
        resolver: Arc<dyn NameResolver>,
        bind_addr: SocketAddr,
    ) -> Self {
        Self {
            manager,
            resolver,
            bind_addr,
        }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), StoreError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route requests to handlers
    ///
    /// Generic over the request body so tests can drive it directly; the
    /// body itself is never read (all routes are GET/HEAD).
    pub async fn handle_request<B>(
        &self,
        req: Request<B>,
    ) -> Result<Response<BoxedBody>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(method = %method, path = %path, "Incoming request");

        let result = match (method, path.as_str()) {
            (Method::GET, "/health") => self.handle_health().await,

            (Method::GET, p) if p.starts_with("/get/") => {
                let name = p.strip_prefix("/get/").unwrap_or("");
                self.handle_get(name, req.headers(), false).await
            }
            (Method::HEAD, p) if p.starts_with("/get/") => {
                let name = p.strip_prefix("/get/").unwrap_or("");
                self.handle_get(name, req.headers(), true).await
            }

            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(full_body("Not Found"))
                .unwrap()),
        };

        match result {
            Ok(response) => Ok(response),
            Err(e) => Ok(error_response(e)),
        }
    }

    /// Health check endpoint
    async fn handle_health(&self) -> Result<Response<BoxedBody>, StoreError> {
        let stats = self.manager.store().stats().await?;
        let streams = self.manager.list_streams().await;
        let body = serde_json::json!({
            "status": "ok",
            "blobs": stats.total_blobs,
            "bytes": stats.total_bytes,
            "streams": streams.len(),
        });

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(full_body(body.to_string()))
            .unwrap())
    }

    /// GET|HEAD /get/{name} - serve a byte range of the stream
    async fn handle_get(
        &self,
        name: &str,
        headers: &HeaderMap,
        head_only: bool,
    ) -> Result<Response<BoxedBody>, StoreError> {
        if name.is_empty() {
            return Err(StoreError::StreamNotFound("(empty name)".to_string()));
        }

        let sd_hash = self
            .resolver
            .resolve(name)
            .await?
            .ok_or_else(|| StoreError::StreamNotFound(name.to_string()))?;
        let stream = self.manager.open_stream(&sd_hash, Some(name)).await?;

        // File-saving mode: the stream's plaintext lands on disk exactly
        // once, no matter how many requests come through here
        if !self.manager.flags().streaming_only() {
            self.manager.ensure_materialized(&stream, None).await?;
        }

        let total = stream.descriptor.served_size();
        let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());

        let (status, start, end) = match range_header {
            Some(value) => {
                let (first, last) = parse_single_range(value, total)?;
                (StatusCode::PARTIAL_CONTENT, first, last + 1)
            }
            None => (StatusCode::OK, 0, total),
        };

        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CONTENT_LENGTH, end - start);
        if total > 0 {
            builder = builder.header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end - 1, total),
            );
        }

        let body = if head_only || start == end {
            empty_body()
        } else {
            let reader = self.manager.reader(&stream)?;
            let frames = reader
                .into_stream(start, end)
                .map(|item| item.map(Frame::data));
            StreamBody::new(frames).boxed_unsync()
        };

        builder
            .body(body)
            .map_err(|e| StoreError::Internal(e.to_string()))
    }
}

/// Parse a single-range `Range` header against the served size
///
/// Returns the inclusive `(first, last)` byte positions. Multi-range
/// requests, malformed specs, and ranges starting at or past the end are
/// all unsatisfiable.
fn parse_single_range(header_value: &str, size: u64) -> Result<(u64, u64), StoreError> {
    let unsatisfiable = |start: u64| StoreError::RangeNotSatisfiable { start, size };

    let spec = header_value
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(|| unsatisfiable(0))?;
    if spec.contains(',') {
        return Err(unsatisfiable(0));
    }
    let (start_s, end_s) = spec.split_once('-').ok_or_else(|| unsatisfiable(0))?;

    if size == 0 {
        return Err(unsatisfiable(0));
    }
    let last = size - 1;

    if start_s.is_empty() {
        // suffix form: "-<length>"
        let suffix_len: u64 = end_s.parse().map_err(|_| unsatisfiable(0))?;
        if suffix_len == 0 {
            return Err(unsatisfiable(size));
        }
        return Ok((size.saturating_sub(suffix_len), last));
    }

    let start: u64 = start_s.parse().map_err(|_| unsatisfiable(0))?;
    if start >= size {
        return Err(unsatisfiable(start));
    }

    if end_s.is_empty() {
        return Ok((start, last));
    }
    let end: u64 = end_s.parse().map_err(|_| unsatisfiable(start))?;
    if end < start {
        return Err(unsatisfiable(start));
    }
    Ok((start, end.min(last)))
}

/// Map an error to its HTTP response
fn error_response(e: StoreError) -> Response<BoxedBody> {
    if let StoreError::RangeNotSatisfiable { size, .. } = &e {
        return Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CONTENT_RANGE, format!("bytes */{}", size))
            .header(header::CONTENT_LENGTH, 0)
            .body(empty_body())
            .unwrap();
    }

    let status = match &e {
        StoreError::StreamNotFound(_) | StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::StreamDeleted(_) => StatusCode::GONE,
        StoreError::BlobUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => {
            error!(error = %e, "Request error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    let body = serde_json::json!({ "error": e.to_string() });
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}
