//! Forwarding a request to the backend a route points at.

mod http;

pub use http::HttpUpstream;

use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use thiserror::Error;

use crate::services::routing::BackendTarget;

#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path and query as received, e.g. `/api/orders?page=2`
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("upstream timed out")]
    Timeout,
    /// The backend answered, but with a 5xx. Counts against its health; the
    /// response itself is still relayed.
    #[error("upstream answered {}", .0.status)]
    ServerError(ProxyResponse),
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(
        &self,
        backend: &BackendTarget,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, UpstreamError>;
}

/// Headers that describe one hop and must not be relayed.
pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

pub(crate) fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
