use async_trait::async_trait;
use reqwest::Url;

use super::{ProxyRequest, ProxyResponse, Upstream, UpstreamError, strip_hop_by_hop};
use crate::services::routing::BackendTarget;

/// Relays requests with a shared `reqwest` client (connection pooling included).
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new() -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    /// Backend base url joined with the inbound path and query.
    pub fn target_url(backend: &BackendTarget, path_and_query: &str) -> Result<Url, UpstreamError> {
        let base = backend.url.trim_end_matches('/');
        let path = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{path_and_query}")
        };
        Url::parse(&format!("{base}{path}")).map_err(|e| {
            UpstreamError::Transport(format!("invalid url for backend `{}`: {e}", backend.name))
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(
        &self,
        backend: &BackendTarget,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, UpstreamError> {
        let url = Self::target_url(backend, &request.path_and_query)?;

        let response = self
            .client
            .request(request.method, url)
            .headers(strip_hop_by_hop(&request.headers))
            .body(request.body)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    UpstreamError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let headers = strip_hop_by_hop(response.headers());
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout
            } else {
                UpstreamError::Transport(e.to_string())
            }
        })?;

        let relayed = ProxyResponse {
            status,
            headers,
            body,
        };
        if status.is_server_error() {
            return Err(UpstreamError::ServerError(relayed));
        }
        Ok(relayed)
    }
}
