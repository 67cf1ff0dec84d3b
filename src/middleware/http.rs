//! HTTP-level middleware (cross-cutting concerns).
//!
//! Transport concerns that apply to every request before the gateway pipeline sees it.
//!
//! Responsibility:
//! - Correlation id generation + propagation (x-correlation-id)
//! - Access logging / request tracing (TraceLayer)
//! - Body size limits
//! - Global timeout, answered with the gateway error envelope

use std::time::Duration;

use axum::Router;
use axum::error_handling::HandleErrorLayer;
use axum::http::{HeaderMap, Uri, header::HeaderName};
use axum::response::Response;
use tower::timeout::TimeoutLayer;
use tower::{BoxError, ServiceBuilder};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::error::GatewayError;

pub const CORRELATION_ID_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");

#[derive(Debug, Clone, Copy)]
pub struct HttpLayerConfig {
    pub body_limit_bytes: usize,
    pub timeout: Duration,
}

impl Default for HttpLayerConfig {
    fn default() -> Self {
        Self {
            body_limit_bytes: 1024 * 1024,
            timeout: Duration::from_secs(30),
        }
    }
}

async fn handle_layer_error(headers: HeaderMap, uri: Uri, err: BoxError) -> Response {
    let correlation_id = headers
        .get(&CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let error = if err.is::<tower::timeout::error::Elapsed>() {
        GatewayError::Timeout
    } else {
        GatewayError::Internal(err.to_string())
    };
    error.into_response_with(uri.path(), &correlation_id)
}

/// Apply HTTP-level middleware to the given Router.
pub fn apply(router: Router, config: HttpLayerConfig) -> Router {
    let layers = ServiceBuilder::new()
        // Generate a correlation id if missing, then propagate it to the response.
        .layer(SetRequestIdLayer::new(CORRELATION_ID_HEADER, MakeRequestUuid))
        .layer(PropagateRequestIdLayer::new(CORRELATION_ID_HEADER))
        // Make the service error `Infallible` by converting errors into responses.
        .layer(HandleErrorLayer::new(handle_layer_error))
        .layer(RequestBodyLimitLayer::new(config.body_limit_bytes))
        .layer(TimeoutLayer::new(config.timeout))
        .layer(TraceLayer::new_for_http());

    router.layer(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use tower::ServiceExt;

    fn app(timeout: Duration) -> Router {
        let router = Router::new()
            .route("/fast", get(|| async { "ok" }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );
        apply(
            router,
            HttpLayerConfig {
                body_limit_bytes: 1024,
                timeout,
            },
        )
    }

    #[tokio::test]
    async fn test_correlation_id_generated_and_propagated() {
        let response = app(Duration::from_secs(1))
            .oneshot(Request::get("/fast").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(&CORRELATION_ID_HEADER));

        let response = app(Duration::from_secs(1))
            .oneshot(
                Request::get("/fast")
                    .header("x-correlation-id", "given-id")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()[&CORRELATION_ID_HEADER], "given-id");
    }

    #[tokio::test]
    async fn test_timeout_answers_with_envelope() {
        let response = app(Duration::from_millis(20))
            .oneshot(
                Request::get("/slow")
                    .header("x-correlation-id", "slow-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "gateway_timeout");
        assert_eq!(json["correlation_id"], "slow-1");
        assert_eq!(json["path"], "/slow");
    }
}
