/*
 * Responsibility
 * - Gateway-level error taxonomy (what a refused request looks like to the client)
 * - Status codes, JSON error envelope and auth challenge headers
 * - Conversion from the service errors that reach the pipeline boundary
 */
use axum::{
    Json,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::pipeline::RequestContext;
use crate::services::auth::AuthError;

pub const X_AUTH_ERROR: HeaderName = HeaderName::from_static("x-auth-error");

/// Body of every error the gateway produces itself.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: &'static str,
    pub message: String,
    pub correlation_id: String,
    /// RFC 3339, UTC
    pub timestamp: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("rate limit `{limit}` exceeded")]
    RateLimited { limit: String, retry_after: u64 },
    #[error("circuit open for backend `{backend}`")]
    CircuitOpen { backend: String },
    #[error("no route for this path")]
    RouteNotFound,
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("upstream request failed: {0}")]
    BadGateway(String),
    #[error("request timed out")]
    Timeout,
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Auth(err) => err.code(),
            GatewayError::RateLimited { .. } => "rate_limit_exceeded",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::RouteNotFound => "route_not_found",
            GatewayError::BadRequest(_) => "invalid_request",
            GatewayError::BadGateway(_) => "bad_gateway",
            GatewayError::Timeout => "gateway_timeout",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Auth(err) => err.status(),
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Internal detail stays in the logs.
    fn message(&self) -> String {
        match self {
            GatewayError::Auth(AuthError::Policy(_)) => "authorization policy could not be evaluated".into(),
            GatewayError::BadGateway(_) => "upstream service is unreachable".into(),
            GatewayError::Internal(_) => "internal server error".into(),
            other => other.to_string(),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            GatewayError::Auth(AuthError::Forbidden(decision)) if !decision.details.is_empty() => {
                serde_json::to_value(&decision.details).ok()
            }
            GatewayError::Auth(AuthError::MissingClaim(claim)) => {
                Some(serde_json::json!({ "claim": claim }))
            }
            GatewayError::RateLimited { limit, retry_after } => Some(serde_json::json!({
                "limit": limit,
                "retry_after": retry_after,
            })),
            GatewayError::CircuitOpen { backend } => Some(serde_json::json!({ "backend": backend })),
            _ => None,
        }
    }

    pub fn into_response_for(self, ctx: &RequestContext) -> Response {
        self.into_response_with(ctx.path(), &ctx.correlation_id)
    }

    pub fn into_response_with(self, path: &str, correlation_id: &str) -> Response {
        let status = self.status();
        let code = self.code();

        match &self {
            GatewayError::Internal(detail) | GatewayError::BadGateway(detail) => {
                tracing::error!(code, correlation_id, detail = %detail, "request failed");
            }
            GatewayError::Auth(AuthError::Policy(err)) => {
                tracing::error!(code, correlation_id, error = %err, "policy evaluation failed");
            }
            _ => tracing::debug!(code, correlation_id, "request refused"),
        }

        let envelope = ErrorEnvelope {
            error: code,
            message: self.message(),
            correlation_id: correlation_id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            path: path.to_string(),
            details: self.details(),
        };

        let mut headers = HeaderMap::new();
        if status == StatusCode::UNAUTHORIZED {
            let challenge = format!("Cookie realm=\"edge-gateway\", error=\"{code}\"");
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                headers.insert(header::WWW_AUTHENTICATE, value);
            }
            headers.insert(X_AUTH_ERROR, HeaderValue::from_static(code));
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        }
        if let GatewayError::RateLimited { retry_after, .. } = &self {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(*retry_after));
        }

        (status, headers, Json(envelope)).into_response()
    }
}
