//! axum entry point: turn an inbound request into a `RequestContext` and run the pipeline.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::response::Response;

use super::http::CORRELATION_ID_HEADER;
use crate::error::GatewayError;
use crate::pipeline::RequestContext;
use crate::services::cache::expires_after;
use crate::state::AppState;

pub async fn proxy(State(state): State<AppState>, request: Request<Body>) -> Response {
    let connect_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let (parts, body) = request.into_parts();

    let correlation_id = parts
        .headers
        .get(&CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let client_ip = if state.trust_forwarded_for {
        forwarded_client(&parts.headers).or(connect_ip)
    } else {
        connect_ip
    };

    let mut ctx = RequestContext::new(parts.method, parts.uri, parts.headers, correlation_id)
        .with_client_ip(client_ip)
        .with_deadline(expires_after(Instant::now(), state.request_timeout));

    let body = match to_bytes(body, state.body_limit_bytes).await {
        Ok(body) => body,
        Err(err) => {
            return GatewayError::BadRequest(format!("unreadable request body: {err}"))
                .into_response_for(&ctx);
        }
    };
    ctx = ctx.with_body(body);

    match state.routes.resolve(&ctx.method, ctx.path()) {
        Some(route) => ctx = ctx.with_route(route),
        None => {
            tracing::debug!(method = %ctx.method, path = ctx.path(), "no route matched");
            return GatewayError::RouteNotFound.into_response_for(&ctx);
        }
    }

    state.pipeline.execute(&mut ctx).await
}

/// Left-most address in `X-Forwarded-For`.
fn forwarded_client(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}
