//! Terminal stage: relay the request to the route's backend through its circuit breaker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use axum::response::Response;

use crate::error::GatewayError;
use crate::pipeline::{Next, RequestContext, Stage};
use crate::services::breaker::{BreakerError, CircuitBreakerManager};
use crate::services::upstream::{ProxyRequest, Upstream, UpstreamError};

const X_CORRELATION_ID: HeaderName = HeaderName::from_static("x-correlation-id");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_AUTHENTICATED_USER: HeaderName = HeaderName::from_static("x-authenticated-user");

pub struct BackendMiddleware {
    breakers: Arc<CircuitBreakerManager>,
    upstream: Arc<dyn Upstream>,
    timeout: Duration,
}

impl BackendMiddleware {
    pub fn new(
        breakers: Arc<CircuitBreakerManager>,
        upstream: Arc<dyn Upstream>,
        timeout: Duration,
    ) -> Self {
        Self {
            breakers,
            upstream,
            timeout,
        }
    }

    fn proxy_request(&self, ctx: &RequestContext, timeout: Duration) -> ProxyRequest {
        let mut headers = ctx.headers.clone();
        // Only the gateway vouches for identity headers.
        headers.remove(&X_AUTHENTICATED_USER);
        if let Ok(value) = HeaderValue::from_str(&ctx.correlation_id) {
            headers.insert(X_CORRELATION_ID, value);
        }
        if let Some(ip) = ctx.client_ip {
            let forwarded = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(chain) => format!("{chain}, {ip}"),
                None => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
        if let Some(user) = &ctx.user {
            if let Ok(value) = HeaderValue::from_str(user.user_id()) {
                headers.insert(X_AUTHENTICATED_USER, value);
            }
        }

        ProxyRequest {
            method: ctx.method.clone(),
            path_and_query: ctx
                .uri
                .path_and_query()
                .map_or_else(|| ctx.path().to_string(), |pq| pq.as_str().to_string()),
            headers,
            body: ctx.body.clone(),
            timeout,
        }
    }
}

#[async_trait]
impl Stage for BackendMiddleware {
    fn name(&self) -> &'static str {
        "backend"
    }

    async fn handle(&self, ctx: &mut RequestContext, _next: Next<'_>) -> Response {
        let Some(route) = ctx.route.clone() else {
            return GatewayError::RouteNotFound.into_response_for(ctx);
        };

        let timeout = match ctx.deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(left) if !left.is_zero() => left.min(self.timeout),
                _ => return GatewayError::Timeout.into_response_for(ctx),
            },
            None => self.timeout,
        };

        let request = self.proxy_request(ctx, timeout);
        let breaker = self.breakers.get(&route.backend.name);
        let upstream = &self.upstream;
        let backend = &route.backend;

        match breaker.execute(|| upstream.forward(backend, request)).await {
            Ok(response) => response.into_response(),
            Err(BreakerError::Open { backend }) => {
                tracing::debug!(backend = %backend, "circuit open, request not forwarded");
                GatewayError::CircuitOpen { backend }.into_response_for(ctx)
            }
            Err(BreakerError::Inner(UpstreamError::ServerError(response))) => {
                tracing::warn!(
                    backend = %route.backend.name,
                    status = %response.status,
                    "backend answered with a server error"
                );
                response.into_response()
            }
            Err(BreakerError::Inner(UpstreamError::Timeout)) => {
                tracing::warn!(backend = %route.backend.name, "backend timed out");
                GatewayError::Timeout.into_response_for(ctx)
            }
            Err(BreakerError::Inner(UpstreamError::Transport(err))) => {
                GatewayError::BadGateway(err).into_response_for(ctx)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;
    use crate::pipeline::Pipeline;
    use crate::services::breaker::{CircuitBreakerConfig, CircuitState};
    use crate::services::routing::{BackendTarget, Route};
    use crate::services::upstream::ProxyResponse;
    use axum::body::Bytes;
    use axum::http::{HeaderMap, Method, StatusCode, Uri};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Answers with queued statuses and remembers the requests it saw.
    #[derive(Default)]
    struct ScriptedUpstream {
        statuses: Mutex<Vec<StatusCode>>,
        seen: Mutex<Vec<ProxyRequest>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn forward(
            &self,
            _backend: &BackendTarget,
            request: ProxyRequest,
        ) -> Result<ProxyResponse, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request);
            let status = self.statuses.lock().unwrap().pop().unwrap_or(StatusCode::OK);
            let response = ProxyResponse {
                status,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"payload"),
            };
            if status.is_server_error() {
                Err(UpstreamError::ServerError(response))
            } else {
                Ok(response)
            }
        }
    }

    fn route() -> Arc<Route> {
        Arc::new(Route {
            id: "orders".into(),
            path_prefix: "/orders".into(),
            methods: vec![],
            backend: BackendTarget {
                name: "orders-svc".into(),
                url: "http://orders".into(),
            },
            policy: Default::default(),
            limits: vec![],
        })
    }

    fn setup(threshold: u32) -> (Pipeline, Arc<ScriptedUpstream>, Arc<CircuitBreakerManager>) {
        let upstream = Arc::new(ScriptedUpstream::default());
        let breakers = Arc::new(CircuitBreakerManager::new(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                success_threshold: 1,
                timeout: Duration::from_secs(60),
                max_half_open_requests: 1,
            },
            RecordingEventSink::new(),
        ));
        let pipeline = Pipeline::builder()
            .stage(BackendMiddleware::new(
                breakers.clone(),
                upstream.clone(),
                Duration::from_secs(5),
            ))
            .build();
        (pipeline, upstream, breakers)
    }

    fn ctx() -> RequestContext {
        RequestContext::new(
            Method::GET,
            Uri::from_static("/orders/7?full=1"),
            HeaderMap::new(),
            "corr-9",
        )
        .with_client_ip(Some("198.51.100.4".parse().unwrap()))
        .with_route(route())
    }

    #[tokio::test]
    async fn test_forwards_with_gateway_headers() {
        let (pipeline, upstream, _) = setup(3);

        let response = pipeline.execute(&mut ctx()).await;

        assert_eq!(response.status(), StatusCode::OK);
        let seen = upstream.seen.lock().unwrap();
        assert_eq!(seen[0].path_and_query, "/orders/7?full=1");
        assert_eq!(seen[0].headers["x-correlation-id"], "corr-9");
        assert_eq!(seen[0].headers["x-forwarded-for"], "198.51.100.4");
        assert!(seen[0].headers.get("x-authenticated-user").is_none());
    }

    #[tokio::test]
    async fn test_server_errors_pass_through_then_open_the_circuit() {
        let (pipeline, upstream, breakers) = setup(2);
        *upstream.statuses.lock().unwrap() =
            vec![StatusCode::INTERNAL_SERVER_ERROR, StatusCode::BAD_GATEWAY];

        let first = pipeline.execute(&mut ctx()).await;
        assert_eq!(first.status(), StatusCode::BAD_GATEWAY);
        let second = pipeline.execute(&mut ctx()).await;
        assert_eq!(second.status(), StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(breakers.get("orders-svc").state(), CircuitState::Open);

        let third = pipeline.execute(&mut ctx()).await;
        assert_eq!(third.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_route_is_not_found() {
        let (pipeline, upstream, _) = setup(3);
        let mut ctx = RequestContext::new(Method::GET, Uri::from_static("/x"), HeaderMap::new(), "c");

        let response = pipeline.execute(&mut ctx).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_deadline_is_not_forwarded() {
        let (pipeline, upstream, _) = setup(3);
        let mut ctx = ctx().with_deadline(Instant::now() - Duration::from_millis(1));

        let response = pipeline.execute(&mut ctx).await;

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }
}
