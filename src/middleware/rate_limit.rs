//! Rate limiting stage.
//!
//! Global limits and the route's own limits are checked together (global, route, user
//! order). Every response that passed through a check carries `X-RateLimit-*` headers;
//! a rejection answers 429 with `Retry-After`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;

use crate::error::GatewayError;
use crate::pipeline::{Next, RequestContext, Stage};
use crate::services::ratelimit::{LimitDefinition, RateLimitResult, RateLimiter};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
    global_limits: Vec<LimitDefinition>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>, global_limits: Vec<LimitDefinition>) -> Self {
        Self {
            limiter,
            global_limits,
        }
    }
}

fn apply_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(result.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(result.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(result.reset_at));
}

#[async_trait]
impl Stage for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Response {
        let mut definitions = self.global_limits.clone();
        if let Some(route) = &ctx.route {
            definitions.extend(route.limits.iter().cloned());
        }
        if definitions.is_empty() {
            return next.run(ctx).await;
        }

        let subject = ctx.rate_limit_subject();
        let verdict = match self
            .limiter
            .check_all(&subject, &definitions, ctx.deadline)
            .await
        {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::error!(error = %err, "rate limit definition rejected at request time");
                return GatewayError::Internal(err.to_string()).into_response_for(ctx);
            }
        };
        let header_source = verdict.header_source().cloned();
        let rejected_by = verdict.rejected_by.clone();
        ctx.rate_limit = Some(verdict);

        let mut response = match (rejected_by, &header_source) {
            (Some(limit), Some(result)) => {
                tracing::info!(
                    limit = %limit,
                    route = ctx.route_id(),
                    degraded = result.degraded,
                    "rate limit exceeded"
                );
                GatewayError::RateLimited {
                    limit,
                    retry_after: result.retry_after.unwrap_or(1).max(1),
                }
                .into_response_for(ctx)
            }
            _ => next.run(ctx).await,
        };

        if let Some(result) = &header_source {
            apply_headers(response.headers_mut(), result);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::events::RecordingEventSink;
    use crate::pipeline::Pipeline;
    use crate::services::ratelimit::KeyTemplate;
    use crate::services::ratelimit::storage::InMemoryRateLimitStorage;
    use axum::http::{Method, StatusCode, Uri, header};
    use axum::response::IntoResponse;
    use std::time::Duration;

    struct Ok200;

    #[async_trait]
    impl Stage for Ok200 {
        fn name(&self) -> &'static str {
            "ok"
        }

        async fn handle(&self, _ctx: &mut RequestContext, _next: Next<'_>) -> Response {
            StatusCode::OK.into_response()
        }
    }

    fn pipeline(limits: Vec<LimitDefinition>) -> Pipeline {
        let limiter = RateLimiter::new(
            Arc::new(InMemoryRateLimitStorage::new()),
            &RateLimitConfig::default(),
            RecordingEventSink::new(),
        );
        Pipeline::builder()
            .stage(RateLimitMiddleware::new(Arc::new(limiter), limits))
            .stage(Ok200)
            .build()
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Method::GET, Uri::from_static("/x"), HeaderMap::new(), "c")
            .with_client_ip(Some("192.0.2.10".parse().unwrap()))
    }

    fn per_ip(limit: u32) -> LimitDefinition {
        LimitDefinition::new(
            "per-ip",
            "ip".parse::<KeyTemplate>().unwrap(),
            limit,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_headers_on_allowed_and_rejected() {
        let pipeline = pipeline(vec![per_ip(2)]);

        let first = pipeline.execute(&mut ctx()).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()[X_RATELIMIT_LIMIT], "2");
        assert_eq!(first.headers()[X_RATELIMIT_REMAINING], "1");
        assert!(first.headers().contains_key(X_RATELIMIT_RESET));

        let second = pipeline.execute(&mut ctx()).await;
        assert_eq!(second.headers()[X_RATELIMIT_REMAINING], "0");

        let mut rejected_ctx = ctx();
        let third = pipeline.execute(&mut rejected_ctx).await;
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(third.headers()[X_RATELIMIT_REMAINING], "0");
        let retry: u64 = third.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry >= 1);
        assert_eq!(
            rejected_ctx.rate_limit.unwrap().rejected_by.as_deref(),
            Some("per-ip")
        );
    }

    #[tokio::test]
    async fn test_no_limits_means_no_headers() {
        let response = pipeline(vec![]).execute(&mut ctx()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(X_RATELIMIT_LIMIT));
    }

    #[tokio::test]
    async fn test_user_limit_skipped_for_anonymous_request() {
        let per_user = LimitDefinition::new(
            "per-user",
            "user".parse::<KeyTemplate>().unwrap(),
            1,
            Duration::from_secs(60),
        );
        let pipeline = pipeline(vec![per_user]);

        for _ in 0..3 {
            let response = pipeline.execute(&mut ctx()).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key(X_RATELIMIT_LIMIT));
        }
    }
}
