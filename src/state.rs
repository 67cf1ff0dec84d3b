/*
 * Responsibility
 * - Shared context attached to the Router (AppState)
 *   - the built pipeline, route table, limiter and breaker registry
 * - Cloned per request (everything inside is Arc or Copy)
 */
use std::sync::Arc;
use std::time::Duration;

use crate::pipeline::Pipeline;
use crate::services::breaker::CircuitBreakerManager;
use crate::services::ratelimit::RateLimiter;
use crate::services::routing::RouteResolver;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub routes: Arc<dyn RouteResolver>,
    pub limiter: Arc<RateLimiter>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub request_timeout: Duration,
    pub body_limit_bytes: usize,
    pub trust_forwarded_for: bool,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("pipeline", &self.pipeline)
            .field("limiter", &self.limiter)
            .field("breakers", &self.breakers.len())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}
