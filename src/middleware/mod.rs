/*
 * Responsibility
 * - Pipeline stages (authorization, rate limiting, backend relay)
 * - axum entry point feeding the pipeline and HTTP-level layers
 */
pub mod auth;
pub mod backend;
pub mod gateway;
pub mod http;
pub mod rate_limit;

pub use auth::AuthorizationMiddleware;
pub use backend::BackendMiddleware;
pub use rate_limit::RateLimitMiddleware;
