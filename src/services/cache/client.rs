//! Cache client interface used by higher-level services (revocation lookups, rate-limit state).
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-layer errors (transport/command/serialization).
///
/// Note:
/// - We keep this independent from `GatewayError` so callers can decide how to fail
///   (fail-open or fail-closed, per their configured failure mode).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    BackendConnection(String),
    #[error("cache command error: {0}")]
    BackendCommand(String),
    #[error("cache value error: {0}")]
    InvalidValue(String),
}

/// A minimal cache interface.
///
/// This is intentionally small and string-based:
/// - Rate-limit state only needs `GET` and `SET EX`.
/// - Revocation lookups only need `EXISTS`.
///
/// Implementations must be cheap to clone (typically `Arc<...>` inside)
#[async_trait]
pub trait CacheClient: Clone + Send + Sync + 'static {
    // Returns the cache backend name (for logging/metrics).
    fn backend_name(&self) -> &'static str;

    // Get UTF-8 string value.
    async fn get_string(&self, key: &str) -> CacheResult<Option<String>>;

    // Set value unconditionally with TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    // Returns true when the key exists.
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    // Round-trip health check.
    async fn ping(&self) -> CacheResult<()>;
}
