//! Rate limit storage backends
//!
//! - In-memory for development and single-instance deployments
//! - Redis/Valkey for distributed deployments
//! - DynamoDB for deployments without a cache cluster

mod dynamodb;
mod memory;
mod redis;

pub use dynamodb::DynamoDbRateLimitStorage;
pub use memory::InMemoryRateLimitStorage;
pub use redis::RedisRateLimitStorage;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::bucket::TokenBucketState;
use crate::config::{RateLimitConfig, StorageBackendConfig};
use crate::services::cache::{CacheError, ValkeyClient};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("rate limit storage backend error: {0}")]
    Backend(String),
    #[error("rate limit state is corrupt: {0}")]
    Serialization(String),
    #[error("rate limit storage timed out")]
    Timeout,
    #[error("rate limit storage is closed")]
    Closed,
}

impl From<CacheError> for StorageError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::InvalidValue(msg) => StorageError::Serialization(msg),
            other => StorageError::Backend(other.to_string()),
        }
    }
}

/// Persistence for token bucket state. Implementations only store and load; the
/// limiter serializes access per key.
#[async_trait]
pub trait RateLimitStorage: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<TokenBucketState>, StorageError>;

    /// Store `state`; it may be dropped by the backend once `ttl` elapses without a write.
    async fn set(&self, key: &str, state: &TokenBucketState, ttl: Duration)
    -> Result<(), StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;

    /// Release background work and connections.
    async fn close(&self) -> Result<(), StorageError>;
}

/// Build the configured backend.
pub async fn build_storage(
    config: &RateLimitConfig,
) -> Result<Arc<dyn RateLimitStorage>, StorageError> {
    match &config.backend {
        StorageBackendConfig::Memory { sweep_interval } => {
            let storage = InMemoryRateLimitStorage::new();
            storage.start_sweeper(*sweep_interval).await;
            tracing::info!("rate limiting uses in-memory storage");
            Ok(Arc::new(storage))
        }
        StorageBackendConfig::Redis { url } => {
            let client = ValkeyClient::new(url).await?;
            tracing::info!("rate limiting uses redis storage");
            Ok(Arc::new(RedisRateLimitStorage::new(client)))
        }
        StorageBackendConfig::DynamoDb {
            table,
            consistent_read,
            window,
        } => {
            let storage =
                DynamoDbRateLimitStorage::from_env(table, *consistent_read, *window).await;
            tracing::info!(table = %table, "rate limiting uses dynamodb storage");
            Ok(Arc::new(storage))
        }
    }
}
