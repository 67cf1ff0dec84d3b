use std::sync::Arc;

use async_trait::async_trait;

use super::{RevocationError, RevocationService};
use crate::services::cache::{CacheClient, ValkeyClient};

/// Valkey-backed revocation list (Redis protocol).
///
/// A session is revoked while `<prefix>:<session_id>` exists. Whoever revokes the
/// session writes that key, typically with a TTL matching the token lifetime.
#[derive(Clone)]
pub struct ValkeyRevocationService<C: CacheClient> {
    cache: Arc<C>,
    // Optional key prefix to avoid collisions across environments
    prefix: String,
}

impl ValkeyRevocationService<ValkeyClient> {
    pub async fn new(redis_url: &str) -> Result<Self, RevocationError> {
        Self::new_with_prefix(redis_url, "session:revoked").await
    }

    pub async fn new_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, RevocationError> {
        let client = ValkeyClient::new(redis_url).await?;

        Ok(Self {
            cache: Arc::new(client),
            prefix: prefix.into(),
        })
    }
}

impl<C: CacheClient> ValkeyRevocationService<C> {
    pub fn new_with_cache(cache: Arc<C>, prefix: impl Into<String>) -> Self {
        Self {
            cache,
            prefix: prefix.into(),
        }
    }

    pub fn key(&self, session_id: &str) -> String {
        format!("{}:{}", self.prefix, session_id)
    }
}

#[async_trait]
impl<C: CacheClient> RevocationService for ValkeyRevocationService<C> {
    async fn is_revoked(&self, session_id: &str) -> Result<bool, RevocationError> {
        Ok(self.cache.exists(&self.key(session_id)).await?)
    }
}
