//! Session revocation lookups.

mod checker;
mod http;
mod valkey;

pub use checker::RevocationChecker;
pub use http::HttpRevocationService;
pub use valkey::ValkeyRevocationService;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::config::RevocationBackend;
use crate::services::cache::CacheError;

#[derive(Debug, Error)]
pub enum RevocationError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("revocation endpoint error: {0}")]
    Http(String),
}

/// Answers whether a session has been revoked.
///
/// - `Ok(true)`: revoked
/// - `Ok(false)`: still valid
/// - `Err(_)`: status unknown; the checker applies its failure mode
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RevocationService: Send + Sync {
    async fn is_revoked(&self, session_id: &str) -> Result<bool, RevocationError>;
}

/// Fixed set of revoked session ids. An empty list revokes nothing.
#[derive(Debug, Clone, Default)]
pub struct StaticRevocationList {
    revoked: HashSet<String>,
}

impl StaticRevocationList {
    pub fn new<I, S>(revoked: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            revoked: revoked.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl RevocationService for StaticRevocationList {
    async fn is_revoked(&self, session_id: &str) -> Result<bool, RevocationError> {
        Ok(self.revoked.contains(session_id))
    }
}

pub async fn build_revocation_service(
    backend: &RevocationBackend,
) -> Result<Arc<dyn RevocationService>, RevocationError> {
    match backend {
        RevocationBackend::Static(sessions) => {
            if sessions.is_empty() {
                tracing::warn!("no revocation backend configured; sessions are never revoked");
            }
            Ok(Arc::new(StaticRevocationList::new(sessions.iter().cloned())))
        }
        RevocationBackend::Http { url, timeout } => {
            Ok(Arc::new(HttpRevocationService::new(url.clone(), *timeout)?))
        }
        RevocationBackend::Valkey { url, prefix } => Ok(Arc::new(
            ValkeyRevocationService::new_with_prefix(url, prefix.clone()).await?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_list() {
        let list = StaticRevocationList::new(["s-revoked"]);

        assert!(list.is_revoked("s-revoked").await.unwrap());
        assert!(!list.is_revoked("s-live").await.unwrap());
    }
}
