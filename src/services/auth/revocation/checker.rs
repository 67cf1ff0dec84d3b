use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{RevocationError, RevocationService};
use crate::config::FailureMode;
use crate::services::auth::error::AuthError;
use crate::services::cache::{SweeperHandle, TtlCache, expires_after};

/// Revocation lookups with a short-lived local cache and a failure mode.
///
/// Both outcomes (revoked / not revoked) are cached. Lookup failures are not, so the
/// next request asks the backend again.
pub struct RevocationChecker {
    service: Arc<dyn RevocationService>,
    cache: Arc<TtlCache<String, bool>>,
    failure_mode: FailureMode,
    timeout: Duration,
}

impl std::fmt::Debug for RevocationChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevocationChecker")
            .field("cache_ttl", &self.cache.ttl())
            .field("failure_mode", &self.failure_mode)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RevocationChecker {
    pub fn new(
        service: Arc<dyn RevocationService>,
        cache_ttl: Duration,
        failure_mode: FailureMode,
        timeout: Duration,
    ) -> Self {
        Self {
            service,
            cache: Arc::new(TtlCache::new(cache_ttl)),
            failure_mode,
            timeout,
        }
    }

    pub fn start_sweeper(&self, period: Duration) -> SweeperHandle {
        self.cache.start_sweeper("revocation-cache", period)
    }

    pub async fn check(&self, session_id: &str, deadline: Option<Instant>) -> Result<(), AuthError> {
        let revoked = match self.cache.get(&session_id.to_string()) {
            Some(revoked) => revoked,
            None => match self.lookup(session_id, deadline).await {
                Ok(revoked) => {
                    self.cache.insert(session_id.to_string(), revoked);
                    revoked
                }
                Err(err) => return self.on_failure(session_id, err),
            },
        };

        if revoked {
            tracing::info!(session_id, "rejecting revoked session");
            return Err(AuthError::TokenRevoked);
        }
        Ok(())
    }

    async fn lookup(
        &self,
        session_id: &str,
        deadline: Option<Instant>,
    ) -> Result<bool, LookupFailure> {
        let limit = expires_after(Instant::now(), self.timeout);
        let at = deadline.map_or(limit, |deadline| deadline.min(limit));

        match tokio::time::timeout_at(at.into(), self.service.is_revoked(session_id)).await {
            Ok(result) => result.map_err(LookupFailure::Backend),
            Err(_) => Err(LookupFailure::TimedOut),
        }
    }

    fn on_failure(&self, session_id: &str, failure: LookupFailure) -> Result<(), AuthError> {
        match self.failure_mode {
            FailureMode::FailOpen => {
                tracing::warn!(session_id, error = %failure, "revocation check failed, allowing (fail-open)");
                Ok(())
            }
            FailureMode::FailClosed => {
                tracing::warn!(session_id, error = %failure, "revocation check failed, rejecting (fail-closed)");
                Err(AuthError::RevocationUnavailable)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum LookupFailure {
    #[error(transparent)]
    Backend(RevocationError),
    #[error("revocation lookup timed out")]
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::auth::revocation::MockRevocationService;
    use async_trait::async_trait;

    fn checker(service: impl RevocationService + 'static, mode: FailureMode) -> RevocationChecker {
        RevocationChecker::new(
            Arc::new(service),
            Duration::from_secs(60),
            mode,
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_result_is_cached() {
        let mut mock = MockRevocationService::new();
        mock.expect_is_revoked().times(1).returning(|_| Ok(false));
        let checker = checker(mock, FailureMode::FailClosed);

        checker.check("s1", None).await.unwrap();
        checker.check("s1", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_revoked_session_is_rejected_from_cache_too() {
        let mut mock = MockRevocationService::new();
        mock.expect_is_revoked().times(1).returning(|_| Ok(true));
        let checker = checker(mock, FailureMode::FailOpen);

        assert!(matches!(checker.check("s1", None).await, Err(AuthError::TokenRevoked)));
        assert!(matches!(checker.check("s1", None).await, Err(AuthError::TokenRevoked)));
    }

    #[tokio::test]
    async fn test_fail_open_allows_on_backend_error() {
        let mut mock = MockRevocationService::new();
        mock.expect_is_revoked()
            .returning(|_| Err(RevocationError::Http("503".into())));
        let checker = checker(mock, FailureMode::FailOpen);

        assert!(checker.check("s1", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_closed_rejects_on_backend_error() {
        let mut mock = MockRevocationService::new();
        mock.expect_is_revoked()
            .returning(|_| Err(RevocationError::Http("503".into())));
        let checker = checker(mock, FailureMode::FailClosed);

        let err = checker.check("s1", None).await.unwrap_err();
        assert_eq!(err.code(), "token_revoked");
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let mut mock = MockRevocationService::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_is_revoked()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(RevocationError::Http("503".into())));
        mock.expect_is_revoked()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));
        let checker = checker(mock, FailureMode::FailOpen);

        assert!(checker.check("s1", None).await.is_ok());
        assert!(matches!(checker.check("s1", None).await, Err(AuthError::TokenRevoked)));
    }

    struct Hanging;

    #[async_trait]
    impl RevocationService for Hanging {
        async fn is_revoked(&self, _session_id: &str) -> Result<bool, RevocationError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_slow_backend_times_out_into_failure_mode() {
        let started = Instant::now();
        let result = checker(Hanging, FailureMode::FailClosed).check("s1", None).await;

        assert!(matches!(result, Err(AuthError::RevocationUnavailable)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
