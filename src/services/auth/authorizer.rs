//! Request authorization: token extraction, verification, revocation and policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;

use super::claims::UserContext;
use super::error::AuthError;
use super::extractor::TokenExtractor;
use super::policy::{AuthorizationPolicy, PolicyEvaluator};
use super::revocation::{RevocationChecker, RevocationService};
use super::validator::{KeySetupError, TokenValidator};
use crate::config::AuthorizationConfig;
use crate::services::cache::SweeperHandle;

#[derive(Debug)]
pub struct Authorizer {
    extractor: TokenExtractor,
    validator: TokenValidator,
    revocation: RevocationChecker,
    policies: PolicyEvaluator,
}

impl Authorizer {
    pub fn new(
        extractor: TokenExtractor,
        validator: TokenValidator,
        revocation: RevocationChecker,
        policies: PolicyEvaluator,
    ) -> Self {
        Self {
            extractor,
            validator,
            revocation,
            policies,
        }
    }

    /// Wire every piece from configuration. Custom policies can be added to
    /// `policies` before handing it in.
    pub fn from_config(
        config: &AuthorizationConfig,
        revocation: Arc<dyn RevocationService>,
        policies: PolicyEvaluator,
    ) -> Result<Self, KeySetupError> {
        Ok(Self::new(
            TokenExtractor::new(config.cookie_name.clone(), config.allow_bearer),
            TokenValidator::new(config)?,
            RevocationChecker::new(
                revocation,
                config.revocation.cache_ttl,
                config.revocation.failure_mode,
                config.revocation.timeout,
            ),
            policies,
        ))
    }

    pub fn start_sweepers(&self, period: Duration) -> Vec<SweeperHandle> {
        vec![
            self.revocation.start_sweeper(period),
            self.policies.start_sweeper(period),
        ]
    }

    /// Decide whether the request may proceed under `policy`.
    ///
    /// Public policies return `Ok(None)` without looking at credentials at all.
    /// Otherwise the verified user is returned, or the first reason to refuse.
    pub async fn authorize(
        &self,
        headers: &HeaderMap,
        policy: &AuthorizationPolicy,
        deadline: Option<Instant>,
    ) -> Result<Option<UserContext>, AuthError> {
        if policy.is_public() {
            return Ok(None);
        }

        let token = self.extractor.extract(headers)?;
        let claims = self.validator.validate(&token)?;

        match claims.session_id() {
            Some(session_id) => self.revocation.check(session_id, deadline).await?,
            None => tracing::debug!(user_id = claims.user_id(), "token carries no session id, skipping revocation"),
        }

        let user = UserContext::new(claims);
        let decision = self.policies.evaluate(policy, Some(&user))?;
        if !decision.allowed {
            return Err(AuthError::Forbidden(decision));
        }

        Ok(Some(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailureMode;
    use crate::services::auth::policy::CombinationLogic;
    use crate::services::auth::revocation::{MockRevocationService, StaticRevocationList};
    use axum::http::{HeaderValue, header};
    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
    use serde_json::json;

    const SECRET: &str = "authorizer-test-secret-0123456789abcdef";

    fn authorizer(revocation: Arc<dyn RevocationService>) -> Authorizer {
        let mut config = AuthorizationConfig::with_secret(SECRET);
        config.revocation.failure_mode = FailureMode::FailClosed;
        Authorizer::from_config(&config, revocation, PolicyEvaluator::new(Duration::from_secs(30)))
            .unwrap()
    }

    fn cookie_headers(roles: &[&str]) -> HeaderMap {
        let now = chrono::Utc::now().timestamp();
        let token = encode(
            &Header::new(Algorithm::HS256),
            &json!({
                "sub": "u1",
                "session_id": "s1",
                "roles": roles,
                "iat": now,
                "exp": now + 600,
            }),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("session={token}")).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_public_policy_skips_everything() {
        let mut mock = MockRevocationService::new();
        mock.expect_is_revoked().never();
        let authorizer = authorizer(Arc::new(mock));

        let user = authorizer
            .authorize(&HeaderMap::new(), &AuthorizationPolicy::public(), None)
            .await
            .unwrap();
        assert!(user.is_none());
    }

    #[tokio::test]
    async fn test_missing_cookie() {
        let authorizer = authorizer(Arc::new(StaticRevocationList::default()));

        let err = authorizer
            .authorize(&HeaderMap::new(), &AuthorizationPolicy::authenticated(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "missing_token");
    }

    #[tokio::test]
    async fn test_authenticated_user_is_returned() {
        let authorizer = authorizer(Arc::new(StaticRevocationList::default()));

        let user = authorizer
            .authorize(&cookie_headers(&["user"]), &AuthorizationPolicy::authenticated(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.user_id(), "u1");
        assert_eq!(user.session_id(), Some("s1"));
    }

    #[tokio::test]
    async fn test_revoked_session() {
        let authorizer = authorizer(Arc::new(StaticRevocationList::new(["s1"])));

        let err = authorizer
            .authorize(&cookie_headers(&["user"]), &AuthorizationPolicy::authenticated(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenRevoked));
    }

    #[tokio::test]
    async fn test_role_policy_denial_is_forbidden() {
        let authorizer = authorizer(Arc::new(StaticRevocationList::default()));
        let policy = AuthorizationPolicy::roles(CombinationLogic::Or, ["admin"]);

        let err = authorizer
            .authorize(&cookie_headers(&["user"]), &policy, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
        assert_eq!(err.status(), axum::http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_revocation_checked_before_policy() {
        let mut mock = MockRevocationService::new();
        mock.expect_is_revoked()
            .times(1)
            .returning(|_| Err(crate::services::auth::revocation::RevocationError::Http("down".into())));
        let authorizer = authorizer(Arc::new(mock));

        let err = authorizer
            .authorize(&cookie_headers(&["admin"]), &AuthorizationPolicy::authenticated(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "token_revoked");
    }
}
