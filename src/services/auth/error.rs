use axum::http::StatusCode;
use thiserror::Error;

use super::policy::{PolicyDecision, PolicyError};

/// Why a request was not authorized.
///
/// `code()` is the stable machine-readable value that ends up in the error envelope
/// and the `X-Auth-Error` header.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication token is missing")]
    MissingToken,
    #[error("authentication token is invalid")]
    InvalidToken,
    #[error("authentication token has expired")]
    TokenExpired,
    #[error("authentication token is not yet valid")]
    TokenNotYetValid,
    #[error("required claim `{0}` is missing")]
    MissingClaim(String),
    #[error("session has been revoked")]
    TokenRevoked,
    #[error("session revocation status is unavailable")]
    RevocationUnavailable,
    #[error("access denied: {}", .0.reason)]
    Forbidden(PolicyDecision),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::InvalidToken => "invalid_token",
            AuthError::TokenExpired => "token_expired",
            AuthError::TokenNotYetValid => "token_not_yet_valid",
            AuthError::MissingClaim(_) => "missing_claim",
            AuthError::TokenRevoked | AuthError::RevocationUnavailable => "token_revoked",
            AuthError::Forbidden(_) => "forbidden",
            AuthError::Policy(_) => "policy_evaluation_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
            AuthError::Policy(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_statuses() {
        let cases = [
            (AuthError::MissingToken, "missing_token", StatusCode::UNAUTHORIZED),
            (AuthError::InvalidToken, "invalid_token", StatusCode::UNAUTHORIZED),
            (AuthError::TokenExpired, "token_expired", StatusCode::UNAUTHORIZED),
            (AuthError::TokenNotYetValid, "token_not_yet_valid", StatusCode::UNAUTHORIZED),
            (AuthError::MissingClaim("session_id".into()), "missing_claim", StatusCode::UNAUTHORIZED),
            (AuthError::TokenRevoked, "token_revoked", StatusCode::UNAUTHORIZED),
            (AuthError::RevocationUnavailable, "token_revoked", StatusCode::UNAUTHORIZED),
            (
                AuthError::Forbidden(PolicyDecision::deny("missing role")),
                "forbidden",
                StatusCode::FORBIDDEN,
            ),
            (
                AuthError::Policy(PolicyError::UnknownCustomPolicy("x".into())),
                "policy_evaluation_error",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.status(), status);
        }
    }
}
