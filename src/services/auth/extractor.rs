use axum::http::{HeaderMap, header};
use axum_extra::extract::cookie::CookieJar;

use super::error::AuthError;

/// Pulls the session token out of the request: the configured cookie first, then
/// (when enabled) an `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct TokenExtractor {
    cookie_name: String,
    allow_bearer: bool,
}

impl TokenExtractor {
    pub fn new(cookie_name: impl Into<String>, allow_bearer: bool) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            allow_bearer,
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn extract(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let jar = CookieJar::from_headers(headers);
        if let Some(cookie) = jar.get(&self.cookie_name) {
            let value = cookie.value().trim();
            if !value.is_empty() {
                return Ok(value.to_string());
            }
        }

        if self.allow_bearer {
            let bearer = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::trim)
                .filter(|token| !token.is_empty());
            if let Some(token) = bearer {
                return Ok(token.to_string());
            }
        }

        Err(AuthError::MissingToken)
    }
}
