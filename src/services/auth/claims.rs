use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;

/// Claims as they appear in the token. Everything is optional here; required-claim
/// checks happen in the validator.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawClaims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Space-separated OAuth scopes, read as permissions when `permissions` is absent.
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub iat: Option<u64>,
    #[serde(default)]
    pub exp: Option<u64>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<AudienceClaim>,
}

/// `aud` may be a single string or an array of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum AudienceClaim {
    One(String),
    Many(Vec<String>),
}

impl AudienceClaim {
    fn into_vec(self) -> Vec<String> {
        match self {
            AudienceClaim::One(aud) => vec![aud],
            AudienceClaim::Many(auds) => auds,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Verified session claims. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClaims {
    user_id: String,
    session_id: Option<String>,
    roles: BTreeSet<String>,
    permissions: BTreeSet<String>,
    issued_at: Option<u64>,
    expires_at: Option<u64>,
    issuer: Option<String>,
    audience: Vec<String>,
}

impl SessionClaims {
    pub fn new(user_id: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id,
            roles: BTreeSet::new(),
            permissions: BTreeSet::new(),
            issued_at: None,
            expires_at: None,
            issuer: None,
            audience: Vec::new(),
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    /// `user_id` falls back to `sub`, `session_id` to `sid`. `None` when the token
    /// names no user at all.
    pub(crate) fn from_raw(raw: RawClaims) -> Option<Self> {
        let user_id = non_empty(raw.user_id).or_else(|| non_empty(raw.sub))?;
        let session_id = non_empty(raw.session_id).or_else(|| non_empty(raw.sid));

        let permissions: BTreeSet<String> = if raw.permissions.is_empty() {
            raw.scope
                .as_deref()
                .unwrap_or_default()
                .split_whitespace()
                .map(str::to_string)
                .collect()
        } else {
            raw.permissions.into_iter().collect()
        };

        Some(Self {
            user_id,
            session_id,
            roles: raw.roles.into_iter().filter(|r| !r.is_empty()).collect(),
            permissions,
            issued_at: raw.iat,
            expires_at: raw.exp,
            issuer: non_empty(raw.iss),
            audience: raw
                .aud
                .map(AudienceClaim::into_vec)
                .unwrap_or_default()
                .into_iter()
                .filter(|aud| !aud.trim().is_empty())
                .collect(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    pub fn permissions(&self) -> &BTreeSet<String> {
        &self.permissions
    }

    pub fn issued_at(&self) -> Option<u64> {
        self.issued_at
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }

    pub fn issuer(&self) -> Option<&str> {
        self.issuer.as_deref()
    }

    /// Empty when the token carries no `aud`.
    pub fn audience(&self) -> &[String] {
        &self.audience
    }
}

/// Identity attached to a request after successful authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    claims: Arc<SessionClaims>,
}

impl UserContext {
    pub fn new(claims: SessionClaims) -> Self {
        Self {
            claims: Arc::new(claims),
        }
    }

    pub fn claims(&self) -> &SessionClaims {
        &self.claims
    }

    pub fn user_id(&self) -> &str {
        self.claims.user_id()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.claims.session_id()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.claims.roles.contains(role)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.claims.permissions.contains(permission)
    }
}

/// Claims an operator can require on top of `exp` (always required).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredClaim {
    UserId,
    SessionId,
    Roles,
    Permissions,
}

impl RequiredClaim {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequiredClaim::UserId => "user_id",
            RequiredClaim::SessionId => "session_id",
            RequiredClaim::Roles => "roles",
            RequiredClaim::Permissions => "permissions",
        }
    }

    pub fn is_present(&self, claims: &SessionClaims) -> bool {
        match self {
            RequiredClaim::UserId => !claims.user_id.is_empty(),
            RequiredClaim::SessionId => claims.session_id.is_some(),
            RequiredClaim::Roles => !claims.roles.is_empty(),
            RequiredClaim::Permissions => !claims.permissions.is_empty(),
        }
    }
}

impl fmt::Display for RequiredClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequiredClaim {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user_id" | "sub" => Ok(RequiredClaim::UserId),
            "session_id" | "sid" => Ok(RequiredClaim::SessionId),
            "roles" => Ok(RequiredClaim::Roles),
            "permissions" => Ok(RequiredClaim::Permissions),
            other => Err(format!("unknown claim `{other}`")),
        }
    }
}
