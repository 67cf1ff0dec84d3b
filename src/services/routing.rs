//! Route table: which backend serves a path, under which policy and limits.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use axum::http::Method;
use serde::Deserialize;
use thiserror::Error;

use crate::services::auth::AuthorizationPolicy;
use crate::services::ratelimit::LimitDefinition;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackendTarget {
    /// Breaker identity; routes sharing a backend share its breaker.
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Route {
    pub id: String,
    pub path_prefix: String,
    /// Empty means any method.
    #[serde(default)]
    pub methods: Vec<String>,
    pub backend: BackendTarget,
    #[serde(default)]
    pub policy: AuthorizationPolicy,
    #[serde(default)]
    pub limits: Vec<LimitDefinition>,
}

impl Route {
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        let method_ok = self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method.as_str()));
        method_ok && prefix_matches(&self.path_prefix, path)
    }
}

/// `/api` matches `/api` and `/api/x`, never `/apix`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

pub trait RouteResolver: Send + Sync {
    fn resolve(&self, method: &Method, path: &str) -> Option<Arc<Route>>;
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("cannot read route file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse route file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid route `{id}`: {reason}")]
    Invalid { id: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct RouteFile {
    routes: Vec<Route>,
}

/// Fixed routes, matched by longest path prefix.
#[derive(Debug, Clone, Default)]
pub struct StaticRouteTable {
    routes: Vec<Arc<Route>>,
}

impl StaticRouteTable {
    pub fn new(routes: Vec<Route>) -> Result<Self, RouteError> {
        let mut seen = HashSet::new();
        for route in &routes {
            let invalid = |reason: String| RouteError::Invalid {
                id: route.id.clone(),
                reason,
            };
            if !seen.insert(route.id.as_str()) {
                return Err(invalid("duplicate route id".into()));
            }
            if !route.path_prefix.starts_with('/') {
                return Err(invalid("path_prefix must start with `/`".into()));
            }
            if route.backend.name.trim().is_empty() {
                return Err(invalid("backend name must not be empty".into()));
            }
            for limit in &route.limits {
                limit.validate().map_err(|e| invalid(e.to_string()))?;
            }
        }

        let mut routes: Vec<Arc<Route>> = routes.into_iter().map(Arc::new).collect();
        routes.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        Ok(Self { routes })
    }

    pub fn from_json_str(json: &str) -> Result<Self, RouteError> {
        let file: RouteFile = serde_json::from_str(json)?;
        Self::new(file.routes)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RouteError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl RouteResolver for StaticRouteTable {
    fn resolve(&self, method: &Method, path: &str) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .find(|route| route.matches(method, path))
            .cloned()
    }
}
