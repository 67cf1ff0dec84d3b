use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, Uri};

use crate::services::auth::UserContext;
use crate::services::ratelimit::{RateLimitSubject, RateLimitVerdict};
use crate::services::routing::Route;

/// Everything the stages know about one inbound request.
///
/// Stages attach what they learn (`user`, `rate_limit`) instead of passing values
/// through string-keyed maps.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    pub correlation_id: String,
    /// Work for this request should be abandoned past this instant.
    pub deadline: Option<Instant>,
    pub route: Option<Arc<Route>>,
    /// Set by the authorization stage; `None` for public routes.
    pub user: Option<UserContext>,
    pub rate_limit: Option<RateLimitVerdict>,
}

impl RequestContext {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, correlation_id: impl Into<String>) -> Self {
        Self {
            method,
            uri,
            headers,
            body: Bytes::new(),
            client_ip: None,
            correlation_id: correlation_id.into(),
            deadline: None,
            route: None,
            user: None,
            rate_limit: None,
        }
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn with_client_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.client_ip = ip;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_route(mut self, route: Arc<Route>) -> Self {
        self.route = Some(route);
        self
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route.as_deref().map(|route| route.id.as_str())
    }

    /// Key material for rate limiting: client ip, authenticated user, route id.
    pub fn rate_limit_subject(&self) -> RateLimitSubject {
        RateLimitSubject {
            client_ip: self.client_ip.map(|ip| ip.to_string()),
            user_id: self.user.as_ref().map(|user| user.user_id().to_string()),
            route: self.route_id().map(str::to_string),
        }
    }
}
