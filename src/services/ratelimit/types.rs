//! Rate limiter types and core data structures

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use super::key::{KeyError, KeyTemplate};

/// Evaluation priority of a limit definition. Lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    Global,
    #[default]
    Route,
    User,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitScope::Global => "global",
            LimitScope::Route => "route",
            LimitScope::User => "user",
        }
    }
}

/// Longest window a limit may declare.
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

fn default_cost() -> u32 {
    1
}

/// One configured limit: `limit` requests per `window_secs`, keyed by `key`.
///
/// The bucket capacity is `burst` when given, `limit` otherwise; it refills at
/// `limit / window_secs` tokens per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitDefinition {
    pub name: String,
    pub key: KeyTemplate,
    pub limit: u32,
    pub window_secs: u64,
    #[serde(default)]
    pub burst: Option<u32>,
    #[serde(default = "default_cost")]
    pub cost: u32,
    #[serde(default)]
    pub scope: LimitScope,
}

impl LimitDefinition {
    pub fn new(name: impl Into<String>, key: KeyTemplate, limit: u32, window: Duration) -> Self {
        Self {
            name: name.into(),
            key,
            limit,
            window_secs: window.as_secs(),
            burst: None,
            cost: 1,
            scope: LimitScope::Route,
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn with_scope(mut self, scope: LimitScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    pub fn capacity(&self) -> f64 {
        f64::from(self.burst.unwrap_or(self.limit))
    }

    /// Tokens per second.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.limit) / self.window_secs.max(1) as f64
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Idle buckets outlive two full windows, then expire in storage.
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.window_secs.saturating_mul(2).max(1))
    }

    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.name.trim().is_empty() {
            return Err(RateLimitError::InvalidDefinition {
                name: self.name.clone(),
                reason: "name must not be empty",
            });
        }
        if self.limit == 0 {
            return Err(RateLimitError::InvalidDefinition {
                name: self.name.clone(),
                reason: "limit must be greater than zero",
            });
        }
        if self.window_secs == 0 {
            return Err(RateLimitError::InvalidDefinition {
                name: self.name.clone(),
                reason: "window must be at least one second",
            });
        }
        if self.window_secs > MAX_WINDOW_SECS {
            return Err(RateLimitError::InvalidDefinition {
                name: self.name.clone(),
                reason: "window must not exceed one year",
            });
        }
        if self.burst == Some(0) {
            return Err(RateLimitError::InvalidDefinition {
                name: self.name.clone(),
                reason: "burst must be greater than zero",
            });
        }
        if f64::from(self.cost) > self.capacity() {
            return Err(RateLimitError::InvalidDefinition {
                name: self.name.clone(),
                reason: "cost exceeds bucket capacity",
            });
        }
        Ok(())
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Bucket capacity
    pub limit: u32,
    /// Whole tokens left after this check
    pub remaining: u32,
    /// Unix timestamp (seconds) when the bucket is full again
    pub reset_at: u64,
    /// Retry-After in seconds (only set when blocked)
    pub retry_after: Option<u64>,
    /// True when the failure mode decided instead of bucket state
    pub degraded: bool,
}

/// Outcome of evaluating every applicable limit for one request.
#[derive(Debug, Clone, Default)]
pub struct RateLimitVerdict {
    /// `(limit name, result)` for every definition that was actually checked, in order.
    pub checked: Vec<(String, RateLimitResult)>,
    /// Name of the limit that rejected the request, if any.
    pub rejected_by: Option<String>,
}

impl RateLimitVerdict {
    pub fn allowed(&self) -> bool {
        self.rejected_by.is_none()
    }

    /// The result that feeds the `X-RateLimit-*` headers: the rejecting limit when
    /// rejected, otherwise the most constrained limit checked so far.
    pub fn header_source(&self) -> Option<&RateLimitResult> {
        if let Some(name) = &self.rejected_by {
            return self
                .checked
                .iter()
                .find(|(checked, _)| checked == name)
                .map(|(_, result)| result);
        }
        self.checked
            .iter()
            .map(|(_, result)| result)
            .min_by_key(|result| result.remaining)
    }
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("invalid limit definition `{name}`: {reason}")]
    InvalidDefinition { name: String, reason: &'static str },
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Get current time in milliseconds since Unix epoch
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Get current time in seconds since Unix epoch
pub fn current_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
