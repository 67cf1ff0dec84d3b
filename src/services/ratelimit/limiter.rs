//! Token bucket rate limiter over pluggable storage.
//!
//! Each check is a read-modify-write of one bucket: load state, refill and consume,
//! store state. Checks for the same key are serialized through a striped lock, so
//! concurrent requests on one instance can never overspend a bucket. Every storage call
//! is bounded by the storage timeout and the request deadline, whichever comes first.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::bucket::TokenBucket;
use super::key::{KeyError, KeyGenerator, RateLimitSubject};
use super::storage::{RateLimitStorage, StorageError};
use super::types::{
    LimitDefinition, RateLimitError, RateLimitResult, RateLimitVerdict, current_time_millis,
};
use crate::config::{FailureMode, RateLimitConfig};
use crate::events::{EventSink, GatewayEvent};
use crate::services::cache::expires_after;

const LOCK_STRIPES: usize = 64;

pub struct RateLimiter {
    storage: Arc<dyn RateLimitStorage>,
    keys: KeyGenerator,
    failure_mode: FailureMode,
    fail_closed_retry_after: Duration,
    storage_timeout: Duration,
    locks: Vec<Mutex<()>>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("backend", &self.storage.backend_name())
            .field("failure_mode", &self.failure_mode)
            .field("storage_timeout", &self.storage_timeout)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(
        storage: Arc<dyn RateLimitStorage>,
        config: &RateLimitConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            storage,
            keys: KeyGenerator::new(config.key_prefix.clone()),
            failure_mode: config.failure_mode,
            fail_closed_retry_after: config.fail_closed_retry_after,
            storage_timeout: config.storage_timeout,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            events,
        }
    }

    pub fn storage(&self) -> &Arc<dyn RateLimitStorage> {
        &self.storage
    }

    /// Consume `definition.cost` tokens from the subject's bucket.
    ///
    /// Returns `Ok(None)` when the subject lacks a dimension the key needs (for example
    /// a per-user limit on an anonymous request); such a limit does not apply.
    pub async fn allow(
        &self,
        subject: &RateLimitSubject,
        definition: &LimitDefinition,
        deadline: Option<Instant>,
    ) -> Result<Option<RateLimitResult>, RateLimitError> {
        definition.validate()?;
        let Some(key) = self.key_for(subject, definition)? else {
            return Ok(None);
        };

        let started = Instant::now();
        let result = {
            let _guard = self.lock_for(&key).lock().await;
            self.consume(&key, definition, deadline).await
        };

        self.events.emit(GatewayEvent::RateLimitCheck {
            limit_name: definition.name.clone(),
            allowed: result.allowed,
            remaining: result.remaining,
            degraded: result.degraded,
            latency: started.elapsed(),
        });

        Ok(Some(result))
    }

    /// Current bucket status without consuming. Storage failures report the degraded
    /// result the failure mode would produce.
    pub async fn peek(
        &self,
        subject: &RateLimitSubject,
        definition: &LimitDefinition,
        deadline: Option<Instant>,
    ) -> Result<Option<RateLimitResult>, RateLimitError> {
        definition.validate()?;
        let Some(key) = self.key_for(subject, definition)? else {
            return Ok(None);
        };

        let now = current_time_millis();
        let mut bucket = match self.bounded(deadline, self.storage.get(&key)).await {
            Ok(Some(state)) => {
                let mut bucket = TokenBucket::from_state(state);
                bucket.reconfigure(definition.capacity(), definition.refill_rate());
                bucket
            }
            Ok(None) => TokenBucket::new(definition.capacity(), definition.refill_rate(), now),
            Err(err) => return Ok(Some(self.degraded(definition, &key, err, now))),
        };
        bucket.refill(now);

        let cost = f64::from(definition.cost);
        Ok(Some(RateLimitResult {
            allowed: bucket.tokens() >= cost,
            limit: capacity_of(definition),
            remaining: bucket.remaining(),
            reset_at: bucket.reset_at_ms(now).div_ceil(1000),
            retry_after: bucket.retry_after_secs(cost).filter(|secs| *secs > 0),
            degraded: false,
        }))
    }

    /// Evaluate every applicable limit, global first, then route, then user.
    ///
    /// Stops at the first rejection; limits after it are not charged.
    pub async fn check_all(
        &self,
        subject: &RateLimitSubject,
        definitions: &[LimitDefinition],
        deadline: Option<Instant>,
    ) -> Result<RateLimitVerdict, RateLimitError> {
        let mut ordered: Vec<&LimitDefinition> = definitions.iter().collect();
        ordered.sort_by_key(|definition| definition.scope);

        let mut verdict = RateLimitVerdict::default();
        for definition in ordered {
            let Some(result) = self.allow(subject, definition, deadline).await? else {
                continue;
            };
            let allowed = result.allowed;
            verdict.checked.push((definition.name.clone(), result));
            if !allowed {
                verdict.rejected_by = Some(definition.name.clone());
                break;
            }
        }
        Ok(verdict)
    }

    fn key_for(
        &self,
        subject: &RateLimitSubject,
        definition: &LimitDefinition,
    ) -> Result<Option<String>, RateLimitError> {
        match self.keys.generate(definition, subject) {
            Ok(key) => Ok(Some(key)),
            Err(KeyError::MissingDimension(dimension)) => {
                debug!(
                    limit = %definition.name,
                    %dimension,
                    "rate limit skipped, key dimension unavailable"
                );
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn lock_for(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.locks[(hasher.finish() as usize) % self.locks.len()]
    }

    async fn consume(
        &self,
        key: &str,
        definition: &LimitDefinition,
        deadline: Option<Instant>,
    ) -> RateLimitResult {
        let now = current_time_millis();

        let mut bucket = match self.bounded(deadline, self.storage.get(key)).await {
            Ok(Some(state)) => {
                let mut bucket = TokenBucket::from_state(state);
                bucket.reconfigure(definition.capacity(), definition.refill_rate());
                bucket
            }
            Ok(None) => TokenBucket::new(definition.capacity(), definition.refill_rate(), now),
            Err(err) => return self.degraded(definition, key, err, now),
        };

        let cost = f64::from(definition.cost);
        let allowed = bucket.try_consume(cost, now);

        // Persist on rejection too, so the refill timestamp advances.
        let saved = self
            .bounded(
                deadline,
                self.storage.set(key, &bucket.state(), definition.state_ttl()),
            )
            .await;
        if let Err(err) = saved {
            return self.degraded(definition, key, err, now);
        }

        let result = RateLimitResult {
            allowed,
            limit: capacity_of(definition),
            remaining: bucket.remaining(),
            reset_at: bucket.reset_at_ms(now).div_ceil(1000),
            retry_after: if allowed {
                None
            } else {
                // Validation guarantees cost <= capacity, so the bucket can always recover.
                Some(bucket.retry_after_secs(cost).unwrap_or(definition.window_secs).max(1))
            },
            degraded: false,
        };

        if allowed {
            debug!(key = %key, remaining = result.remaining, "rate limit check passed");
        } else {
            debug!(key = %key, retry_after = ?result.retry_after, "rate limit exceeded");
        }
        result
    }

    async fn bounded<T>(
        &self,
        deadline: Option<Instant>,
        operation: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        let limit = expires_after(Instant::now(), self.storage_timeout);
        let at = deadline.map_or(limit, |deadline| deadline.min(limit));
        tokio::time::timeout_at(at.into(), operation)
            .await
            .map_err(|_| StorageError::Timeout)?
    }

    fn degraded(
        &self,
        definition: &LimitDefinition,
        key: &str,
        err: StorageError,
        now_ms: u64,
    ) -> RateLimitResult {
        let limit = capacity_of(definition);
        match self.failure_mode {
            FailureMode::FailOpen => {
                warn!(
                    key = %key,
                    backend = self.storage.backend_name(),
                    error = %err,
                    "rate limit storage unavailable, allowing request (fail-open)"
                );
                RateLimitResult {
                    allowed: true,
                    limit,
                    remaining: limit,
                    reset_at: now_ms / 1000,
                    retry_after: None,
                    degraded: true,
                }
            }
            FailureMode::FailClosed => {
                let retry_after = self.fail_closed_retry_after.as_secs().max(1);
                warn!(
                    key = %key,
                    backend = self.storage.backend_name(),
                    error = %err,
                    "rate limit storage unavailable, rejecting request (fail-closed)"
                );
                RateLimitResult {
                    allowed: false,
                    limit,
                    remaining: 0,
                    reset_at: now_ms / 1000 + retry_after,
                    retry_after: Some(retry_after),
                    degraded: true,
                }
            }
        }
    }
}

fn capacity_of(definition: &LimitDefinition) -> u32 {
    definition.burst.unwrap_or(definition.limit)
}
