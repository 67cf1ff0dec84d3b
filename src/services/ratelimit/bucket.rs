//! Token bucket arithmetic.
//!
//! The bucket holds up to `capacity` tokens and refills continuously at `refill_rate`
//! tokens per second. Every operation takes the current time explicitly (unix ms), so
//! the same state can be persisted, reloaded on another instance, and resumed with
//! identical results.

use serde::{Deserialize, Serialize};

/// Persisted bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub capacity: f64,
    /// Tokens per second
    pub refill_rate: f64,
    pub tokens: f64,
    /// Unix ms of the last refill
    pub last_refill: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    state: TokenBucketState,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: f64, refill_rate: f64, now_ms: u64) -> Self {
        let capacity = sanitize(capacity);
        Self {
            state: TokenBucketState {
                capacity,
                refill_rate: sanitize(refill_rate),
                tokens: capacity,
                last_refill: now_ms,
            },
        }
    }

    /// Resume from persisted state. Out-of-range token counts are clamped into
    /// `[0, capacity]`.
    pub fn from_state(state: TokenBucketState) -> Self {
        let capacity = sanitize(state.capacity);
        Self {
            state: TokenBucketState {
                capacity,
                refill_rate: sanitize(state.refill_rate),
                tokens: sanitize(state.tokens).min(capacity),
                last_refill: state.last_refill,
            },
        }
    }

    /// Adopt new limits for an existing bucket (a definition changed between runs).
    pub fn reconfigure(&mut self, capacity: f64, refill_rate: f64) {
        self.state.capacity = sanitize(capacity);
        self.state.refill_rate = sanitize(refill_rate);
        self.state.tokens = self.state.tokens.min(self.state.capacity);
    }

    pub fn state(&self) -> TokenBucketState {
        self.state
    }

    pub fn tokens(&self) -> f64 {
        self.state.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.state.capacity
    }

    /// Add the tokens accrued since the last refill. A clock that went backwards adds
    /// nothing and leaves `last_refill` where it was.
    pub fn refill(&mut self, now_ms: u64) {
        let elapsed_ms = now_ms.saturating_sub(self.state.last_refill);
        if elapsed_ms == 0 {
            return;
        }
        let accrued = elapsed_ms as f64 / 1000.0 * self.state.refill_rate;
        self.state.tokens = (self.state.tokens + accrued).min(self.state.capacity);
        self.state.last_refill = now_ms;
    }

    /// Refill, then take `cost` tokens if available.
    pub fn try_consume(&mut self, cost: f64, now_ms: u64) -> bool {
        self.refill(now_ms);
        if self.state.tokens >= cost {
            self.state.tokens = (self.state.tokens - cost).max(0.0);
            true
        } else {
            false
        }
    }

    /// Whole tokens available.
    pub fn remaining(&self) -> u32 {
        self.state.tokens.floor().clamp(0.0, f64::from(u32::MAX)) as u32
    }

    /// When the bucket will be full again (unix ms).
    pub fn reset_at_ms(&self, now_ms: u64) -> u64 {
        let missing = self.state.capacity - self.state.tokens;
        if missing <= 0.0 || self.state.refill_rate <= 0.0 {
            return now_ms;
        }
        now_ms.saturating_add((missing / self.state.refill_rate * 1000.0).ceil() as u64)
    }

    /// Whole seconds until `cost` tokens are available; zero when they already are.
    /// `None` when the bucket can never satisfy `cost`.
    pub fn retry_after_secs(&self, cost: f64) -> Option<u64> {
        if self.state.tokens >= cost {
            return Some(0);
        }
        if self.state.refill_rate <= 0.0 || cost > self.state.capacity {
            return None;
        }
        let wait = (cost - self.state.tokens) / self.state.refill_rate;
        Some((wait.ceil() as u64).max(1))
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() { value.max(0.0) } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn test_burst_then_reject_then_refill() {
        // 5 per minute, no extra burst
        let mut bucket = TokenBucket::new(5.0, 5.0 / 60.0, T0);

        for i in 0..5 {
            assert!(bucket.try_consume(1.0, T0), "request {i} should pass");
        }
        assert_eq!(bucket.remaining(), 0);

        assert!(!bucket.try_consume(1.0, T0));
        let retry = bucket.retry_after_secs(1.0).unwrap();
        assert!((1..=12).contains(&retry), "retry_after was {retry}");

        // 13s later at least one token has accrued
        assert!(bucket.try_consume(1.0, T0 + 13_000));
    }

    #[test]
    fn test_capacity_five_refilling_one_per_second() {
        let mut bucket = TokenBucket::new(5.0, 1.0, T0);

        for _ in 0..5 {
            assert!(bucket.try_consume(1.0, T0));
        }
        assert!(!bucket.try_consume(1.0, T0));

        let later = T0 + 2_000;
        assert!(bucket.try_consume(1.0, later));
        assert!(bucket.try_consume(1.0, later));
        assert!(!bucket.try_consume(1.0, later));
    }

    #[test]
    fn test_refill_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new(10.0, 100.0, T0);
        bucket.try_consume(10.0, T0);
        bucket.refill(T0 + 3_600_000);
        assert_eq!(bucket.tokens(), 10.0);
    }

    #[test]
    fn test_clock_going_backwards_adds_nothing() {
        let mut bucket = TokenBucket::new(10.0, 1.0, T0);
        bucket.try_consume(5.0, T0);

        bucket.refill(T0 - 10_000);
        assert_eq!(bucket.tokens(), 5.0);
        assert_eq!(bucket.state().last_refill, T0);
    }

    #[test]
    fn test_from_state_clamps_tokens() {
        let bucket = TokenBucket::from_state(TokenBucketState {
            capacity: 5.0,
            refill_rate: 1.0,
            tokens: 50.0,
            last_refill: T0,
        });
        assert_eq!(bucket.tokens(), 5.0);

        let bucket = TokenBucket::from_state(TokenBucketState {
            capacity: 5.0,
            refill_rate: 1.0,
            tokens: f64::NAN,
            last_refill: T0,
        });
        assert_eq!(bucket.tokens(), 0.0);
    }

    #[test]
    fn test_reconfigure_shrinks_tokens() {
        let mut bucket = TokenBucket::new(100.0, 1.0, T0);
        bucket.reconfigure(10.0, 2.0);
        assert_eq!(bucket.tokens(), 10.0);
        assert_eq!(bucket.state().refill_rate, 2.0);
    }

    #[test]
    fn test_reset_at_points_to_full_bucket() {
        let mut bucket = TokenBucket::new(10.0, 2.0, T0);
        assert_eq!(bucket.reset_at_ms(T0), T0);

        bucket.try_consume(4.0, T0);
        assert_eq!(bucket.reset_at_ms(T0), T0 + 2_000);
    }

    #[test]
    fn test_cost_above_capacity_never_satisfiable() {
        let bucket = TokenBucket::new(3.0, 1.0, T0);
        assert_eq!(bucket.retry_after_secs(4.0), None);
    }

    #[test]
    fn test_state_survives_json() {
        let mut bucket = TokenBucket::new(5.0, 0.5, T0);
        bucket.try_consume(2.0, T0 + 10);

        let json = serde_json::to_string(&bucket.state()).unwrap();
        let restored: TokenBucketState = serde_json::from_str(&json).unwrap();
        assert_eq!(TokenBucket::from_state(restored), bucket);
    }

    proptest! {
        #[test]
        fn prop_tokens_stay_within_bounds(
            capacity in 1u32..500,
            rate in 0.01f64..200.0,
            ops in prop::collection::vec((0u64..120_000, 1u32..10), 1..80),
        ) {
            let capacity = f64::from(capacity);
            let mut now = T0;
            let mut bucket = TokenBucket::new(capacity, rate, now);

            for (advance, cost) in ops {
                now += advance;
                bucket.try_consume(f64::from(cost), now);
                prop_assert!(bucket.tokens() >= 0.0);
                prop_assert!(bucket.tokens() <= capacity);
            }
        }

        #[test]
        fn prop_persisting_midway_does_not_change_decisions(
            rate in 0.01f64..50.0,
            ops in prop::collection::vec((0u64..10_000, 1u32..4), 2..60),
            split in 0usize..60,
        ) {
            let mut now = T0;
            let mut straight = TokenBucket::new(10.0, rate, now);
            let mut resumed = TokenBucket::new(10.0, rate, now);
            let split = split % ops.len();

            for (i, (advance, cost)) in ops.into_iter().enumerate() {
                now += advance;
                if i == split {
                    let json = serde_json::to_string(&resumed.state()).unwrap();
                    resumed = TokenBucket::from_state(serde_json::from_str(&json).unwrap());
                }
                let cost = f64::from(cost);
                prop_assert_eq!(straight.try_consume(cost, now), resumed.try_consume(cost, now));
            }
        }
    }
}
