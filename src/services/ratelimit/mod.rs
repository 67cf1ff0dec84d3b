//! Distributed token bucket rate limiting.

pub mod bucket;
pub mod key;
pub mod limiter;
pub mod storage;
pub mod types;

pub use bucket::{TokenBucket, TokenBucketState};
pub use key::{Dimension, KeyError, KeyGenerator, KeyTemplate, RateLimitSubject};
pub use limiter::RateLimiter;
pub use storage::{RateLimitStorage, StorageError, build_storage};
pub use types::{LimitDefinition, LimitScope, RateLimitError, RateLimitResult, RateLimitVerdict};
