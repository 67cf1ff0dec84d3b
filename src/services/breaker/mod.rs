//! Circuit breaking for upstream backends.

#[allow(clippy::module_inception)]
mod breaker;
mod manager;

pub use breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
pub use manager::CircuitBreakerManager;
