use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot};
use crate::events::EventSink;

/// Lazily creates one breaker per backend and hands out the same instance afterwards.
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("config", &self.config)
            .field("breakers", &self.len())
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Use `config` instead of the default for `backend`'s breaker.
    pub fn with_override(mut self, backend: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(backend.into(), config);
        self
    }

    pub fn get(&self, backend: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(breaker) = breakers.get(backend) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have created it between the two locks.
        let breaker = breakers.entry(backend.to_string()).or_insert_with(|| {
            let config = self
                .overrides
                .get(backend)
                .cloned()
                .unwrap_or_else(|| self.config.clone());
            tracing::debug!(backend, "creating circuit breaker");
            Arc::new(CircuitBreaker::new(backend, config, Arc::clone(&self.events)))
        });
        Arc::clone(breaker)
    }

    pub fn len(&self) -> usize {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every breaker created so far, sorted by backend name.
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.backend.cmp(&b.backend));
        snapshots
    }
}
