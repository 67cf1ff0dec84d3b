//! Structured decision events.
//!
//! The core reports what it decided as data; formatting and sinking belong to whoever
//! implements `EventSink`. The default sink writes one `tracing` record per event.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::services::breaker::CircuitState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthOutcome {
    Success,
    Failure,
    Bypass,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    AuthAttempt {
        outcome: AuthOutcome,
        /// Error code on failure (`token_expired`, `forbidden`, ...).
        reason: Option<String>,
        user_id: Option<String>,
        path: String,
        correlation_id: String,
    },
    RateLimitCheck {
        limit_name: String,
        allowed: bool,
        remaining: u32,
        /// True when the decision came from the failure mode instead of bucket state.
        degraded: bool,
        latency: Duration,
    },
    CircuitTransition {
        backend: String,
        from: CircuitState,
        to: CircuitState,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: GatewayEvent);
}

/// Writes events as structured `tracing` records under the `edge_gateway::events` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::AuthAttempt {
                outcome,
                reason,
                user_id,
                path,
                correlation_id,
            } => match outcome {
                AuthOutcome::Failure => tracing::warn!(
                    target: "edge_gateway::events",
                    ?outcome,
                    reason = reason.as_deref().unwrap_or(""),
                    path = %path,
                    correlation_id = %correlation_id,
                    "authorization attempt"
                ),
                _ => tracing::info!(
                    target: "edge_gateway::events",
                    ?outcome,
                    user_id = user_id.as_deref().unwrap_or(""),
                    path = %path,
                    correlation_id = %correlation_id,
                    "authorization attempt"
                ),
            },
            GatewayEvent::RateLimitCheck {
                limit_name,
                allowed,
                remaining,
                degraded,
                latency,
            } => tracing::debug!(
                target: "edge_gateway::events",
                limit = %limit_name,
                allowed,
                remaining,
                degraded,
                latency_us = latency.as_micros() as u64,
                "rate limit check"
            ),
            GatewayEvent::CircuitTransition { backend, from, to } => match to {
                CircuitState::Open => tracing::warn!(
                    target: "edge_gateway::events",
                    backend = %backend,
                    from = %from,
                    to = %to,
                    "circuit opened"
                ),
                _ => tracing::info!(
                    target: "edge_gateway::events",
                    backend = %backend,
                    from = %from,
                    to = %to,
                    "circuit breaker transition"
                ),
            },
        }
    }
}

/// Keeps every emitted event in memory. Handy for tests and diagnostics endpoints.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<GatewayEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<GatewayEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: GatewayEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
