/*
 * Responsibility
 * - Config loading -> collaborator construction -> pipeline and Router assembly
 * - HTTP layers, health endpoints
 * - axum::serve() with graceful shutdown, then background work teardown
 */
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::{panic, process};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router, routing::get};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::events::{EventSink, TracingEventSink};
use crate::middleware::http::{self as http_layers, HttpLayerConfig};
use crate::middleware::{AuthorizationMiddleware, BackendMiddleware, RateLimitMiddleware, gateway};
use crate::pipeline::Pipeline;
use crate::services::auth::{Authorizer, PolicyEvaluator, RevocationService};
use crate::services::auth::revocation::build_revocation_service;
use crate::services::breaker::CircuitBreakerManager;
use crate::services::cache::SweeperHandle;
use crate::services::ratelimit::{RateLimitStorage, RateLimiter, build_storage};
use crate::services::routing::{RouteResolver, StaticRouteTable};
use crate::services::upstream::{HttpUpstream, Upstream};
use crate::state::AppState;

const READINESS_TIMEOUT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    // Prefer RUST_LOG if set; otherwise use a sensible default.
    // Ex:
    // RUST_LOG=info,edge_gateway=trace,tower_http=debug cargo run
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("info,edge_gateway=debug,tower_http=info")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn init_panic_hook(abort_on_panic: bool) {
    // Keep the default hook as a fallback (prints to stderr with location/payload).
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        // Always surface panics via tracing so they don't get lost.
        tracing::error!(?info, "panic");

        // In development, fail fast.
        if abort_on_panic {
            process::abort();
        } else {
            default_hook(info);
        }
    }))
}

/// Things the gateway talks to that are not derived from configuration alone.
pub struct Collaborators {
    pub routes: Arc<dyn RouteResolver>,
    pub upstream: Arc<dyn Upstream>,
    pub events: Arc<dyn EventSink>,
    /// Custom policies are registered here before startup.
    pub policies: PolicyEvaluator,
    /// Overrides the service built from `auth.revocation.backend`.
    pub revocation: Option<Arc<dyn RevocationService>>,
}

/// Background work owned by a running gateway.
pub struct Background {
    sweepers: Vec<SweeperHandle>,
    storage: Arc<dyn RateLimitStorage>,
}

impl Background {
    /// Cancel and await every sweep, then close rate limit storage.
    pub async fn shutdown(self) {
        for sweeper in self.sweepers {
            sweeper.shutdown().await;
        }
        if let Err(err) = self.storage.close().await {
            tracing::warn!(error = %err, "closing rate limit storage failed");
        }
        tracing::info!("background work stopped");
    }
}

pub async fn run() -> Result<()> {
    init_tracing();
    let config = Config::from_env()?;

    init_panic_hook(!config.app_env.is_production());

    tracing::info!(
        "starting gateway in {:?} mode on {}",
        config.app_env,
        config.addr
    );

    let routes = StaticRouteTable::from_file(&config.routes_file)
        .with_context(|| format!("loading routes from {}", config.routes_file))?;
    tracing::info!(routes = routes.len(), "route table loaded");

    let collaborators = Collaborators {
        routes: Arc::new(routes),
        upstream: Arc::new(HttpUpstream::new()?),
        events: Arc::new(TracingEventSink),
        policies: PolicyEvaluator::new(config.auth.decision_cache_ttl),
        revocation: None,
    };

    let (state, background) = build_state(&config, collaborators).await?;
    let app = build_router(state, &config);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("server drained, stopping background work");
    background.shutdown().await;
    Ok(())
}

/// Wire storage, authorization, limiter, breakers and the pipeline.
pub async fn build_state(
    config: &Config,
    collaborators: Collaborators,
) -> Result<(AppState, Background)> {
    let Collaborators {
        routes,
        upstream,
        events,
        policies,
        revocation,
    } = collaborators;

    let storage = build_storage(&config.rate_limit)
        .await
        .context("building rate limit storage")?;

    let revocation = match revocation {
        Some(service) => service,
        None => build_revocation_service(&config.auth.revocation.backend)
            .await
            .context("building revocation service")?,
    };

    let authorizer = Arc::new(
        Authorizer::from_config(&config.auth, revocation, policies)
            .context("configuring token verification")?,
    );
    let sweepers = authorizer.start_sweepers(config.auth.cache_sweep_interval);

    let limiter = Arc::new(RateLimiter::new(
        storage.clone(),
        &config.rate_limit,
        events.clone(),
    ));
    let breakers = Arc::new(CircuitBreakerManager::new(
        config.breaker.clone(),
        events.clone(),
    ));

    // authorization -> rate limiting -> backend
    let mut pipeline = Pipeline::builder().stage(AuthorizationMiddleware::new(authorizer, events));
    if config.rate_limit.enabled {
        pipeline = pipeline.stage(RateLimitMiddleware::new(
            limiter.clone(),
            config.rate_limit.global_limits.clone(),
        ));
    } else {
        tracing::warn!("rate limiting is disabled");
    }
    let pipeline = pipeline
        .stage(BackendMiddleware::new(
            breakers.clone(),
            upstream,
            config.upstream.timeout,
        ))
        .build();
    tracing::debug!(stages = ?pipeline.stage_names(), "pipeline built");

    let state = AppState {
        pipeline: Arc::new(pipeline),
        routes,
        limiter,
        breakers,
        request_timeout: config.request_timeout,
        body_limit_bytes: config.body_limit_bytes,
        trust_forwarded_for: config.trust_forwarded_for,
    };
    Ok((state, Background { sweepers, storage }))
}

pub fn build_router(state: AppState, config: &Config) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .fallback(gateway::proxy)
        .with_state(state);

    http_layers::apply(
        router,
        HttpLayerConfig {
            body_limit_bytes: config.body_limit_bytes,
            timeout: config.request_timeout,
        },
    )
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let storage = state.limiter.storage();
    let storage_ok = match tokio::time::timeout(READINESS_TIMEOUT, storage.ping()).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "rate limit storage ping failed");
            false
        }
        Err(_) => {
            tracing::warn!("rate limit storage ping timed out");
            false
        }
    };

    let status = if storage_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if storage_ok { "ready" } else { "degraded" },
        "storage": {
            "backend": storage.backend_name(),
            "reachable": storage_ok,
        },
        "breakers": state.breakers.snapshots(),
    });
    (status, Json(body))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
