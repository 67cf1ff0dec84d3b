//! Authorization stage: verify the session token and attach the user to the context.
//!
//! The route's policy decides what is required; requests without a resolved route are
//! treated as needing an authenticated user.

use std::sync::Arc;

use async_trait::async_trait;
use axum::response::Response;

use crate::error::GatewayError;
use crate::events::{AuthOutcome, EventSink, GatewayEvent};
use crate::pipeline::{Next, RequestContext, Stage};
use crate::services::auth::{AuthError, AuthorizationPolicy, Authorizer};

pub struct AuthorizationMiddleware {
    authorizer: Arc<Authorizer>,
    events: Arc<dyn EventSink>,
}

impl AuthorizationMiddleware {
    pub fn new(authorizer: Arc<Authorizer>, events: Arc<dyn EventSink>) -> Self {
        Self { authorizer, events }
    }

    fn emit(&self, ctx: &RequestContext, outcome: AuthOutcome, reason: Option<&AuthError>) {
        self.events.emit(GatewayEvent::AuthAttempt {
            outcome,
            reason: reason.map(|err| err.code().to_string()),
            user_id: ctx.user.as_ref().map(|user| user.user_id().to_string()),
            path: ctx.path().to_string(),
            correlation_id: ctx.correlation_id.clone(),
        });
    }
}

#[async_trait]
impl Stage for AuthorizationMiddleware {
    fn name(&self) -> &'static str {
        "authorization"
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Response {
        let authenticated = AuthorizationPolicy::authenticated();
        let route = ctx.route.clone();
        let policy = route.as_deref().map_or(&authenticated, |route| &route.policy);

        match self
            .authorizer
            .authorize(&ctx.headers, policy, ctx.deadline)
            .await
        {
            Ok(None) => {
                self.emit(ctx, AuthOutcome::Bypass, None);
                next.run(ctx).await
            }
            Ok(Some(user)) => {
                ctx.user = Some(user);
                self.emit(ctx, AuthOutcome::Success, None);
                next.run(ctx).await
            }
            Err(err) => {
                tracing::warn!(
                    code = err.code(),
                    error = %err,
                    path = ctx.path(),
                    correlation_id = %ctx.correlation_id,
                    "authorization failed"
                );
                self.emit(ctx, AuthOutcome::Failure, Some(&err));
                GatewayError::Auth(err).into_response_for(ctx)
            }
        }
    }
}
