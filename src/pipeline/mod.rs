//! Ordered, short-circuiting request pipeline.
//!
//! Each stage gets the request context and a `Next` handle. It may call `next.run`
//! and post-process the response, answer on its own without calling `next`, or
//! attach data to the context for later stages. Order is fixed when the pipeline
//! is built.

mod context;

pub use context::RequestContext;

use std::sync::Arc;

use async_trait::async_trait;
use axum::response::Response;

use crate::error::GatewayError;

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Response;
}

/// The rest of the chain after the current stage.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &mut RequestContext) -> Response {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.handle(ctx, Next { stages: rest }).await,
            None => {
                // The last stage is expected to answer without calling `next`.
                tracing::error!(path = ctx.path(), "pipeline ran past its last stage");
                GatewayError::Internal("request was not handled".into()).into_response_for(ctx)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub async fn execute(&self, ctx: &mut RequestContext) -> Response {
        Next {
            stages: &self.stages,
        }
        .run(ctx)
        .await
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
}

impl PipelineBuilder {
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn shared_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
        }
    }
}
