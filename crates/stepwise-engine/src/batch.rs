use futures::{StreamExt, TryStreamExt};
use rayon::prelude::*;
use serde_json::Value;
use tracing::debug;

use stepwise_core::context::ExecutionContext;
use stepwise_core::error::{Result, StepError};

use crate::runnable::Runnable;
use crate::worker;

/// Contexts for a batch: one shared by every item, or one per item.
#[derive(Debug, Clone)]
pub enum BatchContext {
    Shared(ExecutionContext),
    PerItem(Vec<ExecutionContext>),
}

impl BatchContext {
    /// One context per input; a per-item list must match the input count.
    pub fn resolve(self, n: usize) -> Result<Vec<ExecutionContext>> {
        match self {
            Self::Shared(ctx) => Ok(vec![ctx; n]),
            Self::PerItem(ctxs) if ctxs.len() == n => Ok(ctxs),
            Self::PerItem(ctxs) => Err(StepError::validation(format!(
                "batch of {} inputs given {} contexts",
                n,
                ctxs.len()
            ))),
        }
    }

    /// Concurrency bound for the batch itself.
    pub fn concurrency_limit(&self) -> Option<usize> {
        match self {
            Self::Shared(ctx) => ctx.concurrency_limit(),
            Self::PerItem(ctxs) => ctxs.first().and_then(|c| c.concurrency_limit()),
        }
    }
}

impl From<ExecutionContext> for BatchContext {
    fn from(ctx: ExecutionContext) -> Self {
        Self::Shared(ctx)
    }
}

impl From<&ExecutionContext> for BatchContext {
    fn from(ctx: &ExecutionContext) -> Self {
        Self::Shared(ctx.clone())
    }
}

impl From<Vec<ExecutionContext>> for BatchContext {
    fn from(ctxs: Vec<ExecutionContext>) -> Self {
        Self::PerItem(ctxs)
    }
}

fn prepare(inputs: &[Value], ctx: BatchContext) -> Result<(Option<usize>, Vec<ExecutionContext>)> {
    let limit = ctx.concurrency_limit();
    let ctxs = ctx.resolve(inputs.len())?;
    debug!(items = inputs.len(), limit = ?limit, "Starting batch");
    Ok((limit, ctxs))
}

impl Runnable {
    /// Call once per input, in parallel up to the concurrency limit.
    /// Outputs keep input order; the first failure aborts the batch.
    pub fn call_many(&self, inputs: Vec<Value>, ctx: impl Into<BatchContext>) -> Result<Vec<Value>> {
        let (limit, ctxs) = prepare(&inputs, ctx.into())?;
        worker::with_pool(limit, || {
            inputs
                .into_par_iter()
                .zip(ctxs.into_par_iter())
                .map(|(input, ctx)| self.call(input, &ctx))
                .collect::<Result<Vec<Value>>>()
        })?
    }

    /// Like [`call_many`](Self::call_many), but every item runs to
    /// completion and reports its own outcome.
    pub fn call_many_settled(
        &self,
        inputs: Vec<Value>,
        ctx: impl Into<BatchContext>,
    ) -> Result<Vec<Result<Value>>> {
        let (limit, ctxs) = prepare(&inputs, ctx.into())?;
        worker::with_pool(limit, || {
            inputs
                .into_par_iter()
                .zip(ctxs.into_par_iter())
                .map(|(input, ctx)| self.call(input, &ctx))
                .collect::<Vec<Result<Value>>>()
        })
    }

    pub async fn async_call_many(
        &self,
        inputs: Vec<Value>,
        ctx: impl Into<BatchContext>,
    ) -> Result<Vec<Value>> {
        let (limit, ctxs) = prepare(&inputs, ctx.into())?;
        let width = limit.unwrap_or(inputs.len()).max(1);
        futures::stream::iter(inputs.into_iter().zip(ctxs))
            .map(|(input, ctx)| async move { self.async_call(input, &ctx).await })
            .buffered(width)
            .try_collect()
            .await
    }

    pub async fn async_call_many_settled(
        &self,
        inputs: Vec<Value>,
        ctx: impl Into<BatchContext>,
    ) -> Result<Vec<Result<Value>>> {
        let (limit, ctxs) = prepare(&inputs, ctx.into())?;
        let width = limit.unwrap_or(inputs.len()).max(1);
        Ok(futures::stream::iter(inputs.into_iter().zip(ctxs))
            .map(|(input, ctx)| async move { self.async_call(input, &ctx).await })
            .buffered(width)
            .collect()
            .await)
    }
}
