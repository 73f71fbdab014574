use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;

use stepwise_core::context::ExecutionContext;
use stepwise_core::error::{Result, StepError};
use stepwise_core::traits::{ChunkIter, ChunkStream, Step};
use stepwise_core::types::{RunKind, StepModes};

use crate::runnable::Runnable;

/// JSON truthiness: `null`, `false`, `0`, `""`, `[]` and `{}` are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Ordered (condition, body) arms plus a default body.
///
/// Conditions are evaluated in order, each at most once; the first truthy
/// one selects its body. Bodies that are not selected never run.
pub struct Branch {
    name: String,
    arms: Vec<(Runnable, Runnable)>,
    default: Runnable,
}

impl Branch {
    pub fn new(arms: Vec<(Runnable, Runnable)>, default: Runnable) -> Result<Self> {
        if arms.is_empty() {
            return Err(StepError::Construction(
                "a branch needs at least one condition besides the default".into(),
            ));
        }
        Ok(Self {
            name: "Branch".to_string(),
            arms,
            default,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn arms(&self) -> Arms {
        Arms {
            name: self.name.clone(),
            arms: self.arms.clone(),
            default: self.default.clone(),
        }
    }
}

// Owned copy of a branch's arms, usable inside a 'static stream.
struct Arms {
    name: String,
    arms: Vec<(Runnable, Runnable)>,
    default: Runnable,
}

impl Arms {
    fn select(&self, input: &Value, ctx: &ExecutionContext) -> Result<(Runnable, String)> {
        for (i, (condition, body)) in self.arms.iter().enumerate() {
            let hit = condition.call(input.clone(), &ctx.child_tagged(format!("condition:{}", i + 1)))?;
            if truthy(&hit) {
                debug!(branch = %self.name, arm = i + 1, "Branch selected");
                return Ok((body.clone(), format!("branch:{}", i + 1)));
            }
        }
        debug!(branch = %self.name, "Branch fell through to default");
        Ok((self.default.clone(), "branch:default".to_string()))
    }

    async fn select_async(&self, input: &Value, ctx: &ExecutionContext) -> Result<(Runnable, String)> {
        for (i, (condition, body)) in self.arms.iter().enumerate() {
            let hit = condition
                .async_call(input.clone(), &ctx.child_tagged(format!("condition:{}", i + 1)))
                .await?;
            if truthy(&hit) {
                debug!(branch = %self.name, arm = i + 1, "Branch selected");
                return Ok((body.clone(), format!("branch:{}", i + 1)));
            }
        }
        debug!(branch = %self.name, "Branch fell through to default");
        Ok((self.default.clone(), "branch:default".to_string()))
    }
}

impl Step for Branch {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RunKind {
        RunKind::Branch
    }

    fn modes(&self) -> StepModes {
        StepModes::DUAL.with_stream()
    }

    fn invoke(&self, input: Value, ctx: &ExecutionContext) -> Result<Value> {
        let (body, tag) = self.arms().select(&input, ctx)?;
        body.call(input, &ctx.child_tagged(tag))
    }

    fn ainvoke(&self, input: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let (body, tag) = self.arms().select_async(&input, &ctx).await?;
            body.async_call(input, &ctx.child_tagged(tag)).await
        })
    }

    fn stream(&self, input: Value, ctx: &ExecutionContext) -> ChunkIter {
        let arms = self.arms();
        let ctx = ctx.clone();
        Box::new(
            std::iter::once_with(move || match arms.select(&input, &ctx) {
                Ok((body, tag)) => body.stream(input, &ctx.child_tagged(tag)),
                Err(e) => Box::new(std::iter::once(Err(e))) as ChunkIter,
            })
            .flatten(),
        )
    }

    fn astream(&self, input: Value, ctx: &ExecutionContext) -> ChunkStream {
        let arms = self.arms();
        let ctx = ctx.clone();
        Box::pin(
            futures::stream::once(async move {
                match arms.select_async(&input, &ctx).await {
                    Ok((body, tag)) => body.async_stream(input, &ctx.child_tagged(tag)),
                    Err(e) => Box::pin(futures::stream::once(async move { Err(e) })) as ChunkStream,
                }
            })
            .flatten(),
        )
    }
}
