use futures::future::BoxFuture;
use serde_json::Value;

use stepwise_core::context::ExecutionContext;
use stepwise_core::error::{Result, StepError};
use stepwise_core::traits::Step;
use stepwise_core::types::{RunKind, StepModes};

use crate::runnable::Runnable;

/// Applies a step to every element of an array input.
pub struct Each {
    name: String,
    inner: Runnable,
}

impl Each {
    pub fn new(inner: Runnable) -> Self {
        Self {
            name: "Each".to_string(),
            inner,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn items(&self, input: Value) -> Result<Vec<Value>> {
        match input {
            Value::Array(items) => Ok(items),
            other => Err(StepError::validation(format!(
                "{} expects an array input, got {}",
                self.name, other
            ))),
        }
    }
}

impl Step for Each {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RunKind {
        RunKind::Custom
    }

    fn modes(&self) -> StepModes {
        StepModes::DUAL
    }

    fn invoke(&self, input: Value, ctx: &ExecutionContext) -> Result<Value> {
        let items = self.items(input)?;
        self.inner.call_many(items, ctx.child()).map(Value::Array)
    }

    fn ainvoke(&self, input: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let items = self.items(input)?;
            self.inner
                .async_call_many(items, ctx.child())
                .await
                .map(Value::Array)
        })
    }
}
