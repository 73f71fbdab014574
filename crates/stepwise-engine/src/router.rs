use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use stepwise_core::context::ExecutionContext;
use stepwise_core::error::{Result, StepError};
use stepwise_core::traits::{ChunkIter, ChunkStream, Step};
use stepwise_core::types::{RunKind, StepModes};

use crate::runnable::Runnable;

/// Dispatches `{"key": K, "input": X}` to the step registered under `K`.
pub struct Router {
    name: String,
    routes: BTreeMap<String, Runnable>,
}

impl Router {
    pub fn new<I, K>(routes: I) -> Self
    where
        I: IntoIterator<Item = (K, Runnable)>,
        K: Into<String>,
    {
        Self {
            name: "Router".to_string(),
            routes: routes.into_iter().map(|(k, r)| (k.into(), r)).collect(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    fn route(&self, input: Value) -> Result<(Runnable, Value)> {
        let Value::Object(mut fields) = input else {
            return Err(StepError::validation(
                "router input must be an object with 'key' and 'input'",
            ));
        };
        let key = match fields.remove("key") {
            Some(Value::String(key)) => key,
            Some(other) => {
                return Err(StepError::validation(format!(
                    "router key must be a string, got {}",
                    other
                )))
            }
            None => return Err(StepError::validation("router input is missing 'key'")),
        };
        let Some(step) = self.routes.get(&key) else {
            return Err(StepError::validation(format!("no route registered for '{}'", key)));
        };
        debug!(router = %self.name, route = %key, "Routing input");
        Ok((step.clone(), fields.remove("input").unwrap_or(Value::Null)))
    }
}

impl Step for Router {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RunKind {
        RunKind::Custom
    }

    fn modes(&self) -> StepModes {
        StepModes::DUAL.with_stream()
    }

    fn invoke(&self, input: Value, ctx: &ExecutionContext) -> Result<Value> {
        let (step, input) = self.route(input)?;
        step.call(input, &ctx.child())
    }

    fn ainvoke(&self, input: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let (step, input) = self.route(input)?;
            step.async_call(input, &ctx.child()).await
        })
    }

    fn stream(&self, input: Value, ctx: &ExecutionContext) -> ChunkIter {
        match self.route(input) {
            Ok((step, input)) => step.stream(input, &ctx.child()),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    fn astream(&self, input: Value, ctx: &ExecutionContext) -> ChunkStream {
        match self.route(input) {
            Ok((step, input)) => step.async_stream(input, &ctx.child()),
            Err(e) => Box::pin(futures::stream::once(async move { Err(e) })),
        }
    }
}
