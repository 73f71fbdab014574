//! Wrappers that fix part of a step's invocation settings.
//!
//! Neither wrapper opens a run of its own: the wrapped step's run is the one
//! recorded, with the bound settings applied.

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use stepwise_core::context::ExecutionContext;
use stepwise_core::error::Result;
use stepwise_core::traits::{ChunkIter, ChunkStream, Step};
use stepwise_core::types::{RunKind, StepModes};

use crate::runnable::Runnable;

/// A step with fixed invocation parameters, read through
/// [`ExecutionContext::param`]. Parameters passed at call time win.
pub struct Bound {
    inner: Runnable,
    params: Map<String, Value>,
}

impl Bound {
    pub fn new(inner: Runnable, params: Map<String, Value>) -> Self {
        Self { inner, params }
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    fn apply(&self, ctx: &ExecutionContext) -> ExecutionContext {
        let mut params = self.params.clone();
        params.extend(ctx.params().clone());
        ctx.clone().with_params(params)
    }
}

/// A step with a bound context merged under every call's context.
pub struct Configured {
    inner: Runnable,
    ctx: ExecutionContext,
}

impl Configured {
    pub fn new(inner: Runnable, ctx: ExecutionContext) -> Self {
        Self { inner, ctx }
    }

    fn apply(&self, ctx: &ExecutionContext) -> ExecutionContext {
        self.ctx.merge(ctx)
    }
}

macro_rules! forward_step {
    ($wrapper:ty) => {
        impl Step for $wrapper {
            fn name(&self) -> &str {
                self.inner.name()
            }

            fn kind(&self) -> RunKind {
                self.inner.kind()
            }

            fn modes(&self) -> StepModes {
                self.inner.modes()
            }

            fn traced(&self) -> bool {
                false
            }

            fn invoke(&self, input: Value, ctx: &ExecutionContext) -> Result<Value> {
                self.inner.call(input, &self.apply(ctx))
            }

            fn ainvoke(&self, input: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
                Box::pin(async move { self.inner.async_call(input, &self.apply(&ctx)).await })
            }

            fn stream(&self, input: Value, ctx: &ExecutionContext) -> ChunkIter {
                self.inner.stream(input, &self.apply(ctx))
            }

            fn astream(&self, input: Value, ctx: &ExecutionContext) -> ChunkStream {
                self.inner.async_stream(input, &self.apply(ctx))
            }

            fn transform(&self, input: ChunkIter, ctx: &ExecutionContext) -> ChunkIter {
                self.inner.transform(input, &self.apply(ctx))
            }

            fn atransform(&self, input: ChunkStream, ctx: &ExecutionContext) -> ChunkStream {
                self.inner.async_transform(input, &self.apply(ctx))
            }

            fn input_descriptor(&self) -> Option<Value> {
                self.inner.input_descriptor()
            }

            fn output_descriptor(&self) -> Option<Value> {
                self.inner.output_descriptor()
            }
        }
    };
}

forward_step!(Bound);
forward_step!(Configured);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lambda::{lambda, Lambda};
    use serde_json::json;
    use std::sync::Arc;
    use stepwise_trace::RunCollector;

    fn params_of() -> Runnable {
        Runnable::new(Lambda::contextual("params", |_, ctx| {
            Ok(Value::Object(ctx.params().clone()))
        }))
    }

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_later_bind_wins() {
        let step = params_of()
            .bind(map(json!({"stop": "a", "temperature": 0})))
            .bind(map(json!({"stop": "b"})));
        let out = step.call(json!(null), &ExecutionContext::default()).unwrap();
        assert_eq!(out, json!({"stop": "b", "temperature": 0}));
    }

    #[test]
    fn test_call_params_win_over_bound() {
        let step = params_of().bind(map(json!({"stop": "a"})));
        let ctx = ExecutionContext::default().with_param("stop", json!("call"));
        assert_eq!(step.call(json!(null), &ctx).unwrap(), json!({"stop": "call"}));
    }

    #[test]
    fn test_bound_params_not_inherited_by_children() {
        let chain = (params_of() | params_of()).bind(map(json!({"k": 1})));
        assert_eq!(chain.call(json!(null), &ExecutionContext::default()).unwrap(), json!({}));
    }

    #[test]
    fn test_bound_step_keeps_identity() {
        let step = lambda("double", |x| Ok(json!(x.as_i64().unwrap_or(0) * 2)));
        let bound = step.bind(Map::new());
        assert_eq!(bound.name(), "double");
        assert_eq!(bound.kind(), RunKind::Leaf);
        assert_eq!(bound.modes(), step.modes());
    }

    #[test]
    fn test_with_context_merges_tags_and_metadata() {
        let collector = Arc::new(RunCollector::new());
        let step = lambda("echo", Ok)
            .with_context(
                ExecutionContext::default()
                    .with_tag("x")
                    .with_metadata("who", json!("x"))
                    .with_metadata("keep", json!(true)),
            )
            .with_context(ExecutionContext::default().with_tag("y").with_metadata("who", json!("y")));
        let ctx = ExecutionContext::default()
            .with_tag("call")
            .with_listener(collector.clone());
        step.call(json!(1), &ctx).unwrap();

        let runs = collector.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].name, "echo");
        assert_eq!(runs[0].tags, vec!["x", "y", "call"]);
        assert_eq!(runs[0].metadata["who"], json!("y"));
        assert_eq!(runs[0].metadata["keep"], json!(true));
    }

    #[test]
    fn test_bound_listener_traces() {
        let collector = Arc::new(RunCollector::new());
        let step = lambda("echo", Ok)
            .with_context(ExecutionContext::default().with_listener(collector.clone()));
        step.call(json!("hi"), &ExecutionContext::default()).unwrap();
        assert_eq!(collector.runs()[0].output, Some(json!("hi")));
    }
}
