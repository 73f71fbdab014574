use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{Result, StepError};
use crate::types::{NewRun, Run, RunId, RunKind, StepModes};

/// A blocking sequence of output chunks.
pub type ChunkIter = Box<dyn Iterator<Item = Result<Value>> + Send>;

/// A non-blocking sequence of output chunks.
pub type ChunkStream = BoxStream<'static, Result<Value>>;

/// A unit of work: consumes one input value and produces an output value,
/// possibly as a sequence of chunks.
///
/// Implementors override the methods for the modes they declare in
/// [`Step::modes`]. The engine derives every other mode from those, so a
/// step only ever sees calls for modes it implements natively.
pub trait Step: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn kind(&self) -> RunKind {
        RunKind::Leaf
    }

    fn modes(&self) -> StepModes;

    /// Whether invocations of this step open a run of their own.
    ///
    /// Wrappers that only adjust the context return `false`; the wrapped
    /// step's run takes their place in the trace tree.
    fn traced(&self) -> bool {
        true
    }

    fn invoke(&self, _input: Value, _ctx: &ExecutionContext) -> Result<Value> {
        Err(unsupported(self.name(), "call"))
    }

    fn stream(&self, _input: Value, _ctx: &ExecutionContext) -> ChunkIter {
        let err = unsupported(self.name(), "stream");
        Box::new(std::iter::once(Err(err)))
    }

    fn transform(&self, _input: ChunkIter, _ctx: &ExecutionContext) -> ChunkIter {
        let err = unsupported(self.name(), "transform");
        Box::new(std::iter::once(Err(err)))
    }

    fn ainvoke(&self, _input: Value, _ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        let err = unsupported(self.name(), "async call");
        Box::pin(async move { Err(err) })
    }

    fn astream(&self, _input: Value, _ctx: &ExecutionContext) -> ChunkStream {
        let err = unsupported(self.name(), "async stream");
        Box::pin(futures::stream::once(async move { Err(err) }))
    }

    fn atransform(&self, _input: ChunkStream, _ctx: &ExecutionContext) -> ChunkStream {
        let err = unsupported(self.name(), "async transform");
        Box::pin(futures::stream::once(async move { Err(err) }))
    }

    /// JSON description of the accepted input, if the step declares one.
    fn input_descriptor(&self) -> Option<Value> {
        None
    }

    fn output_descriptor(&self) -> Option<Value> {
        None
    }
}

pub fn unsupported(step: &str, mode: &str) -> StepError {
    StepError::Unsupported {
        step: step.to_string(),
        mode: mode.to_string(),
    }
}

/// Observer of run lifecycle events.
///
/// `on_run_end` receives the run with its complete subtree of children.
pub trait TraceListener: Send + Sync {
    fn on_run_start(&self, run: &Run);

    fn on_run_end(&self, run: &Run);

    fn on_run_chunk(&self, _run_id: &RunId, _chunk: &Value) {}
}

/// Records the run tree for one top-level invocation.
pub trait RunTracer: Send + Sync + 'static {
    fn open(&self, parent: Option<&RunId>, run: NewRun) -> RunId;

    fn chunk(&self, run_id: &RunId, chunk: &Value);

    fn close(&self, run_id: &RunId, outcome: &Result<Value>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct Bare;

    impl Step for Bare {
        fn name(&self) -> &str {
            "bare"
        }

        fn modes(&self) -> StepModes {
            StepModes::default()
        }
    }

    #[test]
    fn test_default_modes_are_unsupported() {
        let ctx = ExecutionContext::default();
        let err = Bare.invoke(Value::Null, &ctx).unwrap_err();
        assert_eq!(
            err,
            StepError::Unsupported {
                step: "bare".into(),
                mode: "call".into()
            }
        );
        let first = Bare.stream(Value::Null, &ctx).next().unwrap();
        assert!(first.is_err());
        assert_eq!(Bare.kind(), RunKind::Leaf);
        assert!(Bare.traced());
    }

    #[tokio::test]
    async fn test_default_async_modes_are_unsupported() {
        let ctx = ExecutionContext::default();
        assert!(Bare.ainvoke(Value::Null, ctx.clone()).await.is_err());
        let items: Vec<_> = Bare.astream(Value::Null, &ctx).collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }
}
