use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use tracing::warn;

use stepwise_core::chunk::append_lenient;
use stepwise_core::context::ExecutionContext;
use stepwise_core::error::{ErrorMatcher, Result, StepError};
use stepwise_core::traits::{ChunkIter, ChunkStream, RunTracer, Step};
use stepwise_core::types::{NewRun, RunKind, StepModes};
use stepwise_trace::{RunGuard, TraceSession};

use crate::binding::{Bound, Configured};
use crate::each::Each;
use crate::fallback::Fallback;
use crate::modes;
use crate::retry::{Retry, RetryPolicy};
use crate::sequence::Sequence;

/// Shared handle to a step.
///
/// Every invocation goes through a `Runnable`: it checks the recursion
/// budget, opens the step's run when tracing is active, and derives any
/// mode the step does not implement natively.
#[derive(Clone)]
pub struct Runnable {
    step: Arc<dyn Step>,
    // Set when the step is a sequence, so piping flattens.
    parts: Option<Arc<[Runnable]>>,
}

struct Entered {
    guard: Option<RunGuard>,
    ctx: ExecutionContext,
}

impl Runnable {
    pub fn new(step: impl Step) -> Self {
        Self {
            step: Arc::new(step),
            parts: None,
        }
    }

    pub fn from_arc(step: Arc<dyn Step>) -> Self {
        Self { step, parts: None }
    }

    pub(crate) fn from_sequence(sequence: Sequence) -> Self {
        let parts: Arc<[Runnable]> = sequence.steps().to_vec().into();
        Self {
            step: Arc::new(sequence),
            parts: Some(parts),
        }
    }

    /// Chain steps left to right. Nested sequences are flattened.
    pub fn sequence(steps: Vec<Runnable>) -> Result<Runnable> {
        Sequence::new(steps).map(Runnable::from_sequence)
    }

    pub fn name(&self) -> &str {
        self.step.name()
    }

    pub fn kind(&self) -> RunKind {
        self.step.kind()
    }

    pub fn modes(&self) -> StepModes {
        self.step.modes()
    }

    pub fn step(&self) -> &Arc<dyn Step> {
        &self.step
    }

    /// The flattened steps when this is a sequence.
    pub fn parts(&self) -> Option<&[Runnable]> {
        self.parts.as_deref()
    }

    pub fn input_descriptor(&self) -> Option<Value> {
        self.step.input_descriptor()
    }

    pub fn output_descriptor(&self) -> Option<Value> {
        self.step.output_descriptor()
    }

    pub fn has_input_descriptor(&self) -> bool {
        self.step.input_descriptor().is_some()
    }

    pub fn has_output_descriptor(&self) -> bool {
        self.step.output_descriptor().is_some()
    }

    // --- composition ---

    /// `self` followed by `next`.
    pub fn pipe(&self, next: impl Into<Runnable>) -> Runnable {
        Runnable::from_sequence(Sequence::joined(vec![self.clone(), next.into()]))
    }

    pub fn with_retry(&self, policy: RetryPolicy) -> Runnable {
        Runnable::new(Retry::new(self.clone(), policy))
    }

    /// Try `alternates` in order when this step fails with any step error.
    pub fn with_fallbacks(&self, alternates: Vec<Runnable>) -> Runnable {
        self.with_fallbacks_on(alternates, ErrorMatcher::AnyStep)
    }

    pub fn with_fallbacks_on(&self, alternates: Vec<Runnable>, matcher: ErrorMatcher) -> Runnable {
        Runnable::new(Fallback::new(self.clone(), alternates, matcher))
    }

    /// Fix invocation parameters; later bindings win on conflicting keys.
    pub fn bind(&self, params: Map<String, Value>) -> Runnable {
        Runnable::new(Bound::new(self.clone(), params))
    }

    /// Apply `ctx` under every call; call-time settings win.
    pub fn with_context(&self, ctx: ExecutionContext) -> Runnable {
        Runnable::new(Configured::new(self.clone(), ctx))
    }

    /// Map this step over an array input.
    pub fn each(&self) -> Runnable {
        Runnable::new(Each::new(self.clone()))
    }

    // --- invocation boundary ---

    fn enter(&self, input: &Value, ctx: &ExecutionContext) -> Result<Entered> {
        if ctx.recursion_budget() == 0 {
            warn!(step = %self.name(), "Recursion budget exhausted");
            return Err(StepError::RecursionExceeded {
                step: self.name().to_string(),
            });
        }

        let tracer: Arc<dyn RunTracer> = match ctx.tracer() {
            Some(tracer) => tracer.clone(),
            None if !ctx.listeners().is_empty() => {
                Arc::new(TraceSession::new(ctx.listeners().to_vec()))
            }
            None => {
                return Ok(Entered {
                    guard: None,
                    ctx: ctx.enter(),
                })
            }
        };

        let guard = RunGuard::open(
            tracer.clone(),
            ctx.parent_run(),
            NewRun {
                name: self.name().to_string(),
                kind: self.kind(),
                input: input.clone(),
                tags: ctx.run_tags(),
                metadata: ctx.metadata().clone(),
            },
        );
        let ctx = ctx.enter_run(guard.id(), tracer);
        Ok(Entered {
            guard: Some(guard),
            ctx,
        })
    }

    pub fn call(&self, input: Value, ctx: &ExecutionContext) -> Result<Value> {
        if !self.step.traced() {
            return self.step.invoke(input, ctx);
        }
        let entered = self.enter(&input, ctx)?;
        let output = modes::call(&self.step, input, &entered.ctx);
        if let Some(guard) = entered.guard {
            guard.finish(&output);
        }
        output
    }

    pub async fn async_call(&self, input: Value, ctx: &ExecutionContext) -> Result<Value> {
        if !self.step.traced() {
            return self.step.ainvoke(input, ctx.clone()).await;
        }
        let entered = self.enter(&input, ctx)?;
        let output = modes::async_call(self.step.clone(), input, entered.ctx).await;
        if let Some(guard) = entered.guard {
            guard.finish(&output);
        }
        output
    }

    pub fn stream(&self, input: Value, ctx: &ExecutionContext) -> ChunkIter {
        if !self.step.traced() {
            return self.step.stream(input, ctx);
        }
        match self.enter(&input, ctx) {
            Ok(entered) => {
                let chunks = modes::stream(self.step.clone(), input, &entered.ctx);
                traced_iter(chunks, entered.guard)
            }
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    pub fn async_stream(&self, input: Value, ctx: &ExecutionContext) -> ChunkStream {
        if !self.step.traced() {
            return self.step.astream(input, ctx);
        }
        match self.enter(&input, ctx) {
            Ok(entered) => {
                let chunks = modes::async_stream(self.step.clone(), input, &entered.ctx);
                traced_stream(chunks, entered.guard)
            }
            Err(e) => Box::pin(futures::stream::once(async move { Err(e) })),
        }
    }

    /// Consume a partial input stream chunk by chunk.
    ///
    /// The run's recorded input is `null`; the input arrives incrementally.
    pub fn transform(&self, input: ChunkIter, ctx: &ExecutionContext) -> ChunkIter {
        if !self.step.traced() {
            return self.step.transform(input, ctx);
        }
        match self.enter(&Value::Null, ctx) {
            Ok(entered) => {
                let chunks = modes::transform(self.step.clone(), input, &entered.ctx);
                traced_iter(chunks, entered.guard)
            }
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    pub fn async_transform(&self, input: ChunkStream, ctx: &ExecutionContext) -> ChunkStream {
        if !self.step.traced() {
            return self.step.atransform(input, ctx);
        }
        match self.enter(&Value::Null, ctx) {
            Ok(entered) => {
                let chunks = modes::async_transform(self.step.clone(), input, &entered.ctx);
                traced_stream(chunks, entered.guard)
            }
            Err(e) => Box::pin(futures::stream::once(async move { Err(e) })),
        }
    }
}

impl std::fmt::Debug for Runnable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runnable")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("parts", &self.parts.as_ref().map(|p| p.len()))
            .finish()
    }
}

impl<S: Step> From<S> for Runnable {
    fn from(step: S) -> Self {
        Runnable::new(step)
    }
}

impl std::ops::BitOr for Runnable {
    type Output = Runnable;

    fn bitor(self, next: Runnable) -> Runnable {
        self.pipe(next)
    }
}

fn traced_iter(inner: ChunkIter, guard: Option<RunGuard>) -> ChunkIter {
    match guard {
        Some(guard) => Box::new(TracedIter {
            inner: Some(inner),
            guard: Some(guard),
            acc: Value::Null,
        }),
        None => inner,
    }
}

fn traced_stream(inner: ChunkStream, guard: Option<RunGuard>) -> ChunkStream {
    match guard {
        Some(guard) => Box::pin(TracedStream {
            inner: Some(inner),
            guard: Some(guard),
            acc: Value::Null,
        }),
        None => inner,
    }
}

/// Reports chunks to the run and closes it when the stream ends or fails.
struct TracedIter {
    inner: Option<ChunkIter>,
    guard: Option<RunGuard>,
    acc: Value,
}

impl Iterator for TracedIter {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.as_mut()?.next();
        on_item(&mut self.inner, &mut self.guard, &mut self.acc, item)
    }
}

impl Drop for TracedIter {
    fn drop(&mut self) {
        // Close nested runs before this one.
        self.inner.take();
    }
}

struct TracedStream {
    inner: Option<ChunkStream>,
    guard: Option<RunGuard>,
    acc: Value,
}

impl Stream for TracedStream {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(item) => {
                Poll::Ready(on_item(&mut this.inner, &mut this.guard, &mut this.acc, item))
            }
        }
    }
}

impl Drop for TracedStream {
    fn drop(&mut self) {
        self.inner.take();
    }
}

fn on_item<T>(
    inner: &mut Option<T>,
    guard: &mut Option<RunGuard>,
    acc: &mut Value,
    item: Option<Result<Value>>,
) -> Option<Result<Value>> {
    match item {
        Some(Ok(chunk)) => {
            if let Some(guard) = guard.as_ref() {
                guard.chunk(&chunk);
            }
            *acc = append_lenient(std::mem::take(acc), chunk.clone());
            Some(Ok(chunk))
        }
        Some(Err(e)) => {
            inner.take();
            if let Some(guard) = guard.take() {
                guard.finish(&Err(e.clone()));
            }
            Some(Err(e))
        }
        None => {
            inner.take();
            if let Some(guard) = guard.take() {
                guard.finish(&Ok(std::mem::take(acc)));
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lambda::lambda;
    use serde_json::json;
    use stepwise_trace::RunCollector;

    fn double() -> Runnable {
        lambda("double", |x| Ok(json!(x.as_i64().unwrap_or(0) * 2)))
    }

    fn increment() -> Runnable {
        lambda("increment", |x| Ok(json!(x.as_i64().unwrap_or(0) + 1)))
    }

    #[test]
    fn test_call_without_listeners() {
        let out = double().call(json!(4), &ExecutionContext::default()).unwrap();
        assert_eq!(out, json!(8));
    }

    #[test]
    fn test_bitor_pipes() {
        let chain = double() | increment();
        assert_eq!(chain.parts().map(|p| p.len()), Some(2));
        assert_eq!(chain.call(json!(5), &ExecutionContext::default()).unwrap(), json!(11));
    }

    #[test]
    fn test_zero_budget_refuses() {
        let ctx = ExecutionContext::default().with_recursion_budget(0);
        let err = double().call(json!(1), &ctx).unwrap_err();
        assert_eq!(
            err,
            StepError::RecursionExceeded {
                step: "double".into()
            }
        );
    }

    #[test]
    fn test_call_records_root_run() {
        let collector = Arc::new(RunCollector::new());
        let ctx = ExecutionContext::default()
            .with_tag("outer")
            .with_metadata("k", json!("v"))
            .with_listener(collector.clone());
        double().call(json!(2), &ctx).unwrap();

        let runs = collector.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].name, "double");
        assert_eq!(runs[0].input, json!(2));
        assert_eq!(runs[0].output, Some(json!(4)));
        assert_eq!(runs[0].tags, vec!["outer"]);
        assert_eq!(runs[0].metadata["k"], json!("v"));
    }

    #[test]
    fn test_stream_run_aggregates_chunks() {
        let collector = Arc::new(RunCollector::new());
        let ctx = ExecutionContext::default().with_listener(collector.clone());
        let chunks: Vec<_> = double().stream(json!(3), &ctx).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(collector.runs()[0].output, Some(json!(6)));
    }

    #[test]
    fn test_dropped_stream_closes_run_with_error() {
        let collector = Arc::new(RunCollector::new());
        let ctx = ExecutionContext::default().with_listener(collector.clone());
        let stream = double().stream(json!(3), &ctx);
        drop(stream);
        let runs = collector.runs();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].error.is_some());
    }

    #[tokio::test]
    async fn test_async_call_records_run() {
        let collector = Arc::new(RunCollector::new());
        let ctx = ExecutionContext::default().with_listener(collector.clone());
        let out = increment().async_call(json!(1), &ctx).await.unwrap();
        assert_eq!(out, json!(2));
        assert_eq!(collector.runs()[0].output, Some(json!(2)));
    }
}
