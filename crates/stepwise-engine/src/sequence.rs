use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::Value;

use stepwise_core::context::ExecutionContext;
use stepwise_core::error::{Result, StepError};
use stepwise_core::traits::{ChunkIter, ChunkStream, Step};
use stepwise_core::types::{RunKind, StepModes};

use crate::runnable::Runnable;

/// Steps applied left to right, each consuming the previous output.
pub struct Sequence {
    name: String,
    steps: Vec<Runnable>,
}

fn step_tag(index: usize) -> String {
    format!("seq:step:{}", index + 1)
}

fn flatten(steps: Vec<Runnable>) -> Vec<Runnable> {
    let mut flat = Vec::with_capacity(steps.len());
    for step in steps {
        match step.parts() {
            Some(parts) => flat.extend(parts.iter().cloned()),
            None => flat.push(step),
        }
    }
    flat
}

impl Sequence {
    pub fn new(steps: Vec<Runnable>) -> Result<Self> {
        if steps.is_empty() {
            return Err(StepError::Construction(
                "a sequence needs at least one step".into(),
            ));
        }
        Ok(Self::joined(steps))
    }

    /// Build from a list already known to be non-empty.
    pub(crate) fn joined(steps: Vec<Runnable>) -> Self {
        Self {
            name: "Sequence".to_string(),
            steps: flatten(steps),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn into_runnable(self) -> Runnable {
        Runnable::from_sequence(self)
    }

    pub fn steps(&self) -> &[Runnable] {
        &self.steps
    }

    pub fn first(&self) -> &Runnable {
        &self.steps[0]
    }

    /// Everything between the first and last step.
    pub fn middle(&self) -> &[Runnable] {
        match self.steps.len() {
            0..=2 => &[],
            n => &self.steps[1..n - 1],
        }
    }

    pub fn last(&self) -> &Runnable {
        &self.steps[self.steps.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Index of the step from which output flows incrementally.
    fn stream_start(&self) -> usize {
        self.steps
            .iter()
            .position(|s| s.modes().streams())
            .unwrap_or(self.steps.len() - 1)
    }
}

/// Run the prefix through `call`, stream from `start`, and feed the rest
/// through `transform`.
fn stream_chain(steps: &[Runnable], start: usize, input: Value, ctx: &ExecutionContext) -> ChunkIter {
    let mut value = input;
    for (i, step) in steps[..start].iter().enumerate() {
        match step.call(value, &ctx.child_tagged(step_tag(i))) {
            Ok(v) => value = v,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        }
    }

    let mut chunks = steps[start].stream(value, &ctx.child_tagged(step_tag(start)));
    for (i, step) in steps.iter().enumerate().skip(start + 1) {
        chunks = step.transform(chunks, &ctx.child_tagged(step_tag(i)));
    }
    chunks
}

async fn astream_chain(
    steps: Vec<Runnable>,
    start: usize,
    input: Value,
    ctx: ExecutionContext,
) -> ChunkStream {
    let mut value = input;
    for (i, step) in steps[..start].iter().enumerate() {
        match step.async_call(value, &ctx.child_tagged(step_tag(i))).await {
            Ok(v) => value = v,
            Err(e) => return Box::pin(futures::stream::once(async move { Err(e) })),
        }
    }

    let mut chunks = steps[start].async_stream(value, &ctx.child_tagged(step_tag(start)));
    for (i, step) in steps.iter().enumerate().skip(start + 1) {
        chunks = step.async_transform(chunks, &ctx.child_tagged(step_tag(i)));
    }
    chunks
}

impl Step for Sequence {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RunKind {
        RunKind::Sequence
    }

    fn modes(&self) -> StepModes {
        StepModes::ALL
    }

    fn invoke(&self, input: Value, ctx: &ExecutionContext) -> Result<Value> {
        let mut value = input;
        for (i, step) in self.steps.iter().enumerate() {
            value = step.call(value, &ctx.child_tagged(step_tag(i)))?;
        }
        Ok(value)
    }

    fn ainvoke(&self, input: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let mut value = input;
            for (i, step) in self.steps.iter().enumerate() {
                value = step.async_call(value, &ctx.child_tagged(step_tag(i))).await?;
            }
            Ok(value)
        })
    }

    fn stream(&self, input: Value, ctx: &ExecutionContext) -> ChunkIter {
        let steps = self.steps.clone();
        let start = self.stream_start();
        let ctx = ctx.clone();
        Box::new(std::iter::once_with(move || stream_chain(&steps, start, input, &ctx)).flatten())
    }

    fn transform(&self, input: ChunkIter, ctx: &ExecutionContext) -> ChunkIter {
        let mut chunks = input;
        for (i, step) in self.steps.iter().enumerate() {
            chunks = step.transform(chunks, &ctx.child_tagged(step_tag(i)));
        }
        chunks
    }

    fn astream(&self, input: Value, ctx: &ExecutionContext) -> ChunkStream {
        let chain = astream_chain(self.steps.clone(), self.stream_start(), input, ctx.clone());
        Box::pin(futures::stream::once(chain).flatten())
    }

    fn atransform(&self, input: ChunkStream, ctx: &ExecutionContext) -> ChunkStream {
        let mut chunks = input;
        for (i, step) in self.steps.iter().enumerate() {
            chunks = step.async_transform(chunks, &ctx.child_tagged(step_tag(i)));
        }
        chunks
    }

    fn input_descriptor(&self) -> Option<Value> {
        self.first().input_descriptor()
    }

    fn output_descriptor(&self) -> Option<Value> {
        self.last().output_descriptor()
    }
}
