use futures::future::BoxFuture;
use serde_json::Value;

use stepwise_core::context::ExecutionContext;
use stepwise_core::error::Result;
use stepwise_core::traits::{ChunkIter, ChunkStream, Step};
use stepwise_core::types::StepModes;

/// Identity step. Chunks pass through untouched, so it never blocks a stream.
#[derive(Debug, Clone)]
pub struct Passthrough {
    name: String,
}

impl Passthrough {
    pub fn new() -> Self {
        Self {
            name: "Passthrough".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Default for Passthrough {
    fn default() -> Self {
        Self::new()
    }
}

impl Step for Passthrough {
    fn name(&self) -> &str {
        &self.name
    }

    fn modes(&self) -> StepModes {
        StepModes::ALL
    }

    fn invoke(&self, input: Value, _ctx: &ExecutionContext) -> Result<Value> {
        Ok(input)
    }

    fn ainvoke(&self, input: Value, _ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move { Ok(input) })
    }

    fn stream(&self, input: Value, _ctx: &ExecutionContext) -> ChunkIter {
        Box::new(std::iter::once(Ok(input)))
    }

    fn astream(&self, input: Value, _ctx: &ExecutionContext) -> ChunkStream {
        Box::pin(futures::stream::once(async move { Ok(input) }))
    }

    fn transform(&self, input: ChunkIter, _ctx: &ExecutionContext) -> ChunkIter {
        input
    }

    fn atransform(&self, input: ChunkStream, _ctx: &ExecutionContext) -> ChunkStream {
        input
    }
}
