//! Cross-mode derivation.
//!
//! Every step declares the modes it implements natively. These functions
//! serve any mode request from the best available native mode, preferring
//! a same-universe derivation and crossing universes through the bridges
//! in [`crate::worker`] otherwise.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;

use stepwise_core::chunk::{append, fold_chunks};
use stepwise_core::context::ExecutionContext;
use stepwise_core::error::Result;
use stepwise_core::traits::{unsupported, ChunkIter, ChunkStream, Step};

use crate::worker;

async fn fold_stream(mut stream: ChunkStream) -> Result<Value> {
    let mut acc = Value::Null;
    while let Some(chunk) = stream.next().await {
        acc = append(acc, chunk?)?;
    }
    Ok(acc)
}

fn single(input: Value) -> ChunkIter {
    Box::new(std::iter::once(Ok(input)))
}

fn single_stream(input: Value) -> ChunkStream {
    Box::pin(futures::stream::once(async move { Ok(input) }))
}

fn failed_stream(err: stepwise_core::error::StepError) -> ChunkStream {
    Box::pin(futures::stream::once(async move { Err(err) }))
}

pub fn call(step: &Arc<dyn Step>, input: Value, ctx: &ExecutionContext) -> Result<Value> {
    let modes = step.modes();
    if modes.call {
        step.invoke(input, ctx)
    } else if modes.async_call {
        worker::block_on(step.ainvoke(input, ctx.clone()))?
    } else if modes.stream {
        fold_chunks(step.stream(input, ctx))
    } else if modes.transform {
        fold_chunks(step.transform(single(input), ctx))
    } else if modes.async_stream {
        worker::block_on(fold_stream(step.astream(input, ctx)))?
    } else if modes.async_transform {
        worker::block_on(fold_stream(step.atransform(single_stream(input), ctx)))?
    } else {
        Err(unsupported(step.name(), "call"))
    }
}

pub async fn async_call(step: Arc<dyn Step>, input: Value, ctx: ExecutionContext) -> Result<Value> {
    let modes = step.modes();
    if modes.async_call {
        step.ainvoke(input, ctx).await
    } else if modes.call {
        worker::spawn_blocking(move || step.invoke(input, &ctx)).await
    } else if modes.async_stream {
        fold_stream(step.astream(input, &ctx)).await
    } else if modes.async_transform {
        fold_stream(step.atransform(single_stream(input), &ctx)).await
    } else if modes.stream {
        worker::spawn_blocking(move || fold_chunks(step.stream(input, &ctx))).await
    } else if modes.transform {
        worker::spawn_blocking(move || fold_chunks(step.transform(single(input), &ctx))).await
    } else {
        Err(unsupported(step.name(), "async call"))
    }
}

pub fn stream(step: Arc<dyn Step>, input: Value, ctx: &ExecutionContext) -> ChunkIter {
    let modes = step.modes();
    if modes.stream {
        step.stream(input, ctx)
    } else if modes.transform {
        step.transform(single(input), ctx)
    } else if modes.async_stream {
        worker::stream_to_iter(step.astream(input, ctx))
    } else if modes.async_transform {
        worker::stream_to_iter(step.atransform(single_stream(input), ctx))
    } else {
        let ctx = ctx.clone();
        Box::new(std::iter::once_with(move || call(&step, input, &ctx)))
    }
}

pub fn async_stream(step: Arc<dyn Step>, input: Value, ctx: &ExecutionContext) -> ChunkStream {
    let modes = step.modes();
    if modes.async_stream {
        step.astream(input, ctx)
    } else if modes.async_transform {
        step.atransform(single_stream(input), ctx)
    } else if modes.stream || modes.transform {
        let ctx = ctx.clone();
        worker::iter_to_stream(move || stream(step, input, &ctx))
    } else {
        let ctx = ctx.clone();
        Box::pin(futures::stream::once(async_call(step, input, ctx)))
    }
}

/// Consume a partial input stream. Steps without a native transform see the
/// whole input, aggregated with `append`, once the input is exhausted.
pub fn transform(step: Arc<dyn Step>, input: ChunkIter, ctx: &ExecutionContext) -> ChunkIter {
    let modes = step.modes();
    if modes.transform {
        return step.transform(input, ctx);
    }
    if modes.async_transform {
        let ctx = ctx.clone();
        let input = worker::iter_to_stream(move || input);
        return worker::stream_to_iter(Box::pin(futures::stream::once(async move {
            step.atransform(input, &ctx)
        })
        .flatten()));
    }

    let ctx = ctx.clone();
    Box::new(
        std::iter::once_with(move || match fold_chunks(input) {
            Ok(folded) => stream(step, folded, &ctx),
            Err(e) => Box::new(std::iter::once(Err(e))) as ChunkIter,
        })
        .flatten(),
    )
}

pub fn async_transform(step: Arc<dyn Step>, input: ChunkStream, ctx: &ExecutionContext) -> ChunkStream {
    let modes = step.modes();
    if modes.async_transform {
        return step.atransform(input, ctx);
    }
    if modes.transform {
        let ctx = ctx.clone();
        return worker::iter_to_stream(move || step.transform(worker::stream_to_iter(input), &ctx));
    }

    let ctx = ctx.clone();
    Box::pin(
        futures::stream::once(async move {
            match fold_stream(input).await {
                Ok(folded) => async_stream(step, folded, &ctx),
                Err(e) => failed_stream(e),
            }
        })
        .flatten(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::json;
    use stepwise_core::error::StepError;
    use stepwise_core::types::StepModes;

    /// Implements exactly the modes it is told to; everything echoes "ab".
    struct Only(StepModes);

    impl Step for Only {
        fn name(&self) -> &str {
            "only"
        }

        fn modes(&self) -> StepModes {
            self.0
        }

        fn invoke(&self, _input: Value, _ctx: &ExecutionContext) -> Result<Value> {
            Ok(json!("ab"))
        }

        fn stream(&self, _input: Value, _ctx: &ExecutionContext) -> ChunkIter {
            Box::new(vec![Ok(json!("a")), Ok(json!("b"))].into_iter())
        }

        fn ainvoke(&self, _input: Value, _ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
            Box::pin(async { Ok(json!("ab")) })
        }

        fn astream(&self, _input: Value, _ctx: &ExecutionContext) -> ChunkStream {
            Box::pin(futures::stream::iter(vec![Ok(json!("a")), Ok(json!("b"))]))
        }
    }

    fn step(modes: StepModes) -> Arc<dyn Step> {
        Arc::new(Only(modes))
    }

    fn only_stream() -> StepModes {
        StepModes {
            stream: true,
            ..StepModes::default()
        }
    }

    fn only_astream() -> StepModes {
        StepModes {
            async_stream: true,
            ..StepModes::default()
        }
    }

    #[test]
    fn test_call_from_each_native_mode() {
        let ctx = ExecutionContext::default();
        for modes in [StepModes::BLOCKING, StepModes::ASYNC, only_stream(), only_astream()] {
            assert_eq!(call(&step(modes), json!(null), &ctx).unwrap(), json!("ab"));
        }
    }

    #[test]
    fn test_call_with_no_modes_is_unsupported() {
        let err = call(&step(StepModes::default()), json!(null), &ExecutionContext::default())
            .unwrap_err();
        assert!(matches!(err, StepError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_async_call_from_each_native_mode() {
        let ctx = ExecutionContext::default();
        for modes in [StepModes::BLOCKING, StepModes::ASYNC, only_stream(), only_astream()] {
            let out = async_call(step(modes), json!(null), ctx.clone()).await.unwrap();
            assert_eq!(out, json!("ab"));
        }
    }

    #[test]
    fn test_stream_derivations() {
        let ctx = ExecutionContext::default();
        let chunks: Vec<_> = stream(step(only_astream()), json!(null), &ctx)
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(chunks, vec![json!("a"), json!("b")]);

        let chunks: Vec<_> = stream(step(StepModes::BLOCKING), json!(null), &ctx)
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(chunks, vec![json!("ab")]);
    }

    #[tokio::test]
    async fn test_async_stream_from_blocking_stream() {
        let ctx = ExecutionContext::default();
        let chunks: Vec<_> = async_stream(step(only_stream()), json!(null), &ctx)
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn test_default_transform_folds_input() {
        let ctx = ExecutionContext::default();
        let input: ChunkIter = Box::new(vec![Ok(json!("x")), Ok(json!("y"))].into_iter());
        let out: Vec<_> = transform(step(StepModes::BLOCKING), input, &ctx).collect();
        assert_eq!(out.len(), 1);

        let bad: ChunkIter = Box::new(vec![Ok(json!(1)), Ok(json!(2))].into_iter());
        let out: Vec<_> = transform(step(StepModes::BLOCKING), bad, &ctx).collect();
        assert!(matches!(out[0], Err(StepError::ChunkMerge(_))));
    }

    #[tokio::test]
    async fn test_default_async_transform_folds_input() {
        let ctx = ExecutionContext::default();
        let input: ChunkStream = Box::pin(futures::stream::iter(vec![Ok(json!("x"))]));
        let out: Vec<_> = async_transform(step(StepModes::ASYNC), input, &ctx).collect().await;
        assert_eq!(out[0].as_ref().unwrap(), &json!("ab"));
    }
}
