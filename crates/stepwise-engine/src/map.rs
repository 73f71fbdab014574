use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::{StreamExt, TryStreamExt};
use rayon::prelude::*;
use serde_json::{Map, Value};
use tracing::debug;

use stepwise_core::context::ExecutionContext;
use stepwise_core::error::{Result, StepError};
use stepwise_core::traits::{ChunkIter, ChunkStream, Step};
use stepwise_core::types::{RunKind, StepModes};

use crate::runnable::Runnable;
use crate::worker::{self, CHANNEL_CAPACITY};

/// Named steps that all receive the same input; outputs are keyed the same way.
pub struct FanOut {
    name: String,
    branches: Arc<Vec<(String, Runnable)>>,
}

fn key_tag(key: &str) -> String {
    format!("map:key:{}", key)
}

fn keyed(key: &str, value: Value) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(key.to_string(), value);
    Value::Object(map)
}

impl FanOut {
    /// Branches keep declaration order. Duplicate keys are rejected.
    pub fn new<I, K>(branches: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, Runnable)>,
        K: Into<String>,
    {
        let branches: Vec<(String, Runnable)> =
            branches.into_iter().map(|(k, r)| (k.into(), r)).collect();
        let mut seen = HashSet::new();
        for (key, _) in &branches {
            if !seen.insert(key.as_str()) {
                return Err(StepError::Construction(format!("duplicate map key '{}'", key)));
            }
        }
        Ok(Self {
            name: "Map".to_string(),
            branches: Arc::new(branches),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.branches.iter().map(|(k, _)| k.as_str())
    }

    fn limit(&self, ctx: &ExecutionContext) -> usize {
        ctx.concurrency_limit()
            .unwrap_or(self.branches.len())
            .clamp(1, self.branches.len().max(1))
    }
}

impl Step for FanOut {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RunKind {
        RunKind::Map
    }

    fn modes(&self) -> StepModes {
        StepModes::DUAL.with_stream()
    }

    fn invoke(&self, input: Value, ctx: &ExecutionContext) -> Result<Value> {
        let outputs = worker::with_pool(ctx.concurrency_limit(), || {
            self.branches
                .par_iter()
                .map(|(key, step)| step.call(input.clone(), &ctx.child_tagged(key_tag(key))))
                .collect::<Result<Vec<Value>>>()
        })??;

        let map = self
            .branches
            .iter()
            .map(|(key, _)| key.clone())
            .zip(outputs)
            .collect::<Map<String, Value>>();
        Ok(Value::Object(map))
    }

    fn ainvoke(&self, input: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let limit = self.limit(&ctx);
            let pending: Vec<BoxFuture<'_, Result<(usize, Value)>>> = self
                .branches
                .iter()
                .enumerate()
                .map(|(i, (key, step))| -> BoxFuture<'_, Result<(usize, Value)>> {
                    let input = input.clone();
                    let ctx = ctx.child_tagged(key_tag(key));
                    Box::pin(async move { step.async_call(input, &ctx).await.map(|v| (i, v)) })
                })
                .collect();

            // Completion order is arbitrary; the result follows declaration order.
            let mut outputs: Vec<(usize, Value)> = futures::stream::iter(pending)
                .buffer_unordered(limit)
                .try_collect()
                .await?;
            outputs.sort_by_key(|(i, _)| *i);

            let map = outputs
                .into_iter()
                .map(|(i, v)| (self.branches[i].0.clone(), v))
                .collect::<Map<String, Value>>();
            Ok(Value::Object(map))
        })
    }

    fn stream(&self, input: Value, ctx: &ExecutionContext) -> ChunkIter {
        let branches = self.branches.clone();
        let workers = self.limit(ctx);
        let ctx = ctx.clone();
        Box::new(
            std::iter::once_with(move || fan_out_stream(branches, workers, input, ctx)).flatten(),
        )
    }

    fn astream(&self, input: Value, ctx: &ExecutionContext) -> ChunkStream {
        if self.branches.is_empty() {
            return Box::pin(futures::stream::once(async { Ok(Value::Object(Map::new())) }));
        }
        let limit = self.limit(ctx);
        let ctx = ctx.clone();
        let branches = self.branches.clone();

        let streams = futures::stream::iter(0..branches.len()).map(move |i| -> ChunkStream {
            let (key, step) = &branches[i];
            let key = key.clone();
            let chunks = step.async_stream(input.clone(), &ctx.child_tagged(key_tag(&key)));
            Box::pin(chunks.map(move |item| item.map(|chunk| keyed(&key, chunk))))
        });

        // Stop at the first failure; dropping the rest cancels in-flight branches.
        let merged = streams.flatten_unordered(limit).scan(false, |failed, item| {
            if *failed {
                return future::ready(None);
            }
            *failed = item.is_err();
            future::ready(Some(item))
        });
        Box::pin(merged)
    }
}

/// Blocking fan-out stream: `workers` threads pull branches in declaration
/// order and forward `{key: chunk}` items through a bounded channel.
fn fan_out_stream(
    branches: Arc<Vec<(String, Runnable)>>,
    workers: usize,
    input: Value,
    ctx: ExecutionContext,
) -> ChunkIter {
    if branches.is_empty() {
        return Box::new(std::iter::once(Ok(Value::Object(Map::new()))));
    }

    let (tx, rx) = std_mpsc::sync_channel::<Result<Value>>(CHANNEL_CAPACITY);
    let next = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    for worker_id in 0..workers {
        let branches = branches.clone();
        let input = input.clone();
        let ctx = ctx.clone();
        let worker_tx = tx.clone();
        let next = next.clone();
        let worker_stop = stop.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("stepwise-map-{}", worker_id))
            .spawn(move || loop {
                if worker_stop.load(Ordering::Relaxed) {
                    return;
                }
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some((key, step)) = branches.get(i) else {
                    return;
                };
                for item in step.stream(input.clone(), &ctx.child_tagged(key_tag(key))) {
                    let failed = item.is_err();
                    if worker_tx.send(item.map(|chunk| keyed(key, chunk))).is_err() || failed {
                        worker_stop.store(true, Ordering::Relaxed);
                        return;
                    }
                    if worker_stop.load(Ordering::Relaxed) {
                        return;
                    }
                }
            });

        if let Err(e) = spawned {
            let _ = tx.send(Err(StepError::Worker(e.to_string())));
            stop.store(true, Ordering::Relaxed);
            break;
        }
    }
    drop(tx);
    debug!(workers, branches = branches.len(), "Map streaming started");

    Box::new(FanOutIter {
        rx,
        stop,
        done: false,
    })
}

struct FanOutIter {
    rx: std_mpsc::Receiver<Result<Value>>,
    stop: Arc<AtomicBool>,
    done: bool,
}

impl Iterator for FanOutIter {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.rx.recv() {
            Ok(Ok(chunk)) => Some(Ok(chunk)),
            Ok(Err(e)) => {
                self.done = true;
                self.stop.store(true, Ordering::Relaxed);
                Some(Err(e))
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

impl Drop for FanOutIter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
