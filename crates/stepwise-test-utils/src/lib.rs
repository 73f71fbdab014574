//! Fakes and fixtures shared by the stepwise test suites.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use serde_json::{json, Value};

use stepwise_core::context::ExecutionContext;
use stepwise_core::error::{Result, StepError};
use stepwise_core::traits::{ChunkIter, ChunkStream, Step, TraceListener};
use stepwise_core::types::{Run, RunId, StepModes};
use stepwise_engine::{lambda, Runnable};

/// Install a test-writer subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Write `content` to a temporary `.toml` file kept alive by the handle.
pub fn temp_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    file.write_all(content.as_bytes()).expect("write temp config");
    file
}

fn int(value: &Value) -> i64 {
    value.as_i64().unwrap_or(0)
}

pub fn double() -> Runnable {
    lambda("double", |x| Ok(json!(int(&x) * 2)))
}

pub fn increment() -> Runnable {
    lambda("increment", |x| Ok(json!(int(&x) + 1)))
}

/// A step that counts its invocations and otherwise behaves like `f`.
pub fn counting<F>(name: &str, f: F) -> (Runnable, Arc<AtomicUsize>)
where
    F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
{
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let step = lambda(name, move |x| {
        counted.fetch_add(1, Ordering::SeqCst);
        f(x)
    });
    (step, calls)
}

/// Always fails with a step error of the given kind.
pub struct FailingStep {
    name: String,
    kind: String,
    calls: Arc<AtomicUsize>,
}

impl FailingStep {
    pub fn new(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    fn fail(&self) -> StepError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        StepError::step(&self.kind, format!("{} always fails", self.name))
    }
}

impl Step for FailingStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn modes(&self) -> StepModes {
        StepModes::DUAL
    }

    fn invoke(&self, _input: Value, _ctx: &ExecutionContext) -> Result<Value> {
        Err(self.fail())
    }

    fn ainvoke(&self, _input: Value, _ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        let err = self.fail();
        Box::pin(async move { Err(err) })
    }
}

/// Streams its string input back one character at a time.
pub struct CharStreamer {
    name: String,
}

impl CharStreamer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn chars(input: &Value) -> Result<Vec<Value>> {
        let text = input
            .as_str()
            .ok_or_else(|| StepError::validation("expected a string input"))?;
        Ok(text.chars().map(|c| Value::String(c.to_string())).collect())
    }
}

impl Step for CharStreamer {
    fn name(&self) -> &str {
        &self.name
    }

    fn modes(&self) -> StepModes {
        StepModes {
            stream: true,
            async_stream: true,
            ..StepModes::default()
        }
    }

    fn stream(&self, input: Value, _ctx: &ExecutionContext) -> ChunkIter {
        match Self::chars(&input) {
            Ok(chars) => Box::new(chars.into_iter().map(Ok)),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    fn astream(&self, input: Value, _ctx: &ExecutionContext) -> ChunkStream {
        match Self::chars(&input) {
            Ok(chars) => Box::pin(futures::stream::unfold(chars.into_iter(), |mut rest| async move {
                tokio::task::yield_now().await;
                rest.next().map(|c| (Ok(c), rest))
            })),
            Err(e) => Box::pin(futures::stream::once(async move { Err(e) })),
        }
    }
}

/// One observed listener callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Start { name: String, parent: Option<RunId> },
    Chunk { run: RunId, chunk: Value },
    End { name: String, error: Option<String> },
}

/// Records every callback in arrival order.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.lock().clone()
    }

    /// Names of runs in the order they started.
    pub fn started(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::Start { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Names of runs in the order they ended.
    pub fn ended(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::End { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Recorded>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TraceListener for RecordingListener {
    fn on_run_start(&self, run: &Run) {
        self.lock().push(Recorded::Start {
            name: run.name.clone(),
            parent: run.parent_id,
        });
    }

    fn on_run_end(&self, run: &Run) {
        self.lock().push(Recorded::End {
            name: run.name.clone(),
            error: run.error.clone(),
        });
    }

    fn on_run_chunk(&self, run_id: &RunId, chunk: &Value) {
        self.lock().push(Recorded::Chunk {
            run: *run_id,
            chunk: chunk.clone(),
        });
    }
}
