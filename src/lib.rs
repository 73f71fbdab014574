//! Composable step execution engine.
//!
//! Steps take a JSON value and produce one. They chain with `|`, fan out
//! with [`FanOut`], dispatch with [`Branch`] and [`Router`], and recover
//! with [`Runnable::with_retry`] and [`Runnable::with_fallbacks`]. Every
//! composite runs in four modes (blocking or async, whole or streamed),
//! and listeners on the [`ExecutionContext`] receive the run tree.
//!
//! ```no_run
//! use serde_json::json;
//! use stepwise::{lambda, ExecutionContext};
//!
//! let chain = lambda("double", |x| Ok(json!(x.as_i64().unwrap_or(0) * 2)))
//!     | lambda("increment", |x| Ok(json!(x.as_i64().unwrap_or(0) + 1)));
//! assert_eq!(chain.call(json!(5), &ExecutionContext::default()).unwrap(), json!(11));
//! ```

pub use stepwise_core::chunk::{append, fold_chunks};
pub use stepwise_core::{
    ChunkIter, ChunkStream, EngineConfig, ErrorMatcher, ExecutionContext, Result, Run, RunId,
    RunKind, Step, StepError, StepModes, TraceListener,
};
pub use stepwise_engine::{
    lambda, truthy, Backoff, BatchContext, Branch, Each, FanOut, Fallback, Flow, Lambda,
    Passthrough, Retry, RetryPolicy, Router, Runnable, Sequence,
};
pub use stepwise_trace::{
    LogEvent, LogFilter, RunCollector, RunLog, RunLogPatch, TracingListener,
};

pub mod trace {
    pub use stepwise_trace::*;
}
