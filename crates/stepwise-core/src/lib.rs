pub mod chunk;
pub mod config;
pub mod context;
pub mod error;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use context::ExecutionContext;
pub use error::{ErrorMatcher, Result, StepError};
pub use traits::{ChunkIter, ChunkStream, RunTracer, Step, TraceListener};
pub use types::*;
