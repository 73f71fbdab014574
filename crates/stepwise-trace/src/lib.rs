pub mod listeners;
pub mod log_stream;
pub mod patch;
pub mod session;

pub use listeners::{RunCollector, TracingListener};
pub use log_stream::{LogEvent, LogFilter, LogStreamListener};
pub use patch::{PatchError, PatchOp, PatchOpKind, RunLog, RunLogPatch};
pub use session::{RunGuard, TraceSession};
