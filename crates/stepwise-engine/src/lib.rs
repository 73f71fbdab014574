pub mod batch;
pub mod binding;
pub mod branch;
pub mod each;
pub mod fallback;
pub mod lambda;
pub mod map;
pub mod modes;
pub mod passthrough;
pub mod retry;
pub mod router;
pub mod runnable;
pub mod sequence;
pub mod stream_log;
pub mod worker;

pub use batch::BatchContext;
pub use binding::{Bound, Configured};
pub use branch::{truthy, Branch};
pub use each::Each;
pub use fallback::Fallback;
pub use lambda::{lambda, Flow, Lambda};
pub use map::FanOut;
pub use passthrough::Passthrough;
pub use retry::{Backoff, Retry, RetryPolicy};
pub use router::Router;
pub use runnable::Runnable;
pub use sequence::Sequence;
