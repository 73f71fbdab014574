//! Bridges between the blocking and non-blocking execution universes.

use std::future::Future;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use stepwise_core::error::{Result, StepError};
use stepwise_core::traits::{ChunkIter, ChunkStream};

/// Buffered chunks between a producer on one side of a bridge and its consumer.
pub const CHANNEL_CAPACITY: usize = 16;

fn current_thread_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| StepError::Worker(format!("failed to build runtime: {}", e)))
}

/// Drive a future to completion from blocking code.
///
/// Inside a tokio runtime the future runs on a scoped helper thread with its
/// own single-threaded runtime, so the caller's scheduler is never re-entered.
pub fn block_on<F>(fut: F) -> Result<F::Output>
where
    F: Future + Send,
    F::Output: Send,
{
    if tokio::runtime::Handle::try_current().is_err() {
        return Ok(current_thread_runtime()?.block_on(fut));
    }

    std::thread::scope(|scope| {
        let helper = scope.spawn(move || current_thread_runtime().map(|rt| rt.block_on(fut)));
        match helper.join() {
            Ok(output) => output,
            Err(_) => Err(StepError::Worker("blocking bridge thread panicked".into())),
        }
    })
}

/// Run blocking work on the runtime's blocking pool.
pub async fn spawn_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StepError::Worker(e.to_string()))?
}

/// Expose a blocking chunk iterator as a stream.
///
/// The iterator is created and drained on the blocking pool once the stream
/// is first polled. Dropping the stream stops the producer at its next chunk.
pub fn iter_to_stream<F>(make: F) -> ChunkStream
where
    F: FnOnce() -> ChunkIter + Send + 'static,
{
    let start = async move {
        let (tx, rx) = mpsc::channel::<Result<Value>>(CHANNEL_CAPACITY);
        let producer = tokio::task::spawn_blocking(move || {
            for item in make() {
                if tx.blocking_send(item).is_err() {
                    break;
                }
            }
        });

        futures::stream::unfold((rx, Some(producer)), |(mut rx, producer)| async move {
            if let Some(item) = rx.recv().await {
                return Some((item, (rx, producer)));
            }
            match producer?.await {
                Ok(()) => None,
                Err(e) => Some((Err(StepError::Worker(e.to_string())), (rx, None))),
            }
        })
    };
    Box::pin(futures::stream::once(start).flatten())
}

/// Expose a stream as a blocking chunk iterator.
///
/// The stream is driven on a dedicated thread with its own runtime, started
/// on the first call to `next`.
pub fn stream_to_iter(stream: ChunkStream) -> ChunkIter {
    Box::new(std::iter::once_with(move || start_stream_thread(stream)).flatten())
}

fn start_stream_thread(stream: ChunkStream) -> ThreadIter {
    let (tx, rx) = std_mpsc::sync_channel::<Result<Value>>(CHANNEL_CAPACITY);
    let spawned = std::thread::Builder::new()
        .name("stepwise-stream".into())
        .spawn(move || {
            let rt = match current_thread_runtime() {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            rt.block_on(async move {
                let mut stream = stream;
                while let Some(item) = stream.next().await {
                    if tx.send(item).is_err() {
                        break;
                    }
                }
            });
        });

    match spawned {
        Ok(handle) => ThreadIter {
            rx: Some(rx),
            handle: Some(handle),
        },
        Err(e) => {
            // Nothing was spawned; report through the channel we still own.
            let (tx, rx) = std_mpsc::sync_channel(1);
            let _ = tx.send(Err(StepError::Worker(e.to_string())));
            ThreadIter {
                rx: Some(rx),
                handle: None,
            }
        }
    }
}

/// Receives chunks from a producer thread; a panicked producer surfaces as
/// a final worker error.
pub struct ThreadIter {
    rx: Option<std_mpsc::Receiver<Result<Value>>>,
    handle: Option<JoinHandle<()>>,
}

impl Iterator for ThreadIter {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let rx = self.rx.as_ref()?;
        if let Ok(item) = rx.recv() {
            return Some(item);
        }
        self.rx = None;
        match self.handle.take()?.join() {
            Ok(()) => None,
            Err(_) => Some(Err(StepError::Worker("stream worker panicked".into()))),
        }
    }
}

impl ThreadIter {
    pub fn new(rx: std_mpsc::Receiver<Result<Value>>, handle: Option<JoinHandle<()>>) -> Self {
        Self { rx: Some(rx), handle }
    }
}

/// Run `op` on a rayon pool sized to `limit`, or on the global pool when unbounded.
pub fn with_pool<T, F>(limit: Option<usize>, op: F) -> Result<T>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    match limit {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n.max(1))
                .thread_name(|i| format!("stepwise-pool-{}", i))
                .build()
                .map_err(|e| StepError::Worker(e.to_string()))?;
            Ok(pool.install(op))
        }
        None => Ok(op()),
    }
}
