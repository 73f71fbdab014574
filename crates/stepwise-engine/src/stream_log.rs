use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use stepwise_core::context::ExecutionContext;
use stepwise_core::error::{Result, StepError};
use stepwise_trace::{LogEvent, LogFilter, LogStreamListener, RunLogPatch};

use crate::runnable::Runnable;

// Aborts the driving task when the patch stream is dropped early.
struct Driver(JoinHandle<Result<()>>);

impl Drop for Driver {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Driver {
    async fn finish(mut self) -> Result<()> {
        match (&mut self.0).await {
            Ok(outcome) => outcome,
            Err(e) => Err(StepError::Worker(e.to_string())),
        }
    }
}

impl Runnable {
    /// Stream the invocation as run-log patches.
    ///
    /// The invocation runs as a new root. Replaying every patch with
    /// [`RunLog::from_patches`](stepwise_trace::RunLog::from_patches) yields
    /// the root's streamed chunks, its final output and one `/logs/N` entry
    /// per run admitted by `filter`. A failed invocation ends the stream
    /// with its error, after the root's closing patch.
    pub fn astream_log(
        &self,
        input: Value,
        ctx: &ExecutionContext,
        filter: LogFilter,
    ) -> BoxStream<'static, Result<RunLogPatch>> {
        let (listener, rx) = LogStreamListener::new(filter);
        let ctx = ctx.detached().with_listener(Arc::new(listener));
        let runnable = self.clone();

        let start = async move {
            let driver = Driver(tokio::spawn(async move {
                let mut chunks = runnable.async_stream(input, &ctx);
                while let Some(item) = chunks.next().await {
                    item?;
                }
                Ok::<(), StepError>(())
            }));
            patches(rx, driver)
        };
        Box::pin(futures::stream::once(start).flatten())
    }
}

fn patches(
    rx: mpsc::UnboundedReceiver<LogEvent>,
    driver: Driver,
) -> BoxStream<'static, Result<RunLogPatch>> {
    let stream = futures::stream::unfold(Some((rx, driver)), |state| async move {
        let (mut rx, driver) = state?;
        match rx.recv().await {
            Some(LogEvent::Patch(patch)) => Some((Ok(patch), Some((rx, driver)))),
            Some(LogEvent::Done) | None => match driver.finish().await {
                Ok(()) => None,
                Err(e) => Some((Err(e), None)),
            },
        }
    });
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lambda::lambda;
    use crate::passthrough::Passthrough;
    use serde_json::json;
    use stepwise_core::chunk::fold_chunks;
    use stepwise_core::types::RunKind;
    use stepwise_trace::RunLog;

    fn chain() -> Runnable {
        lambda("upper", |x| Ok(json!(x.as_str().unwrap_or("").to_uppercase())))
            | Runnable::new(Passthrough::new())
    }

    async fn replay(runnable: &Runnable, input: Value, filter: LogFilter) -> (RunLog, Option<StepError>) {
        let items: Vec<_> = runnable
            .astream_log(input, &ExecutionContext::default(), filter)
            .collect()
            .await;
        let mut patches = Vec::new();
        let mut error = None;
        for item in items {
            match item {
                Ok(patch) => patches.push(patch),
                Err(e) => error = Some(e),
            }
        }
        (RunLog::from_patches(patches).unwrap(), error)
    }

    #[tokio::test]
    async fn test_replay_matches_call() {
        let expected = chain().call(json!("abc"), &ExecutionContext::default()).unwrap();
        let (log, error) = replay(&chain(), json!("abc"), LogFilter::default()).await;
        assert!(error.is_none());
        assert_eq!(log.state["final_output"], expected);

        let streamed = log.state["streamed_output"].as_array().cloned().unwrap();
        assert_eq!(fold_chunks(streamed.into_iter().map(Ok)).unwrap(), expected);
        assert_eq!(log.state["logs"].as_array().map(Vec::len), Some(2));
        assert_eq!(log.state["logs"][0]["name"], json!("upper"));
        assert_eq!(log.state["logs"][0]["final_output"], json!("ABC"));
    }

    #[tokio::test]
    async fn test_filter_limits_logs() {
        let filter = LogFilter::default().include_kinds([RunKind::Sequence]);
        let (log, _) = replay(&chain(), json!("abc"), filter).await;
        assert_eq!(log.state["logs"], json!([]));
        assert_eq!(log.state["final_output"], json!("ABC"));
    }

    #[tokio::test]
    async fn test_failure_ends_stream_with_error() {
        let failing = lambda("boom", |_| Err(StepError::step("ValueError", "no")));
        let (log, error) = replay(&failing, json!(1), LogFilter::default()).await;
        assert_eq!(error, Some(StepError::step("ValueError", "no")));
        assert_eq!(log.state["final_output"], Value::Null);
    }
}
