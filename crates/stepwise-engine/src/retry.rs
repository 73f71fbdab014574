use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use stepwise_core::config::RetryConfig;
use stepwise_core::context::ExecutionContext;
use stepwise_core::error::{ErrorMatcher, Result, StepError};
use stepwise_core::traits::Step;
use stepwise_core::types::{RunKind, StepModes};

use crate::runnable::Runnable;

/// Exponential backoff between attempts, capped, with optional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Backoff {
    /// Retry immediately.
    pub fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay before attempt `failed + 1`, after `failed` failures.
    pub fn delay(&self, failed: u32) -> Duration {
        let exp = self.multiplier.powi(failed.saturating_sub(1) as i32);
        let ms = (self.initial.as_millis() as f64 * exp).min(self.max.as_millis() as f64);
        let ms = if self.jitter {
            // 0.8x to 1.2x
            ms * (0.8 + rand::random::<f64>() * 0.4)
        } else {
            ms
        };
        Duration::from_millis(ms as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}

/// How many times to try, which failures qualify, and how long to wait.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub matcher: ErrorMatcher,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Up to `max_attempts` tries on any step failure, without waiting.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            matcher: ErrorMatcher::AnyStep,
            backoff: Backoff::none(),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            matcher: ErrorMatcher::AnyStep,
            backoff: Backoff::from(config),
        }
    }

    pub fn retry_on(mut self, matcher: ErrorMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn should_retry(&self, attempt: u32, error: &StepError) -> bool {
        attempt < self.max_attempts && self.matcher.matches(error)
    }
}

/// Re-invokes a step on qualifying failures.
pub struct Retry {
    name: String,
    inner: Runnable,
    policy: RetryPolicy,
}

fn attempt_ctx(ctx: &ExecutionContext, attempt: u32) -> ExecutionContext {
    if attempt > 1 {
        ctx.child_tagged(format!("retry:attempt:{}", attempt))
    } else {
        ctx.child()
    }
}

impl Retry {
    pub fn new(inner: Runnable, policy: RetryPolicy) -> Self {
        Self {
            name: "Retry".to_string(),
            inner,
            policy,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn log_retry(&self, attempt: u32, delay: Duration, error: &StepError) {
        warn!(
            step = %self.inner.name(),
            attempt,
            max_attempts = self.policy.max_attempts,
            backoff_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying step"
        );
    }
}

impl Step for Retry {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RunKind {
        RunKind::Retry
    }

    fn modes(&self) -> StepModes {
        StepModes::DUAL
    }

    fn invoke(&self, input: Value, ctx: &ExecutionContext) -> Result<Value> {
        let mut attempt = 1;
        loop {
            match self.inner.call(input.clone(), &attempt_ctx(ctx, attempt)) {
                Ok(output) => return Ok(output),
                Err(e) if self.policy.should_retry(attempt, &e) => {
                    let delay = self.policy.backoff.delay(attempt);
                    self.log_retry(attempt, delay, &e);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn ainvoke(&self, input: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let mut attempt = 1;
            loop {
                match self.inner.async_call(input.clone(), &attempt_ctx(&ctx, attempt)).await {
                    Ok(output) => return Ok(output),
                    Err(e) if self.policy.should_retry(attempt, &e) => {
                        let delay = self.policy.backoff.delay(attempt);
                        self.log_retry(attempt, delay, &e);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }

    fn input_descriptor(&self) -> Option<Value> {
        self.inner.input_descriptor()
    }

    fn output_descriptor(&self) -> Option<Value> {
        self.inner.output_descriptor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lambda::lambda;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use stepwise_trace::RunCollector;

    fn always_failing(kind: &'static str, calls: Arc<AtomicUsize>) -> Runnable {
        lambda("flaky", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StepError::step(kind, "nope"))
        })
    }

    #[test]
    fn test_backoff_schedule() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(250),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(250));
        assert_eq!(Backoff::none().delay(5), Duration::ZERO);
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let backoff = Backoff {
            jitter: true,
            ..Backoff::from(&RetryConfig::default())
        };
        for _ in 0..20 {
            let ms = backoff.delay(1).as_millis();
            assert!((800..=1200).contains(&ms), "{}ms out of range", ms);
        }
    }

    #[test]
    fn test_qualifying_failure_uses_all_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = always_failing("ValueError", calls.clone()).with_retry(RetryPolicy::attempts(3));
        let err = step.call(json!(1), &ExecutionContext::default()).unwrap_err();
        assert_eq!(err, StepError::step("ValueError", "nope"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_non_qualifying_failure_single_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::attempts(3).retry_on(ErrorMatcher::kinds(["ValueError"]));
        let step = always_failing("RuntimeError", calls.clone()).with_retry(policy);
        assert!(step.call(json!(1), &ExecutionContext::default()).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attempt_runs_tagged() {
        let collector = Arc::new(RunCollector::new());
        let ctx = ExecutionContext::default().with_listener(collector.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let step = always_failing("ValueError", calls).with_retry(RetryPolicy::attempts(3));
        let _ = step.call(json!(1), &ctx);

        let root = &collector.runs()[0];
        assert_eq!(root.kind, RunKind::Retry);
        let tags: Vec<_> = root.children.iter().map(|c| c.tags.clone()).collect();
        assert_eq!(
            tags,
            vec![vec![], vec!["retry:attempt:2".to_string()], vec!["retry:attempt:3".to_string()]]
        );
        assert_eq!(root.error.as_deref(), Some("ValueError: nope"));
    }

    #[test]
    fn test_success_after_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let step = lambda("second_time", move |x| {
            if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StepError::step("ValueError", "first"))
            } else {
                Ok(x)
            }
        })
        .with_retry(RetryPolicy::attempts(2));
        assert_eq!(step.call(json!(7), &ExecutionContext::default()).unwrap(), json!(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_async_retry_with_backoff() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::attempts(2).with_backoff(Backoff {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: false,
        });
        let step = always_failing("ValueError", calls.clone()).with_retry(policy);
        assert!(step.async_call(json!(1), &ExecutionContext::default()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
