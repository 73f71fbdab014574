use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{info, warn};

use stepwise_core::context::ExecutionContext;
use stepwise_core::error::{ErrorMatcher, Result, StepError};
use stepwise_core::traits::Step;
use stepwise_core::types::{RunKind, StepModes};

use crate::runnable::Runnable;

/// A primary step plus ordered alternates tried on qualifying failures.
///
/// Every alternate receives the original input. When all of them fail the
/// last error is returned; a non-qualifying error is returned immediately.
pub struct Fallback {
    name: String,
    primary: Runnable,
    alternates: Vec<Runnable>,
    matcher: ErrorMatcher,
}

impl Fallback {
    pub fn new(primary: Runnable, alternates: Vec<Runnable>, matcher: ErrorMatcher) -> Self {
        Self {
            name: "Fallback".to_string(),
            primary,
            alternates,
            matcher,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn chain(&self) -> impl Iterator<Item = &Runnable> {
        std::iter::once(&self.primary).chain(self.alternates.iter())
    }

    /// Decide whether to move on after `error`; `Err` means stop with it.
    fn absorb(&self, position: usize, step: &Runnable, error: StepError) -> Result<StepError> {
        if !self.matcher.matches(&error) {
            return Err(error);
        }
        if position < self.alternates.len() {
            warn!(
                fallback = %self.name,
                step = %step.name(),
                error = %error,
                "Step failed, trying next alternate"
            );
        }
        Ok(error)
    }
}

impl Step for Fallback {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RunKind {
        RunKind::Fallback
    }

    fn modes(&self) -> StepModes {
        StepModes::DUAL
    }

    fn invoke(&self, input: Value, ctx: &ExecutionContext) -> Result<Value> {
        let mut last_err = None;
        for (i, step) in self.chain().enumerate() {
            match step.call(input.clone(), &ctx.child()) {
                Ok(output) => {
                    if i > 0 {
                        info!(fallback = %self.name, step = %step.name(), "Fell back to alternate");
                    }
                    return Ok(output);
                }
                Err(e) => last_err = Some(self.absorb(i, step, e)?),
            }
        }
        Err(last_err.unwrap_or_else(|| StepError::Construction("fallback has no steps".into())))
    }

    fn ainvoke(&self, input: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let mut last_err = None;
            for (i, step) in self.chain().enumerate() {
                match step.async_call(input.clone(), &ctx.child()).await {
                    Ok(output) => {
                        if i > 0 {
                            info!(fallback = %self.name, step = %step.name(), "Fell back to alternate");
                        }
                        return Ok(output);
                    }
                    Err(e) => last_err = Some(self.absorb(i, step, e)?),
                }
            }
            Err(last_err.unwrap_or_else(|| StepError::Construction("fallback has no steps".into())))
        })
    }

    fn input_descriptor(&self) -> Option<Value> {
        self.primary.input_descriptor()
    }

    fn output_descriptor(&self) -> Option<Value> {
        self.primary.output_descriptor()
    }
}
