use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use stepwise_core::context::ExecutionContext;
use stepwise_core::error::Result;
use stepwise_core::traits::Step;
use stepwise_core::types::StepModes;

use crate::runnable::Runnable;

/// What a flow lambda produced: a final value, or another step to run on
/// the same input.
pub enum Flow {
    Value(Value),
    Delegate(Runnable),
}

impl From<Value> for Flow {
    fn from(value: Value) -> Self {
        Flow::Value(value)
    }
}

impl From<Runnable> for Flow {
    fn from(runnable: Runnable) -> Self {
        Flow::Delegate(runnable)
    }
}

type SyncFn = Arc<dyn Fn(Value, &ExecutionContext) -> Result<Flow> + Send + Sync>;
type AsyncFn = Arc<dyn Fn(Value, ExecutionContext) -> BoxFuture<'static, Result<Flow>> + Send + Sync>;

enum Func {
    Sync(SyncFn),
    Async(AsyncFn),
}

/// Leaf step backed by a closure.
pub struct Lambda {
    name: String,
    func: Func,
    input_descriptor: Option<Value>,
    output_descriptor: Option<Value>,
}

impl Lambda {
    fn with_func(name: impl Into<String>, func: Func) -> Self {
        Self {
            name: name.into(),
            func,
            input_descriptor: None,
            output_descriptor: None,
        }
    }

    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        let func: SyncFn = Arc::new(move |input: Value, _: &ExecutionContext| f(input).map(Flow::Value));
        Self::with_func(name, Func::Sync(func))
    }

    /// A closure that also reads the execution context, e.g. bound parameters.
    pub fn contextual<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, &ExecutionContext) -> Result<Value> + Send + Sync + 'static,
    {
        let func: SyncFn =
            Arc::new(move |input: Value, ctx: &ExecutionContext| f(input, ctx).map(Flow::Value));
        Self::with_func(name, Func::Sync(func))
    }

    /// A closure that may hand off to another step.
    pub fn flow<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, &ExecutionContext) -> Result<Flow> + Send + Sync + 'static,
    {
        Self::with_func(name, Func::Sync(Arc::new(f)))
    }

    pub fn new_async<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let func: AsyncFn = Arc::new(
            move |input: Value, _: ExecutionContext| -> BoxFuture<'static, Result<Flow>> {
                let fut = f(input);
                Box::pin(async move { fut.await.map(Flow::Value) })
            },
        );
        Self::with_func(name, Func::Async(func))
    }

    /// Async counterpart of [`Lambda::flow`].
    pub fn flow_async<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Flow>> + Send + 'static,
    {
        let func: AsyncFn = Arc::new(
            move |input: Value, ctx: ExecutionContext| -> BoxFuture<'static, Result<Flow>> {
                Box::pin(f(input, ctx))
            },
        );
        Self::with_func(name, Func::Async(func))
    }

    /// Typed closure; the input is deserialized and the output serialized
    /// with serde. A malformed input is a validation error.
    pub fn typed<I, O, F>(name: impl Into<String>, f: F) -> Self
    where
        I: DeserializeOwned + 'static,
        O: Serialize + 'static,
        F: Fn(I) -> Result<O> + Send + Sync + 'static,
    {
        Self::new(name, move |input| {
            let typed: I = serde_json::from_value(input)?;
            Ok(serde_json::to_value(f(typed)?)?)
        })
    }

    pub fn with_input_descriptor(mut self, descriptor: Value) -> Self {
        self.input_descriptor = Some(descriptor);
        self
    }

    pub fn with_output_descriptor(mut self, descriptor: Value) -> Self {
        self.output_descriptor = Some(descriptor);
        self
    }
}

/// Shorthand for a blocking [`Lambda`] wrapped in a [`Runnable`].
pub fn lambda<F>(name: impl Into<String>, f: F) -> Runnable
where
    F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
{
    Runnable::new(Lambda::new(name, f))
}

impl Step for Lambda {
    fn name(&self) -> &str {
        &self.name
    }

    fn modes(&self) -> StepModes {
        match self.func {
            Func::Sync(_) => StepModes::BLOCKING,
            Func::Async(_) => StepModes::ASYNC,
        }
    }

    fn invoke(&self, input: Value, ctx: &ExecutionContext) -> Result<Value> {
        let Func::Sync(f) = &self.func else {
            return Err(stepwise_core::traits::unsupported(&self.name, "call"));
        };
        match f(input.clone(), ctx)? {
            Flow::Value(v) => Ok(v),
            Flow::Delegate(next) => next.call(input, &ctx.child()),
        }
    }

    fn ainvoke(&self, input: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let Func::Async(f) = &self.func else {
                return Err(stepwise_core::traits::unsupported(&self.name, "async call"));
            };
            match f(input.clone(), ctx.clone()).await? {
                Flow::Value(v) => Ok(v),
                Flow::Delegate(next) => next.async_call(input, &ctx.child()).await,
            }
        })
    }

    fn input_descriptor(&self) -> Option<Value> {
        self.input_descriptor.clone()
    }

    fn output_descriptor(&self) -> Option<Value> {
        self.output_descriptor.clone()
    }
}
