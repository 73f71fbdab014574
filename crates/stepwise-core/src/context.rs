use std::sync::Arc;

use serde_json::{Map, Value};

use crate::traits::{RunTracer, TraceListener};
use crate::types::RunId;

/// Default number of nested step invocations before execution is refused.
pub const DEFAULT_RECURSION_BUDGET: usize = 25;

/// Per-invocation settings that travel down the composition tree.
///
/// Tags and metadata are inherited by every descendant run. Parameters are
/// visible only to the step they were bound to. The engine threads the
/// active trace session and parent run through the same value.
#[derive(Clone)]
pub struct ExecutionContext {
    tags: Vec<String>,
    metadata: Map<String, Value>,
    concurrency_limit: Option<usize>,
    // Unset means DEFAULT_RECURSION_BUDGET; only an explicit value overrides in `merge`.
    recursion_budget: Option<usize>,
    listeners: Vec<Arc<dyn TraceListener>>,
    params: Map<String, Value>,
    // Tags applied to the next run only, such as `seq:step:2`.
    run_tags: Vec<String>,
    tracer: Option<Arc<dyn RunTracer>>,
    parent_run: Option<RunId>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            metadata: Map::new(),
            concurrency_limit: None,
            recursion_budget: None,
            listeners: Vec::new(),
            params: Map::new(),
            run_tags: Vec::new(),
            tracer: None,
            parent_run: None,
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("tags", &self.tags)
            .field("metadata", &self.metadata)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("recursion_budget", &self.recursion_budget)
            .field("listeners", &self.listeners.len())
            .field("params", &self.params)
            .field("run_tags", &self.run_tags)
            .field("traced", &self.tracer.is_some())
            .field("parent_run", &self.parent_run)
            .finish()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit.max(1));
        self
    }

    pub fn with_recursion_budget(mut self, budget: usize) -> Self {
        self.recursion_budget = Some(budget);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn TraceListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params.extend(params);
        self
    }

    /// Combine two contexts; `overlay` wins on conflicts.
    ///
    /// Tags and listeners accumulate, metadata and parameters merge key-wise,
    /// and limits take the overlay's value when it sets one.
    pub fn merge(&self, overlay: &ExecutionContext) -> ExecutionContext {
        let mut merged = self.clone();
        merged.tags.extend(overlay.tags.iter().cloned());
        merged.metadata.extend(overlay.metadata.clone());
        if overlay.concurrency_limit.is_some() {
            merged.concurrency_limit = overlay.concurrency_limit;
        }
        if overlay.recursion_budget.is_some() {
            merged.recursion_budget = overlay.recursion_budget;
        }
        merged.listeners.extend(overlay.listeners.iter().cloned());
        merged.params.extend(overlay.params.clone());
        merged.run_tags.extend(overlay.run_tags.iter().cloned());
        if overlay.tracer.is_some() {
            merged.tracer = overlay.tracer.clone();
            merged.parent_run = overlay.parent_run;
        }
        merged
    }

    // --- engine linkage ---

    /// Context handed to a child step: parameters and one-shot run tags
    /// do not propagate.
    pub fn child(&self) -> ExecutionContext {
        let mut ctx = self.clone();
        ctx.params.clear();
        ctx.run_tags.clear();
        ctx
    }

    /// Like [`child`](Self::child), tagging the child's run with `tag`.
    pub fn child_tagged(&self, tag: impl Into<String>) -> ExecutionContext {
        let mut ctx = self.child();
        ctx.run_tags.push(tag.into());
        ctx
    }

    /// Add a one-shot tag for the next run opened with this context.
    pub fn tag_next_run(mut self, tag: impl Into<String>) -> Self {
        self.run_tags.push(tag.into());
        self
    }

    /// Context passed into a step once its run is open: one unit of
    /// recursion budget is consumed and the run becomes the parent of
    /// everything the step starts.
    pub fn enter_run(&self, run_id: RunId, tracer: Arc<dyn RunTracer>) -> ExecutionContext {
        let mut ctx = self.enter();
        ctx.tracer = Some(tracer);
        ctx.parent_run = Some(run_id);
        ctx
    }

    /// Consume one unit of recursion budget without opening a run.
    pub fn enter(&self) -> ExecutionContext {
        let mut ctx = self.clone();
        ctx.run_tags.clear();
        ctx.recursion_budget = Some(self.recursion_budget().saturating_sub(1));
        ctx
    }

    /// Context for an independent top-level invocation: same settings, no
    /// trace linkage to the caller.
    pub fn detached(&self) -> ExecutionContext {
        let mut ctx = self.clone();
        ctx.tracer = None;
        ctx.parent_run = None;
        ctx
    }

    pub fn attach_tracer(&mut self, tracer: Arc<dyn RunTracer>) {
        self.tracer = Some(tracer);
        self.parent_run = None;
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Inherited tags followed by one-shot run tags.
    pub fn run_tags(&self) -> Vec<String> {
        self.tags.iter().chain(self.run_tags.iter()).cloned().collect()
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn concurrency_limit(&self) -> Option<usize> {
        self.concurrency_limit
    }

    /// Remaining nested invocations, falling back to the default when unset.
    pub fn recursion_budget(&self) -> usize {
        self.recursion_budget.unwrap_or(DEFAULT_RECURSION_BUDGET)
    }

    pub fn listeners(&self) -> &[Arc<dyn TraceListener>] {
        &self.listeners
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn tracer(&self) -> Option<&Arc<dyn RunTracer>> {
        self.tracer.as_ref()
    }

    pub fn parent_run(&self) -> Option<&RunId> {
        self.parent_run.as_ref()
    }
}
