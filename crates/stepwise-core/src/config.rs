use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::{ExecutionContext, DEFAULT_RECURSION_BUDGET};
use crate::error::{Result, StepError};
use crate::types::RunKind;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub log_stream: LogStreamConfig,
}

/// Base execution context applied to every top-level invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Maximum simultaneous branches or batch items. Unset means unbounded.
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
    #[serde(default = "default_recursion_budget")]
    pub recursion_budget: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            metadata: Map::new(),
            concurrency_limit: None,
            recursion_budget: default_recursion_budget(),
        }
    }
}

/// Retry wrapper defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Which nested runs appear in a run-log stream.
///
/// Empty include lists admit everything; excludes always win.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogStreamConfig {
    #[serde(default)]
    pub include_names: Vec<String>,
    #[serde(default)]
    pub include_tags: Vec<String>,
    #[serde(default)]
    pub include_kinds: Vec<RunKind>,
    #[serde(default)]
    pub exclude_names: Vec<String>,
    #[serde(default)]
    pub exclude_tags: Vec<String>,
    #[serde(default)]
    pub exclude_kinds: Vec<RunKind>,
}

fn default_recursion_budget() -> usize { DEFAULT_RECURSION_BUDGET }
fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_jitter() -> bool { true }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| StepError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(StepError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.context.concurrency_limit == Some(0) {
            return Err(StepError::Config("context.concurrency_limit must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(StepError::Config("retry.multiplier must be at least 1.0".into()));
        }
        Ok(())
    }

    /// Base context for top-level invocations.
    pub fn context(&self) -> ExecutionContext {
        let mut ctx = ExecutionContext::default()
            .with_tags(self.context.tags.iter().cloned())
            .with_recursion_budget(self.context.recursion_budget);
        for (key, value) in &self.context.metadata {
            ctx = ctx.with_metadata(key.clone(), value.clone());
        }
        if let Some(limit) = self.context.concurrency_limit {
            ctx = ctx.with_concurrency_limit(limit);
        }
        ctx
    }
}

/// Expand `${ENV_VAR}` patterns in a string. Unset variables are kept as written.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' || chars.peek() != Some(&'{') {
            result.push(c);
            continue;
        }
        chars.next();
        let name: String = chars.by_ref().take_while(|c| *c != '}').collect();
        match std::env::var(&name) {
            Ok(val) => result.push_str(&val),
            Err(_) => {
                result.push_str("${");
                result.push_str(&name);
                result.push('}');
            }
        }
    }
    result
}
