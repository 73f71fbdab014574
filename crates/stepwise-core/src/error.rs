use std::collections::BTreeSet;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    // Input errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Step logic errors
    #[error("{kind}: {message}")]
    Step { kind: String, message: String },

    #[error("Recursion budget exhausted at step '{step}'")]
    RecursionExceeded { step: String },

    // Composition errors
    #[error("Invalid composition: {0}")]
    Construction(String),

    #[error("Step '{step}' has no native mode to serve {mode}")]
    Unsupported { step: String, mode: String },

    #[error("Cannot append chunks: {0}")]
    ChunkMerge(String),

    // Runtime errors
    #[error("Worker failed: {0}")]
    Worker(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),
}

impl StepError {
    /// A step's own logic failure, tagged with a kind name that retry and
    /// fallback policies can match on.
    pub fn step(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Step {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Kind name used when matching and when recording errors on runs.
    pub fn kind_name(&self) -> &str {
        match self {
            Self::Validation(_) => "Validation",
            Self::Step { kind, .. } => kind,
            Self::RecursionExceeded { .. } => "RecursionExceeded",
            Self::Construction(_) => "Construction",
            Self::Unsupported { .. } => "Unsupported",
            Self::ChunkMerge(_) => "ChunkMerge",
            Self::Worker(_) => "Worker",
            Self::Config(_) | Self::ConfigNotFound(_) => "Config",
        }
    }

    /// Fatal errors are never retried and never fall back.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Step { .. })
    }
}

impl From<serde_json::Error> for StepError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StepError>;

/// Which failures a retry or fallback policy intercepts.
///
/// Only [`StepError::Step`] failures can qualify; every other kind is fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ErrorMatcher {
    /// Any step failure qualifies.
    #[default]
    AnyStep,
    /// Only step failures whose kind is in the set qualify.
    Kinds(BTreeSet<String>),
}

impl ErrorMatcher {
    pub fn kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Kinds(kinds.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, error: &StepError) -> bool {
        match error {
            StepError::Step { kind, .. } => match self {
                Self::AnyStep => true,
                Self::Kinds(kinds) => kinds.contains(kind),
            },
            _ => false,
        }
    }
}
