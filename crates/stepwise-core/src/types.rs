use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What produced a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Sequence,
    Map,
    Branch,
    Fallback,
    Retry,
    Leaf,
    Custom,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequence => "sequence",
            Self::Map => "map",
            Self::Branch => "branch",
            Self::Fallback => "fallback",
            Self::Retry => "retry",
            Self::Leaf => "leaf",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One trace record of a single step invocation.
///
/// Children are owned by their parent; a child refers back only through
/// `parent_id`, so the tree never holds cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RunId>,
    pub name: String,
    pub kind: RunKind,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub children: Vec<Run>,
}

impl Run {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Depth-first search for the first run with the given name.
    pub fn find(&self, name: &str) -> Option<&Run> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Total number of runs in this subtree, including this one.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Run::count).sum::<usize>()
    }
}

/// The fields captured when a run opens.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub name: String,
    pub kind: RunKind,
    pub input: Value,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
}

/// The execution modes a step implements natively.
///
/// Every mode not listed here is derived by the engine from the ones that are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepModes {
    pub call: bool,
    pub stream: bool,
    pub async_call: bool,
    pub async_stream: bool,
    /// Consumes a partial input stream chunk by chunk (blocking).
    pub transform: bool,
    /// Consumes a partial input stream chunk by chunk (non-blocking).
    pub async_transform: bool,
}

impl StepModes {
    pub const BLOCKING: Self = Self {
        call: true,
        stream: false,
        async_call: false,
        async_stream: false,
        transform: false,
        async_transform: false,
    };

    pub const ASYNC: Self = Self {
        call: false,
        stream: false,
        async_call: true,
        async_stream: false,
        transform: false,
        async_transform: false,
    };

    /// Both universes natively, without true streaming.
    pub const DUAL: Self = Self {
        call: true,
        stream: false,
        async_call: true,
        async_stream: false,
        transform: false,
        async_transform: false,
    };

    pub const ALL: Self = Self {
        call: true,
        stream: true,
        async_call: true,
        async_stream: true,
        transform: true,
        async_transform: true,
    };

    pub fn with_stream(mut self) -> Self {
        self.stream = true;
        self.async_stream = true;
        self
    }

    /// Whether the step produces output incrementally in any universe.
    pub fn streams(&self) -> bool {
        self.stream || self.async_stream || self.transform || self.async_transform
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
