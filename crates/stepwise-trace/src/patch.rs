//! Incremental run-log documents.
//!
//! A [`RunLogPatch`] is an ordered list of `add`/`replace` operations
//! addressed by JSON pointers (RFC 6901). Applying a sequence of patches in
//! order to an empty document yields a [`RunLog`].

use std::ops::Add;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOpKind {
    Add,
    Replace,
}

/// One `{op, path, value}` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: PatchOpKind,
    pub path: String,
    pub value: Value,
}

impl PatchOp {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOpKind::Add,
            path: path.into(),
            value,
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOpKind::Replace,
            path: path.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("json pointer must be empty or start with '/': {0}")]
    InvalidPrefix(String),
    #[error("json pointer contains invalid escape (only ~0 and ~1 are allowed): {0}")]
    InvalidEscape(String),
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("invalid array index '{token}' in {path}")]
    InvalidIndex { path: String, token: String },
}

/// One emission batch of operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunLogPatch {
    pub ops: Vec<PatchOp>,
}

impl RunLogPatch {
    pub fn new(ops: Vec<PatchOp>) -> Self {
        Self { ops }
    }
}

impl Add for RunLogPatch {
    type Output = RunLogPatch;

    fn add(mut self, other: RunLogPatch) -> RunLogPatch {
        self.ops.extend(other.ops);
        self
    }
}

/// The document produced by applying patches in order, plus every op applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub ops: Vec<PatchOp>,
    pub state: Value,
}

impl Default for RunLog {
    fn default() -> Self {
        Self {
            ops: Vec::new(),
            state: Value::Null,
        }
    }
}

impl RunLog {
    /// Replay patches from an empty document.
    pub fn from_patches<I>(patches: I) -> Result<Self, PatchError>
    where
        I: IntoIterator<Item = RunLogPatch>,
    {
        let mut log = RunLog::default();
        for patch in patches {
            log.apply(&patch)?;
        }
        Ok(log)
    }

    /// Apply one patch in place. On error the log is left unchanged.
    pub fn apply(&mut self, patch: &RunLogPatch) -> Result<(), PatchError> {
        let mut state = self.state.clone();
        for op in &patch.ops {
            apply_op(&mut state, op)?;
        }
        self.state = state;
        self.ops.extend(patch.ops.iter().cloned());
        Ok(())
    }

    /// Concatenate two logs: `other`'s ops are re-applied on top of this state.
    pub fn combine(mut self, other: &RunLog) -> Result<Self, PatchError> {
        self.apply(&RunLogPatch::new(other.ops.clone()))?;
        Ok(self)
    }

    /// Convenience accessor for a top-level field of the state.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }
}

/// Parse a JSON pointer into its unescaped reference tokens.
pub fn parse_pointer(path: &str) -> Result<Vec<String>, PatchError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(PatchError::InvalidPrefix(path.to_string()));
    };

    rest.split('/')
        .map(|raw| {
            let mut token = String::with_capacity(raw.len());
            let mut chars = raw.chars();
            while let Some(ch) = chars.next() {
                if ch != '~' {
                    token.push(ch);
                    continue;
                }
                match chars.next() {
                    Some('0') => token.push('~'),
                    Some('1') => token.push('/'),
                    _ => return Err(PatchError::InvalidEscape(path.to_string())),
                }
            }
            Ok(token)
        })
        .collect()
}

/// Escape a single reference token for inclusion in a pointer.
pub fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn apply_op(doc: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    let tokens = parse_pointer(&op.path)?;
    let Some((last, parents)) = tokens.split_last() else {
        *doc = op.value.clone();
        return Ok(());
    };

    let mut target = doc;
    for token in parents {
        target = match target {
            Value::Object(map) => map.get_mut(token),
            Value::Array(items) => {
                let idx = array_index(&op.path, token, items.len())?;
                items.get_mut(idx)
            }
            _ => None,
        }
        .ok_or_else(|| PatchError::PathNotFound(op.path.clone()))?;
    }

    match (target, op.op) {
        (Value::Object(map), PatchOpKind::Add) => {
            map.insert(last.clone(), op.value.clone());
        }
        (Value::Object(map), PatchOpKind::Replace) => {
            let slot = map
                .get_mut(last)
                .ok_or_else(|| PatchError::PathNotFound(op.path.clone()))?;
            *slot = op.value.clone();
        }
        (Value::Array(items), PatchOpKind::Add) => {
            if last == "-" {
                items.push(op.value.clone());
            } else {
                let idx = array_index(&op.path, last, items.len() + 1)?;
                items.insert(idx, op.value.clone());
            }
        }
        (Value::Array(items), PatchOpKind::Replace) => {
            let idx = array_index(&op.path, last, items.len())?;
            items[idx] = op.value.clone();
        }
        _ => return Err(PatchError::PathNotFound(op.path.clone())),
    }
    Ok(())
}

fn array_index(path: &str, token: &str, bound: usize) -> Result<usize, PatchError> {
    let invalid = || PatchError::InvalidIndex {
        path: path.to_string(),
        token: token.to_string(),
    };
    // Leading zeros are not valid array indices.
    if token.len() > 1 && token.starts_with('0') {
        return Err(invalid());
    }
    let idx: usize = token.parse().map_err(|_| invalid())?;
    if idx >= bound {
        return Err(invalid());
    }
    Ok(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_pointer_escapes() {
        assert_eq!(parse_pointer("").unwrap(), Vec::<String>::new());
        assert_eq!(parse_pointer("/a~1b/c~0d").unwrap(), vec!["a/b", "c~d"]);
        assert!(matches!(parse_pointer("a/b"), Err(PatchError::InvalidPrefix(_))));
        assert!(matches!(parse_pointer("/a~2"), Err(PatchError::InvalidEscape(_))));
        assert_eq!(escape_token("a/b~c"), "a~1b~0c");
    }

    #[test]
    fn test_replay_run_log() {
        let patches = vec![
            RunLogPatch::new(vec![PatchOp::replace(
                "",
                json!({"id": "r", "streamed_output": [], "final_output": null, "logs": []}),
            )]),
            RunLogPatch::new(vec![PatchOp::add("/logs/-", json!({"name": "child"}))]),
            RunLogPatch::new(vec![PatchOp::add("/streamed_output/-", json!("fo"))]),
            RunLogPatch::new(vec![PatchOp::add("/streamed_output/-", json!("o"))]),
            RunLogPatch::new(vec![
                PatchOp::add("/logs/0/final_output", json!("foo")),
                PatchOp::replace("/final_output", json!("foo")),
            ]),
        ];

        let log = RunLog::from_patches(patches).unwrap();
        assert_eq!(log.ops.len(), 6);
        assert_eq!(log.get("streamed_output"), Some(&json!(["fo", "o"])));
        assert_eq!(log.get("final_output"), Some(&json!("foo")));
        assert_eq!(log.state["logs"][0]["final_output"], json!("foo"));
    }

    #[test]
    fn test_replace_requires_existing_target() {
        let mut log = RunLog::default();
        log.apply(&RunLogPatch::new(vec![PatchOp::replace("", json!({"a": 1}))]))
            .unwrap();
        let err = log
            .apply(&RunLogPatch::new(vec![
                PatchOp::add("/b", json!(2)),
                PatchOp::replace("/missing", json!(3)),
            ]))
            .unwrap_err();
        assert!(matches!(err, PatchError::PathNotFound(_)));
        // Failed patch leaves the log untouched.
        assert_eq!(log.state, json!({"a": 1}));
        assert_eq!(log.ops.len(), 1);
    }

    #[test]
    fn test_array_insert_and_bounds() {
        let mut log = RunLog::default();
        log.apply(&RunLogPatch::new(vec![
            PatchOp::replace("", json!({"xs": [1, 3]})),
            PatchOp::add("/xs/1", json!(2)),
            PatchOp::replace("/xs/0", json!(0)),
        ]))
        .unwrap();
        assert_eq!(log.state["xs"], json!([0, 2, 3]));

        let err = log
            .apply(&RunLogPatch::new(vec![PatchOp::add("/xs/05", json!(9))]))
            .unwrap_err();
        assert!(matches!(err, PatchError::InvalidIndex { .. }));
    }

    #[test]
    fn test_patch_concat_and_log_combine() {
        let a = RunLogPatch::new(vec![PatchOp::replace("", json!({"n": []}))]);
        let b = RunLogPatch::new(vec![PatchOp::add("/n/-", json!(1))]);
        let joined = a.clone() + b.clone();
        assert_eq!(joined.ops.len(), 2);

        let left = RunLog::from_patches(vec![a]).unwrap();
        let right = RunLog::from_patches(vec![RunLogPatch::default()]).unwrap();
        let right = RunLog {
            ops: b.ops.clone(),
            ..right
        };
        let combined = left.combine(&right).unwrap();
        assert_eq!(combined.state, json!({"n": [1]}));
        assert_eq!(combined, RunLog::from_patches(vec![joined]).unwrap());
    }

    #[test]
    fn test_op_serde_shape() {
        let op = PatchOp::add("/logs/0", json!({"name": "x"}));
        let v = serde_json::to_value(&op).unwrap();
        assert_eq!(v, json!({"op": "add", "path": "/logs/0", "value": {"name": "x"}}));
    }
}
