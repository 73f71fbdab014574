//! Chunk aggregation.
//!
//! Streamed outputs are combined with [`append`]: strings concatenate,
//! arrays extend, objects merge key by key, and `null` is the identity on
//! either side. Anything else cannot be appended.

use serde_json::Value;

use crate::error::{Result, StepError};

/// Append `next` onto `acc`, producing the aggregate of both.
pub fn append(acc: Value, next: Value) -> Result<Value> {
    match (acc, next) {
        (Value::Null, next) => Ok(next),
        (acc, Value::Null) => Ok(acc),
        (Value::String(mut a), Value::String(b)) => {
            a.push_str(&b);
            Ok(Value::String(a))
        }
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Ok(Value::Array(a))
        }
        (Value::Object(mut a), Value::Object(b)) => {
            for (key, value) in b {
                let merged = match a.remove(&key) {
                    Some(existing) => append(existing, value)?,
                    None => value,
                };
                a.insert(key, merged);
            }
            Ok(Value::Object(a))
        }
        (a, b) => Err(StepError::ChunkMerge(format!(
            "{} + {}",
            type_name(&a),
            type_name(&b)
        ))),
    }
}

/// Like [`append`], but a non-appendable pair keeps the newer chunk.
///
/// Used where aggregation is informational only, such as recording a
/// streamed run's output on its trace record.
pub fn append_lenient(acc: Value, next: Value) -> Value {
    match (acc, next) {
        (Value::Null, next) => next,
        (acc, Value::Null) => acc,
        (Value::String(mut a), Value::String(b)) => {
            a.push_str(&b);
            Value::String(a)
        }
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Value::Array(a)
        }
        (Value::Object(mut a), Value::Object(b)) => {
            for (key, value) in b {
                let merged = match a.remove(&key) {
                    Some(existing) => append_lenient(existing, value),
                    None => value,
                };
                a.insert(key, merged);
            }
            Value::Object(a)
        }
        (_, b) => b,
    }
}

/// Fold a sequence of chunk results into one value, stopping at the first error.
///
/// An empty sequence folds to `null`.
pub fn fold_chunks<I>(chunks: I) -> Result<Value>
where
    I: IntoIterator<Item = Result<Value>>,
{
    let mut acc = Value::Null;
    for chunk in chunks {
        acc = append(acc, chunk?)?;
    }
    Ok(acc)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
