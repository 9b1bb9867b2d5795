//! Structural merge of a typed, partially populated value into an externally owned JSON document.
//!
//! The external document is owned by someone else (a UI, agents, ...), so the merge never drops
//! keys it does not know about. The only way to delete such a key is to send the
//! [`DELETION_SENTINEL`] (or `null`) for it.
//!
//! ```
//! use mongodb_shared::merge::{DELETION_SENTINEL, merge_maps};
//! use serde_json::json;
//!
//! let original = json!({"keyfile": "/var/lib/keyfile", "autoPwd": "secret", "custom": 1});
//! let desired = json!({"keyfile": "/etc/keyfile", "autoPwd": DELETION_SENTINEL});
//!
//! let merged = merge_maps(
//!     desired.as_object().unwrap(),
//!     original.as_object().unwrap(),
//! );
//! assert_eq!(
//!     serde_json::Value::Object(merged),
//!     json!({"keyfile": "/etc/keyfile", "custom": 1})
//! );
//! ```

use serde::Serialize;
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};

/// Reserved string value meaning "remove this key" during a structural merge.
pub const DELETION_SENTINEL: &str = "__MERGE_DELETE__";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize the desired value"))]
    SerializeDesired { source: serde_json::Error },

    #[snafu(display("the desired value must serialize to a JSON object, but it is {kind}"))]
    DesiredNotAnObject { kind: &'static str },
}

/// Serializes `desired` and merges it into `original`, see [`merge_maps`].
///
/// Serialization failures are never retried, they always indicate a programming error.
pub fn merge_with<T>(
    desired: &T,
    original: &Map<String, Value>,
) -> Result<Map<String, Value>, Error>
where
    T: Serialize + ?Sized,
{
    match serde_json::to_value(desired).context(SerializeDesiredSnafu)? {
        Value::Object(desired) => Ok(merge_maps(&desired, original)),
        other => DesiredNotAnObjectSnafu {
            kind: value_kind(&other),
        }
        .fail(),
    }
}

/// Merges `desired` into `original` and returns the result.
///
/// - Keys only present in `original` are copied, except arrays which become empty.
/// - Keys present in both are merged recursively for objects and pairwise for arrays, for all
///   other values `desired` wins.
/// - Keys whose merged value is `null` or the [`DELETION_SENTINEL`] are removed.
///
/// Merging the same `desired` twice yields the same document as merging it once.
pub fn merge_maps(
    desired: &Map<String, Value>,
    original: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = Map::with_capacity(original.len().max(desired.len()));

    for (key, original_value) in original {
        let value = match desired.get(key) {
            Some(desired_value) => merge_values(desired_value, Some(original_value)),
            None if original_value.is_array() => Value::Array(Vec::new()),
            None => original_value.clone(),
        };
        merged.insert(key.clone(), value);
    }

    for (key, desired_value) in desired {
        if !original.contains_key(key) {
            merged.insert(key.clone(), merge_values(desired_value, None));
        }
    }

    merged.retain(|_, value| !is_deletion(value));
    merged
}

/// Returns `true` for the values that request removal of their key or array slot.
pub fn is_deletion(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s == DELETION_SENTINEL,
        _ => false,
    }
}

fn merge_values(desired: &Value, original: Option<&Value>) -> Value {
    match (desired, original) {
        (Value::Object(desired), Some(Value::Object(original))) => {
            Value::Object(merge_maps(desired, original))
        }
        // Still needs a pass to sweep deletions nested in the desired value
        (Value::Object(desired), _) => Value::Object(merge_maps(desired, &Map::new())),
        (Value::Array(desired), Some(Value::Array(original))) => {
            Value::Array(merge_arrays(desired, original))
        }
        (Value::Array(desired), _) => Value::Array(merge_arrays(desired, &[])),
        _ => desired.clone(),
    }
}

/// Walks both arrays with independent cursors. A deleted desired element is dropped and consumes
/// its positional counterpart in `original`, so that later elements stay paired with theirs.
fn merge_arrays(desired: &[Value], original: &[Value]) -> Vec<Value> {
    let mut merged = Vec::with_capacity(desired.len());
    let mut j = 0;

    for desired_value in desired {
        let original_value = original.get(j);
        j += 1;

        if is_deletion(desired_value) {
            continue;
        }

        // Only objects are merged element-wise, everything else is taken from desired as is
        let original_value = original_value.filter(|value| value.is_object());
        merged.push(merge_values(desired_value, original_value));
    }

    merged
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
