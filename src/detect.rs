//! Corruption signature for self-nested meta values.
//!
//! Both checks are heuristics inherited from the incident: they flag data that
//! is very likely corrupted, they do not prove it. The constants are kept as
//! shipped so reports stay comparable across runs.

use tracing::debug;

use crate::serialized::{ArrayKey, Value, format_float, serialize};
use crate::store::MetadataRecord;

/// Entry count above which an array is checked for oversized elements.
pub(crate) const THRESHOLD: usize = 1000;

/// Byte length above which a nested first element counts as oversized.
pub(crate) const LARGE_ELEMENT_BYTES: usize = 100_000;

/// True if `value` is an array that contains itself under `key`, or is a very
/// large array carrying an oversized nested element.
pub(crate) fn is_affected(key: &str, value: &Value) -> bool {
    let Some(entries) = value.entries() else {
        return false;
    };
    has_self_entry(key, value)
        || (entries.len() > THRESHOLD && has_large_nested_element(entries))
}

/// `isset($value[$key])`: present and not null.
pub(crate) fn has_self_entry(key: &str, value: &Value) -> bool {
    value
        .get(&ArrayKey::from_str_key(key))
        .is_some_and(|v| *v != Value::Null)
}

fn has_large_nested_element(entries: &[(ArrayKey, Value)]) -> bool {
    entries.iter().any(|(_, entry)| {
        entry
            .get(&ArrayKey::Int(0))
            .is_some_and(|first| byte_len(first) > LARGE_ELEMENT_BYTES)
    })
}

/// Length of a value as PHP's `strlen` would see its string form; containers
/// are measured serialized.
fn byte_len(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(false) => 0,
        Value::Bool(true) => 1,
        Value::Int(n) => n.to_string().len(),
        Value::Float(f) => format_float(*f).len(),
        Value::Str(s) => s.len(),
        Value::Array(_) | Value::Object { .. } => serialize(value).len(),
    }
}

/// Decode and test a stored record. Values that fail to decode are not
/// affected.
pub(crate) fn record_is_affected(record: &MetadataRecord) -> bool {
    match record.decode() {
        Ok(value) => is_affected(&record.key, &value),
        Err(e) => {
            debug!(meta_id = record.id, error = %e, "skipping undecodable meta value");
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Builders for corrupted values shared by the repair and report tests.

    use crate::serialized::{ArrayKey, Value};

    pub(crate) fn s(text: &str) -> Value {
        Value::Str(text.to_string())
    }

    pub(crate) fn list(items: Vec<Value>) -> Value {
        Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (ArrayKey::Int(i as i64), v))
                .collect(),
        )
    }

    pub(crate) fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Array(
            entries
                .into_iter()
                .map(|(k, v)| (ArrayKey::from_str_key(k), v))
                .collect(),
        )
    }

    /// `{key: [stale, good]}`, the shape one bug trigger leaves behind.
    pub(crate) fn self_nested(key: &str, stale: Value, good: Value) -> Value {
        map(vec![(key, list(vec![stale, good]))])
    }

    /// 1001 entries, one of which starts with a 100001-byte string.
    pub(crate) fn large_blob() -> Value {
        let mut entries: Vec<(ArrayKey, Value)> = (0..1000)
            .map(|i| (ArrayKey::Str(format!("row_{i}")), list(vec![s("ok")])))
            .collect();
        entries.push((
            ArrayKey::Str("blob".into()),
            list(vec![s(&"x".repeat(100_001))]),
        ));
        Value::Array(entries)
    }
}
