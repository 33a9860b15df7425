//! Stripping of self-nested duplicates.

use tracing::{debug, info};

use crate::detect::{has_self_entry, is_affected};
use crate::error::Result;
use crate::serialized::{ArrayKey, Value, is_serialized, maybe_serialize, unserialize};
use crate::store::{MetaStore, MetadataRecord};

/// Strip self-nesting from `value` until the corruption signature is gone.
///
/// Each round replaces the value with the last element stored under its own
/// key (the most recent copy the bug appended). Oversized arrays without such
/// an entry have nothing recoverable and become the empty string.
pub(crate) fn repair(key: &str, value: Value) -> Value {
    let mut current = normalize(value);
    while is_affected(key, &current) {
        current = normalize(strip_once(key, current));
    }
    current
}

/// Serialized text nested as a plain string is decoded before the next round,
/// matching what a reload from the database would see.
fn normalize(value: Value) -> Value {
    if let Value::Str(text) = &value {
        if is_serialized(text, true) {
            if let Ok(decoded) = unserialize(text) {
                return decoded;
            }
        }
    }
    value
}

fn strip_once(key: &str, value: Value) -> Value {
    if !has_self_entry(key, &value) {
        return Value::Str(String::new());
    }
    let Value::Array(entries) = value else {
        return value;
    };
    let wanted = ArrayKey::from_str_key(key);
    let nested = entries
        .into_iter()
        .find(|(k, _)| *k == wanted)
        .map(|(_, v)| v);
    match nested {
        Some(Value::Array(mut items)) => items.pop().map_or(Value::Null, |(_, v)| v),
        _ => Value::Null,
    }
}

/// Repaired value for a stored record, or `None` when it should be left as is
/// (undecodable, unaffected, or already clean).
pub(crate) fn planned_repair(record: &MetadataRecord) -> Option<Value> {
    let original = match record.decode() {
        Ok(value) => value,
        Err(e) => {
            debug!(meta_id = record.id, error = %e, "skipping undecodable meta value");
            return None;
        }
    };
    if !is_affected(&record.key, &original) {
        return None;
    }
    let repaired = repair(&record.key, original.clone());
    (repaired != original).then_some(repaired)
}

/// Repair one record in place. Returns whether a write was issued.
pub(crate) fn maybe_update_meta<S: MetaStore + ?Sized>(
    store: &S,
    record: &MetadataRecord,
) -> Result<bool> {
    let Some(repaired) = planned_repair(record) else {
        return Ok(false);
    };
    let encoded = maybe_serialize(&repaired);
    store.update_value(record.id, &encoded)?;
    info!(
        meta_id = record.id,
        owner_id = record.owner_id,
        key = %record.key,
        before_bytes = record.value.len(),
        after_bytes = encoded.len(),
        "repaired meta value"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::fixtures::*;
    use crate::serialized::serialize;
    use crate::store::fake::FakeStore;

    #[test]
    fn test_self_nesting_keeps_last_element() {
        let value = self_nested("gallery", s("A"), s("B"));
        assert_eq!(repair("gallery", value), s("B"));
    }

    #[test]
    fn test_repeated_nesting_is_fully_unwound() {
        let inner = self_nested("k", s("stale"), map(vec![("title", s("final"))]));
        let outer = self_nested("k", s("older"), inner);
        assert_eq!(repair("k", outer), map(vec![("title", s("final"))]));
    }

    #[test]
    fn test_nested_serialized_string_is_decoded_between_rounds() {
        let inner = serialize(&self_nested("k", s("x"), s("end")));
        let outer = self_nested("k", s("x"), Value::Str(inner));
        assert_eq!(repair("k", outer), s("end"));
    }

    #[test]
    fn test_large_blob_is_discarded() {
        assert_eq!(repair("unrelated", large_blob()), s(""));
    }

    #[test]
    fn test_empty_or_scalar_self_entry_becomes_null() {
        assert_eq!(repair("k", map(vec![("k", list(vec![]))])), Value::Null);
        assert_eq!(repair("k", map(vec![("k", s("oops"))])), Value::Null);
    }

    #[test]
    fn test_clean_values_are_returned_unchanged() {
        let value = map(vec![("title", s("t")), ("items", list(vec![s("a"), s("b")]))]);
        assert_eq!(repair("k", value.clone()), value);
        assert_eq!(repair("k", s("plain")), s("plain"));
    }

    #[test]
    fn test_repair_is_idempotent() {
        let samples = vec![
            self_nested("k", s("A"), s("B")),
            self_nested("k", s("A"), self_nested("k", s("B"), list(vec![s("C")]))),
            large_blob(),
            map(vec![("title", s("t"))]),
            Value::Int(5),
        ];
        for value in samples {
            let once = repair("k", value);
            assert_eq!(repair("k", once.clone()), once);
            assert!(!is_affected("k", &once));
        }
    }

    #[test]
    fn test_record_nested_hundreds_of_times_is_repaired() {
        let clean = map(vec![("title", s("kept"))]);
        let mut value = clean.clone();
        for _ in 0..300 {
            value = self_nested("k", s("stale"), value);
        }
        let record = MetadataRecord::new(1, 1, "k", &serialize(&value));

        assert!(record.decode().is_ok());
        assert!(crate::detect::record_is_affected(&record));
        assert_eq!(planned_repair(&record), Some(clean));
    }

    fn stored(store: &FakeStore, key: &str, value: &Value) -> MetadataRecord {
        let id = store.insert(1, key, &serialize(value));
        store.records.borrow()[&id].clone()
    }

    #[test]
    fn test_maybe_update_meta_writes_encoded_repair() {
        let store = FakeStore::with_owners(1);
        let record = stored(
            &store,
            "k",
            &self_nested("k", s("old"), map(vec![("title", s("t"))])),
        );

        assert!(maybe_update_meta(&store, &record).unwrap());
        assert_eq!(store.value_of(record.id), r#"a:1:{s:5:"title";s:1:"t";}"#);
        assert_eq!(store.updates.get(), 1);
    }

    #[test]
    fn test_maybe_update_meta_stores_scalars_plainly() {
        let store = FakeStore::with_owners(1);
        let record = stored(&store, "k", &self_nested("k", s("A"), s("B")));
        assert!(maybe_update_meta(&store, &record).unwrap());
        assert_eq!(store.value_of(record.id), "B");

        let blob = stored(&store, "k", &large_blob());
        assert!(maybe_update_meta(&store, &blob).unwrap());
        assert_eq!(store.value_of(blob.id), "");
    }

    #[test]
    fn test_maybe_update_meta_skips_clean_and_malformed_records() {
        let store = FakeStore::with_owners(1);
        let clean = stored(&store, "k", &map(vec![("title", s("t"))]));
        let malformed_id = store.insert(1, "k", r#"a:1:{s:1:"k";"#);
        let malformed = store.records.borrow()[&malformed_id].clone();

        assert!(!maybe_update_meta(&store, &clean).unwrap());
        assert!(!maybe_update_meta(&store, &malformed).unwrap());
        assert_eq!(store.updates.get(), 0);
        assert_eq!(store.value_of(malformed_id), r#"a:1:{s:1:"k";"#);
    }

    #[test]
    fn test_maybe_update_meta_propagates_write_failures() {
        let store = FakeStore::with_owners(1);
        let record = stored(&store, "k", &self_nested("k", s("A"), s("B")));
        store.fail_updates.set(true);
        assert!(maybe_update_meta(&store, &record).is_err());
    }
}
