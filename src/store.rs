//! Narrow interfaces to the backing store. Every component receives the store
//! it works on; nothing looks up a global connection.

use crate::error::Result;
use crate::serialized::{DecodeError, Value, maybe_unserialize};

/// One row of the post meta table as stored: `value` is the raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MetadataRecord {
    pub(crate) id: u64,
    pub(crate) owner_id: u64,
    pub(crate) key: String,
    pub(crate) value: String,
    /// Key or value bytes were not UTF-8; `key` and `value` hold a lossy copy
    /// and the record is never decoded or rewritten.
    pub(crate) binary: bool,
}

impl MetadataRecord {
    pub(crate) fn new(id: u64, owner_id: u64, key: &str, value: &str) -> Self {
        Self {
            id,
            owner_id,
            key: key.to_string(),
            value: value.to_string(),
            binary: false,
        }
    }

    /// Decode the stored value. The record itself is left untouched.
    pub(crate) fn decode(&self) -> Result<Value, DecodeError> {
        if self.binary {
            return Err(DecodeError::InvalidUtf8(0));
        }
        maybe_unserialize(&self.value)
    }
}

pub(crate) trait MetaStore {
    /// Records whose owner id lies in `(low, high]`, ordered by record id.
    fn range_query(&self, low: u64, high: u64) -> Result<Vec<MetadataRecord>>;

    fn get_by_id(&self, id: u64) -> Result<Option<MetadataRecord>>;

    /// Overwrite the stored value of a single record.
    fn update_value(&self, id: u64, value: &str) -> Result<()>;

    /// Number of owning entities (posts).
    fn count_owners(&self) -> Result<u64>;
}

/// Process-wide named settings (the WordPress options table).
pub(crate) trait OptionStore {
    fn get_option(&self, name: &str) -> Result<Option<String>>;

    fn set_option(&self, name: &str, value: &str) -> Result<()>;

    /// Atomically flip a boolean option from unset/false to true. Returns
    /// `false` when it was already set in the sense of [`flag_is_set`].
    fn try_set_flag(&self, name: &str) -> Result<bool>;
}

// Option values follow `update_option` conventions: true is "1", false is "".

pub(crate) const OPTION_TRUE: &str = "1";
pub(crate) const OPTION_FALSE: &str = "";

/// PHP truthiness of a stored option string: everything but `""` and `"0"`.
pub(crate) fn flag_is_set(value: &str) -> bool {
    !value.is_empty() && value != "0"
}

pub(crate) fn option_flag<S: OptionStore + ?Sized>(store: &S, name: &str) -> Result<bool> {
    Ok(store.get_option(name)?.is_some_and(|v| flag_is_set(&v)))
}

pub(crate) fn option_u64<S: OptionStore + ?Sized>(store: &S, name: &str) -> Result<u64> {
    Ok(store
        .get_option(name)?
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0))
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory store for exercising components without SQLite.

    use std::cell::{Cell, RefCell};
    use std::collections::BTreeMap;

    use super::*;
    use crate::error::FixerError;

    #[derive(Default)]
    pub(crate) struct FakeStore {
        pub(crate) records: RefCell<BTreeMap<u64, MetadataRecord>>,
        pub(crate) options: RefCell<BTreeMap<String, String>>,
        pub(crate) owners: Cell<u64>,
        pub(crate) updates: Cell<usize>,
        pub(crate) fail_queries: Cell<bool>,
        pub(crate) fail_updates: Cell<bool>,
    }

    impl FakeStore {
        pub(crate) fn with_owners(owners: u64) -> Self {
            let store = Self::default();
            store.owners.set(owners);
            store
        }

        pub(crate) fn insert(&self, owner_id: u64, key: &str, value: &str) -> u64 {
            let mut records = self.records.borrow_mut();
            let id = records.keys().next_back().copied().unwrap_or(0) + 1;
            records.insert(id, MetadataRecord::new(id, owner_id, key, value));
            id
        }

        pub(crate) fn value_of(&self, id: u64) -> String {
            self.records.borrow()[&id].value.clone()
        }

        fn failure(what: &str) -> FixerError {
            FixerError::Io(std::io::Error::other(format!("{what} failed")))
        }
    }

    impl MetaStore for FakeStore {
        fn range_query(&self, low: u64, high: u64) -> Result<Vec<MetadataRecord>> {
            if self.fail_queries.get() {
                return Err(Self::failure("range query"));
            }
            Ok(self
                .records
                .borrow()
                .values()
                .filter(|r| r.owner_id > low && r.owner_id <= high)
                .cloned()
                .collect())
        }

        fn get_by_id(&self, id: u64) -> Result<Option<MetadataRecord>> {
            Ok(self.records.borrow().get(&id).cloned())
        }

        fn update_value(&self, id: u64, value: &str) -> Result<()> {
            if self.fail_updates.get() {
                return Err(Self::failure("update"));
            }
            if let Some(record) = self.records.borrow_mut().get_mut(&id) {
                record.value = value.to_string();
            }
            self.updates.set(self.updates.get() + 1);
            Ok(())
        }

        fn count_owners(&self) -> Result<u64> {
            Ok(self.owners.get())
        }
    }

    impl OptionStore for FakeStore {
        fn get_option(&self, name: &str) -> Result<Option<String>> {
            Ok(self.options.borrow().get(name).cloned())
        }

        fn set_option(&self, name: &str, value: &str) -> Result<()> {
            self.options
                .borrow_mut()
                .insert(name.to_string(), value.to_string());
            Ok(())
        }

        fn try_set_flag(&self, name: &str) -> Result<bool> {
            let mut options = self.options.borrow_mut();
            if options.get(name).is_some_and(|v| flag_is_set(v)) {
                return Ok(false);
            }
            options.insert(name.to_string(), OPTION_TRUE.to_string());
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeStore;
    use super::*;

    #[test]
    fn test_decode_leaves_record_untouched() {
        let record = MetadataRecord::new(1, 2, "gallery", r#"a:1:{i:0;s:1:"x";}"#);
        let before = record.clone();
        assert!(record.decode().unwrap().entries().is_some());
        assert_eq!(record, before);
    }

    #[test]
    fn test_binary_record_never_decodes() {
        let mut record = MetadataRecord::new(1, 2, "k", "i:5;");
        assert_eq!(record.decode(), Ok(Value::Int(5)));
        record.binary = true;
        assert_eq!(record.decode(), Err(DecodeError::InvalidUtf8(0)));
    }

    #[test]
    fn test_option_helpers_follow_wordpress_conventions() {
        let store = FakeStore::default();
        assert!(!option_flag(&store, "flag").unwrap());
        assert_eq!(option_u64(&store, "offset").unwrap(), 0);

        store.set_option("flag", OPTION_TRUE).unwrap();
        store.set_option("offset", "3000").unwrap();
        assert!(option_flag(&store, "flag").unwrap());
        assert_eq!(option_u64(&store, "offset").unwrap(), 3000);

        store.set_option("flag", OPTION_FALSE).unwrap();
        store.set_option("offset", "garbage").unwrap();
        assert!(!option_flag(&store, "flag").unwrap());
        assert_eq!(option_u64(&store, "offset").unwrap(), 0);

        store.set_option("flag", "true").unwrap();
        assert!(option_flag(&store, "flag").unwrap());
        assert!(!store.try_set_flag("flag").unwrap());
        store.set_option("flag", "0").unwrap();
        assert!(!option_flag(&store, "flag").unwrap());
        assert!(store.try_set_flag("flag").unwrap());
    }
}
