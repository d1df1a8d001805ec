//! In-memory key-value map: the state machine the log is applied to.

use std::collections::BTreeMap;

/// Key-value map owned by a single node's applier.
///
/// Only the consensus worker touches it, so there is no interior locking.
/// `BTreeMap` keeps iteration order stable for status output and for
/// comparing replicas in tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a key-value pair, overwriting any existing value.
    pub fn put(&mut self, key: String, value: String) {
        self.data.insert(key, value);
    }

    /// Removes a key. Returns whether the key was present.
    pub fn remove(&mut self, key: &str) -> bool {
        self.data.remove(key).is_some()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Returns a copy of all key-value pairs.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }
}
