//! In-memory table for fast key lookups.
//!
//! Each key holds its full sibling set. The memtable itself applies no
//! version-vector logic: callers hand it the already-reconciled set.

use crate::record::StorageRecord;
use ringkv_common::VersionedValue;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Memtable {
    /// key -> current sibling set (never empty).
    data: HashMap<String, Vec<VersionedValue>>,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sibling set for a key, `None` if absent.
    pub fn get(&self, key: &str) -> Option<Vec<VersionedValue>> {
        self.data.get(key).cloned()
    }

    /// Replace a key's sibling set. An empty set removes the key.
    pub fn replace(&mut self, key: String, versions: Vec<VersionedValue>) {
        if versions.is_empty() {
            self.data.remove(&key);
        } else {
            self.data.insert(key, versions);
        }
    }

    /// Apply a WAL record (used during replay).
    pub fn apply(&mut self, record: StorageRecord) {
        self.replace(record.key, record.versions);
    }

    pub fn remove(&mut self, key: &str) {
        self.data.remove(key);
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total versions across all keys (siblings counted individually).
    pub fn total_versions(&self) -> usize {
        self.data.values().map(|v| v.len()).sum()
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringkv_common::VersionVector;

    fn version(value: &str, node: &str, counter: u64) -> VersionedValue {
        VersionedValue::new(
            value.as_bytes().to_vec(),
            VersionVector::from_entries([(node, counter)]),
            0,
        )
    }

    #[test]
    fn test_replace_and_get() {
        let mut mt = Memtable::new();
        mt.replace("k1".into(), vec![version("v1", "a", 1)]);
        let got = mt.get("k1").unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value, b"v1");
        assert!(mt.get("missing").is_none());
    }

    #[test]
    fn test_replace_keeps_siblings() {
        let mut mt = Memtable::new();
        mt.replace(
            "k1".into(),
            vec![version("from-a", "a", 1), version("from-b", "b", 1)],
        );
        assert_eq!(mt.get("k1").unwrap().len(), 2);
        assert_eq!(mt.total_versions(), 2);
        assert_eq!(mt.len(), 1);
    }

    #[test]
    fn test_empty_replace_removes() {
        let mut mt = Memtable::new();
        mt.replace("k1".into(), vec![version("v1", "a", 1)]);
        mt.apply(StorageRecord::removal("k1".into()));
        assert!(mt.is_empty());
    }

    #[test]
    fn test_keys_with_prefix() {
        let mut mt = Memtable::new();
        mt.replace("user:1".into(), vec![version("alice", "a", 1)]);
        mt.replace("user:2".into(), vec![version("bob", "a", 1)]);
        mt.replace("order:1".into(), vec![version("item", "a", 1)]);

        let mut user_keys = mt.keys_with_prefix("user:");
        user_keys.sort();
        assert_eq!(user_keys, vec!["user:1", "user:2"]);
        assert_eq!(mt.keys_with_prefix("nope:").len(), 0);
        assert_eq!(mt.keys().len(), 3);
    }
}
