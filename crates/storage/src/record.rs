//! WAL record format.

use ringkv_common::VersionedValue;
use serde::{Deserialize, Serialize};

/// The full state of one key after a mutation.
///
/// An empty `versions` list records a removal of the key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageRecord {
    pub key: String,
    pub versions: Vec<VersionedValue>,
}

impl StorageRecord {
    pub fn new(key: String, versions: Vec<VersionedValue>) -> Self {
        Self { key, versions }
    }

    /// A record that removes the key entirely.
    pub fn removal(key: String) -> Self {
        Self {
            key,
            versions: Vec::new(),
        }
    }

    pub fn is_removal(&self) -> bool {
        self.versions.is_empty()
    }
}
