//! Versioned values and sibling reconciliation.

use crate::version_vector::{VersionOrder, VersionVector};
use serde::{Deserialize, Serialize};

/// A single version of a key: payload, causal vector and wall-clock stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// Value bytes (empty for tombstones).
    pub value: Vec<u8>,
    pub vclock: VersionVector,
    /// Wall-clock time the coordinator stamped the write (millis since epoch).
    pub timestamp_ms: u64,
    /// Delete marker.
    #[serde(default)]
    pub tombstone: bool,
}

impl VersionedValue {
    pub fn new(value: Vec<u8>, vclock: VersionVector, timestamp_ms: u64) -> Self {
        Self {
            value,
            vclock,
            timestamp_ms,
            tombstone: false,
        }
    }

    pub fn tombstone(vclock: VersionVector, timestamp_ms: u64) -> Self {
        Self {
            value: Vec::new(),
            vclock,
            timestamp_ms,
            tombstone: true,
        }
    }
}

/// Filter a set of versions down to the non-dominated ones.
///
/// Dominated versions are dropped, duplicates (equal vectors) collapse to the
/// first occurrence, and concurrent versions are all kept as siblings.
pub fn reconcile_versions(versions: Vec<VersionedValue>) -> Vec<VersionedValue> {
    if versions.len() <= 1 {
        return versions;
    }

    let mut result: Vec<VersionedValue> = Vec::new();

    for candidate in versions {
        let mut dominated = false;
        let mut to_remove = Vec::new();

        for (i, existing) in result.iter().enumerate() {
            match candidate.vclock.compare(&existing.vclock) {
                VersionOrder::DominatedBy | VersionOrder::Equal => {
                    dominated = true;
                    break;
                }
                VersionOrder::Dominates => to_remove.push(i),
                VersionOrder::Concurrent => {}
            }
        }

        if !dominated {
            for i in to_remove.into_iter().rev() {
                result.remove(i);
            }
            result.push(candidate);
        }
    }

    result
}
