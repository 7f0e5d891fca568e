//! Store for hinted-handoff hints held by a stand-in node.
//!
//! Each hint is a write accepted on behalf of a node that was unreachable.
//! Hints live in their own `StorageEngine` (WAL-backed or in-memory), keyed
//! as `"<hex(target)>:<key>"`. The record's single version carries a JSON
//! [`HintPayload`] with the hinted versions and delivery bookkeeping.

use crate::conflict::merged_context;
use ringkv_common::{reconcile_versions, NodeId, VersionedValue};
use ringkv_storage::{FsyncPolicy, StorageEngine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum HintStoreError {
    #[error("storage error: {0}")]
    Storage(#[from] ringkv_storage::StorageError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A write that still has to reach `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    pub target: NodeId,
    pub key: String,
    /// Non-dominated hinted versions for the key.
    pub versions: Vec<VersionedValue>,
    pub recorded_at_ms: u64,
    /// Failed delivery attempts so far.
    pub attempts: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct HintPayload {
    versions: Vec<VersionedValue>,
    recorded_at_ms: u64,
    #[serde(default)]
    attempts: u32,
}

#[derive(Debug)]
pub struct HintStore {
    engine: StorageEngine,
}

impl HintStore {
    /// Open or create a durable hint store at the given directory.
    pub fn open(hint_dir: &Path, fsync: FsyncPolicy) -> Result<Self, HintStoreError> {
        std::fs::create_dir_all(hint_dir)?;
        let engine = StorageEngine::open(hint_dir, fsync)?;
        Ok(Self { engine })
    }

    pub fn in_memory() -> Self {
        Self {
            engine: StorageEngine::in_memory(),
        }
    }

    /// Record `value` as a hint for `target`. Folds into any hint already
    /// pending for the same key, keeping its attempt count.
    pub fn store_hint(
        &mut self,
        target: &NodeId,
        key: &str,
        value: VersionedValue,
        now_ms: u64,
    ) -> Result<(), HintStoreError> {
        let compound_key = hint_key(target, key);
        let payload = match self.load(&compound_key) {
            Some(mut existing) => {
                existing.versions.push(value);
                existing.versions = reconcile_versions(existing.versions);
                existing
            }
            None => HintPayload {
                versions: vec![value],
                recorded_at_ms: now_ms,
                attempts: 0,
            },
        };
        self.save(&compound_key, &payload)
    }

    /// All hints destined for `target`.
    pub fn hints_for_node(&self, target: &NodeId) -> Vec<Hint> {
        let prefix = format!("{}:", hex::encode(target.as_str()));
        self.engine
            .keys_with_prefix(&prefix)
            .into_iter()
            .filter_map(|compound_key| {
                let payload = self.load(&compound_key)?;
                let key = compound_key.strip_prefix(&prefix)?.to_string();
                Some(Hint {
                    target: target.clone(),
                    key,
                    versions: payload.versions,
                    recorded_at_ms: payload.recorded_at_ms,
                    attempts: payload.attempts,
                })
            })
            .collect()
    }

    /// Every hinted version held for `key`, whatever its target.
    pub fn hinted_versions(&self, key: &str) -> Vec<VersionedValue> {
        let mut out = Vec::new();
        for compound_key in self.engine.keys() {
            let matches = parse_hint_key(&compound_key).is_some_and(|(_, k)| k == key);
            if !matches {
                continue;
            }
            if let Some(payload) = self.load(&compound_key) {
                out.extend(payload.versions);
            }
        }
        reconcile_versions(out)
    }

    /// Count a failed delivery. Returns the new attempt count, or `None` if
    /// no such hint is pending.
    pub fn record_failure(
        &mut self,
        target: &NodeId,
        key: &str,
    ) -> Result<Option<u32>, HintStoreError> {
        let compound_key = hint_key(target, key);
        let Some(mut payload) = self.load(&compound_key) else {
            return Ok(None);
        };
        payload.attempts += 1;
        self.save(&compound_key, &payload)?;
        Ok(Some(payload.attempts))
    }

    /// Remove the hinted versions covered by `settled` (equal to, or
    /// dominated by, one of them). Versions merged in after `settled` was
    /// read stay pending. Returns `true` once nothing is left for the key.
    pub fn remove_versions(
        &mut self,
        target: &NodeId,
        key: &str,
        settled: &[VersionedValue],
    ) -> Result<bool, HintStoreError> {
        let compound_key = hint_key(target, key);
        let Some(mut payload) = self.load(&compound_key) else {
            return Ok(true);
        };
        payload
            .versions
            .retain(|v| !settled.iter().any(|s| s == v || s.vclock.dominates(&v.vclock)));
        if payload.versions.is_empty() {
            self.engine.remove(&compound_key)?;
            return Ok(true);
        }
        self.save(&compound_key, &payload)?;
        Ok(false)
    }

    /// Every target with at least one pending hint.
    pub fn all_target_nodes(&self) -> BTreeSet<NodeId> {
        self.engine
            .keys()
            .iter()
            .filter_map(|k| parse_hint_key(k).map(|(target, _)| target))
            .collect()
    }

    /// Total number of pending hints.
    pub fn hint_count(&self) -> usize {
        self.engine.key_count()
    }

    pub fn sync(&mut self) -> Result<(), HintStoreError> {
        self.engine.sync()?;
        Ok(())
    }

    fn load(&self, compound_key: &str) -> Option<HintPayload> {
        let record = self.engine.get(compound_key)?.into_iter().next()?;
        match serde_json::from_slice(&record.value) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::warn!(key = compound_key, error = %e, "undecodable hint record");
                None
            }
        }
    }

    fn save(&mut self, compound_key: &str, payload: &HintPayload) -> Result<(), HintStoreError> {
        let bytes = serde_json::to_vec(payload)?;
        let record = VersionedValue::new(
            bytes,
            merged_context(&payload.versions),
            payload.recorded_at_ms,
        );
        self.engine.replace(compound_key, vec![record])?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Key encoding
// ---------------------------------------------------------------------------

/// `"<hex(target)>:<key>"`. Hex keeps ':' inside node ids unambiguous.
fn hint_key(target: &NodeId, key: &str) -> String {
    format!("{}:{}", hex::encode(target.as_str()), key)
}

fn parse_hint_key(compound_key: &str) -> Option<(NodeId, &str)> {
    let (target_hex, key) = compound_key.split_once(':')?;
    let bytes = hex::decode(target_hex).ok()?;
    let target = String::from_utf8(bytes).ok()?;
    Some((NodeId::new(target), key))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
