//! Version vectors for causal versioning of keys.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A version vector: maps node identifiers to monotonic counters.
///
/// Entries are kept in a `BTreeMap` so iteration order is canonical, which
/// lets two replicas hash identical vectors to identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    entries: BTreeMap<NodeId, u64>,
}

/// Causal relationship between two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrder {
    Equal,
    Dominates,
    DominatedBy,
    Concurrent,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(node, counter)` pairs. Zero counters are dropped.
    pub fn from_entries<I, N>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, u64)>,
        N: Into<NodeId>,
    {
        Self {
            entries: entries
                .into_iter()
                .filter(|(_, c)| *c > 0)
                .map(|(n, c)| (n.into(), c))
                .collect(),
        }
    }

    /// Counter for a node (0 if absent).
    pub fn get(&self, node: &NodeId) -> u64 {
        self.entries.get(node).copied().unwrap_or(0)
    }

    /// Raise this node's own counter by one.
    pub fn increment(&mut self, node: &NodeId) {
        *self.entries.entry(node.clone()).or_insert(0) += 1;
    }

    /// Pointwise maximum over the union of both vectors' nodes.
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.entries.clone();
        for (node, &counter) in &other.entries {
            let entry = merged.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
        Self { entries: merged }
    }

    /// Compare two vectors.
    pub fn compare(&self, other: &Self) -> VersionOrder {
        let mut self_gte = true;
        let mut other_gte = true;

        for (node, &sv) in &self.entries {
            let ov = other.get(node);
            if sv < ov {
                self_gte = false;
            }
            if ov < sv {
                other_gte = false;
            }
        }
        for (node, &ov) in &other.entries {
            if !self.entries.contains_key(node) && ov > 0 {
                self_gte = false;
            }
        }

        match (self_gte, other_gte) {
            (true, true) => VersionOrder::Equal,
            (true, false) => VersionOrder::Dominates,
            (false, true) => VersionOrder::DominatedBy,
            (false, false) => VersionOrder::Concurrent,
        }
    }

    /// `self >= other` on every node and `self != other`.
    pub fn dominates(&self, other: &Self) -> bool {
        self.compare(other) == VersionOrder::Dominates
    }

    /// Neither dominates and they are unequal.
    pub fn concurrent_with(&self, other: &Self) -> bool {
        self.compare(other) == VersionOrder::Concurrent
    }

    /// Entries in canonical (node-sorted) order.
    pub fn entries(&self) -> impl Iterator<Item = (&NodeId, u64)> {
        self.entries.iter().map(|(n, c)| (n, *c))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical `(node, counter)` list, used as a deterministic tie-break key.
    pub fn canonical(&self) -> Vec<(&str, u64)> {
        self.entries.iter().map(|(n, c)| (n.as_str(), *c)).collect()
    }
}
