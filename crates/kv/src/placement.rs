//! Key placement: maps a key to its N replica nodes on a consistent-hash ring.

use ringkv_common::{key_token, token_for, NodeId, Token};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    #[error("not enough nodes on the ring: need {needed}, have {available}")]
    Unavailable { needed: usize, available: usize },
}

/// Decides which nodes own a key.
pub trait PlacementOracle: Send + Sync + std::fmt::Debug + 'static {
    /// The first `n` distinct nodes clockwise from the key.
    fn replicas_for(&self, key: &str, n: usize) -> Result<Vec<NodeId>, PlacementError>;

    /// Every distinct node in clockwise order from the key.
    fn preference_list(&self, key: &str) -> Vec<NodeId>;

    /// All physical nodes, sorted.
    fn nodes(&self) -> Vec<NodeId>;
}

/// Consistent-hash ring with virtual nodes.
///
/// Each physical node owns `virtual_nodes` positions at `token("{node}-{i}")`.
/// A key is owned by the first position strictly after its token, wrapping.
#[derive(Debug)]
pub struct HashRing {
    virtual_nodes: usize,
    state: RwLock<RingState>,
}

#[derive(Debug, Default)]
struct RingState {
    tokens: BTreeMap<Token, NodeId>,
    nodes: BTreeSet<NodeId>,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            state: RwLock::new(RingState::default()),
        }
    }

    pub fn with_nodes<I, N>(virtual_nodes: usize, nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        let ring = Self::new(virtual_nodes);
        for node in nodes {
            ring.add_node(node.into());
        }
        ring
    }

    /// Register a node. Returns `false` if it was already present.
    pub fn add_node(&self, node: NodeId) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !state.nodes.insert(node.clone()) {
            return false;
        }
        for i in 0..self.virtual_nodes {
            let token = virtual_token(&node, i);
            state.tokens.insert(token, node.clone());
        }
        tracing::debug!(%node, vnodes = self.virtual_nodes, "node added to ring");
        true
    }

    /// Remove a node and all of its positions. Returns `false` if absent.
    pub fn remove_node(&self, node: &NodeId) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !state.nodes.remove(node) {
            return false;
        }
        state.tokens.retain(|_, owner| owner != node);
        tracing::debug!(%node, "node removed from ring");
        true
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.nodes.contains(node)
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Number of ring positions (physical nodes times virtual nodes, minus collisions).
    pub fn token_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.tokens.len()
    }

    /// Walk clockwise from `token`, collecting up to `limit` distinct nodes.
    fn walk(&self, token: Token, limit: usize) -> Vec<NodeId> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let limit = limit.min(state.nodes.len());
        let mut out: Vec<NodeId> = Vec::with_capacity(limit);
        if limit == 0 {
            return out;
        }

        let after = state.tokens.range((Excluded(token), Unbounded));
        let wrapped = state.tokens.range(..=token);
        for (_, node) in after.chain(wrapped) {
            if !out.contains(node) {
                out.push(node.clone());
                if out.len() == limit {
                    break;
                }
            }
        }
        out
    }
}

impl PlacementOracle for HashRing {
    fn replicas_for(&self, key: &str, n: usize) -> Result<Vec<NodeId>, PlacementError> {
        let replicas = self.walk(key_token(key), n);
        if replicas.len() < n {
            return Err(PlacementError::Unavailable {
                needed: n,
                available: replicas.len(),
            });
        }
        Ok(replicas)
    }

    fn preference_list(&self, key: &str) -> Vec<NodeId> {
        self.walk(key_token(key), usize::MAX)
    }

    fn nodes(&self) -> Vec<NodeId> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.nodes.iter().cloned().collect()
    }
}

fn virtual_token(node: &NodeId, index: usize) -> Token {
    token_for(format!("{}-{}", node, index).as_bytes())
}
