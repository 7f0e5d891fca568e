//! ringkv-common: shared types for the ringkv workspace.
//!
//! Provides the `NodeId` and ring `Token` types used for placement, plus
//! the causal versioning primitives (`VersionVector`, `VersionedValue`)
//! shared by the storage engine and the replication layer.

pub mod version_vector;
pub mod versioned;

pub use version_vector::{VersionOrder, VersionVector};
pub use versioned::{reconcile_versions, VersionedValue};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// Identifier of a physical node in the cluster.
///
/// Opaque string (e.g. `"A"` or `"node-3"`). Doubles as the component key
/// inside version vectors, so it must be stable across restarts.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// A position on the 64-bit consistent-hashing ring.
pub type Token = u64;

/// Hash arbitrary bytes onto the ring: the first 8 bytes of SHA-1, big-endian.
pub fn token_for(data: &[u8]) -> Token {
    let hash = Sha1::digest(data);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash[..8]);
    Token::from_be_bytes(bytes)
}

/// Ring token of a key.
pub fn key_token(key: &str) -> Token {
    token_for(key.as_bytes())
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
