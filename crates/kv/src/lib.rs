//! Dynamo-style replicated KV layer.
//!
//! Provides: consistent-hash placement (N replicas per key), tunable quorums
//! (R/W), version-vector conflict detection with a configurable policy,
//! sloppy quorum with hinted handoff, read repair, Merkle-digest
//! anti-entropy and read-your-own-writes sessions. Every replica call goes
//! through the [`transport::Transport`] seam; [`cluster::LocalCluster`] wires
//! a full cluster in one process.

pub mod chaos;
pub mod clock;
pub mod cluster;
pub mod conflict;
pub mod coordinator;
pub mod hint_delivery;
pub mod hint_store;
pub mod merkle;
pub mod placement;
pub mod repair;
pub mod replica;
pub mod session;
pub mod sloppy;
pub mod store;
pub mod transport;

pub use cluster::{ClusterError, LocalCluster};
pub use conflict::{ConflictPolicy, ReadValue};
pub use coordinator::{Coordinator, KvError, PutAck, QuorumConfig, ReadRepair};
pub use repair::{RepairEngine, RepairError, RepairReport};
pub use session::Session;
