//! Configuration schema and loader for ringkv clusters.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Node that coordinates client requests in this process.
    pub node_id: String,

    /// Every physical node in the cluster (including `node_id`).
    pub nodes: Vec<String>,

    #[serde(default)]
    pub ring: RingConfig,

    /// Quorum and replication settings.
    #[serde(default)]
    pub kv: KvConfig,

    #[serde(default)]
    pub hints: HintsConfig,

    #[serde(default)]
    pub repair: RepairConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// Ring positions registered per physical node.
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: default_virtual_nodes(),
        }
    }
}

/// How concurrent siblings are surfaced to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Return every concurrent sibling with a merged context.
    #[default]
    Siblings,
    /// Pick one sibling by timestamp, then by canonical vector.
    LastWriterWins,
}

/// When read repair runs relative to the client's read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadRepair {
    Disabled,
    /// Pushed from a spawned task after the read returns.
    #[default]
    Background,
    /// Awaited before the read returns.
    Inline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// Replication factor (N).
    #[serde(default = "default_n")]
    pub n: usize,

    /// Default read quorum (R).
    #[serde(default = "default_r")]
    pub r: usize,

    /// Default write quorum (W).
    #[serde(default = "default_w")]
    pub w: usize,

    /// Read timeout in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Write timeout in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub write_timeout_ms: u64,

    #[serde(default)]
    pub read_repair: ReadRepair,

    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Substitute unreachable primaries with stand-ins from the preference list.
    #[serde(default = "default_true")]
    pub sloppy_quorum: bool,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            n: default_n(),
            r: default_r(),
            w: default_w(),
            read_timeout_ms: default_rpc_timeout_ms(),
            write_timeout_ms: default_rpc_timeout_ms(),
            read_repair: ReadRepair::default(),
            conflict_policy: ConflictPolicy::default(),
            sloppy_quorum: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HintsConfig {
    /// Run the periodic hint delivery task.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Hint delivery check interval in seconds.
    #[serde(default = "default_hint_delivery_interval_secs")]
    pub delivery_interval_secs: u64,

    /// Maximum hints to attempt delivery per cycle.
    #[serde(default = "default_max_hints_per_cycle")]
    pub max_hints_per_cycle: usize,

    /// Drop a hint after this many failed deliveries. `None` keeps it forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for HintsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delivery_interval_secs: default_hint_delivery_interval_secs(),
            max_hints_per_cycle: default_max_hints_per_cycle(),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Seconds between anti-entropy passes. `0` disables the task.
    #[serde(default = "default_anti_entropy_interval_secs")]
    pub anti_entropy_interval_secs: u64,

    /// Digest tree depth; the tree has `2^depth` leaf buckets.
    #[serde(default = "default_digest_depth")]
    pub digest_depth: u8,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            anti_entropy_interval_secs: default_anti_entropy_interval_secs(),
            digest_depth: default_digest_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for per-node WAL and hint files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,

    /// How often WALs are fsynced under the "batch" policy.
    #[serde(default = "default_batch_sync_interval_ms")]
    pub batch_sync_interval_ms: u64,

    /// Back stores with a WAL under `data_dir`; otherwise keep them in memory.
    #[serde(default)]
    pub durable: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: default_fsync(),
            batch_sync_interval_ms: default_batch_sync_interval_ms(),
            durable: false,
        }
    }
}

/// Accepted `storage.fsync` values.
pub const FSYNC_POLICIES: [&str; 3] = ["always", "batch", "none"];

/// Deepest digest tree accepted (`2^16` buckets).
pub const MAX_DIGEST_DEPTH: u8 = 16;

// --- Defaults ---

fn default_virtual_nodes() -> usize {
    64
}
fn default_rpc_timeout_ms() -> u64 {
    5000
}
fn default_n() -> usize {
    3
}
fn default_r() -> usize {
    2
}
fn default_w() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_hint_delivery_interval_secs() -> u64 {
    30
}
fn default_max_hints_per_cycle() -> usize {
    100
}
fn default_anti_entropy_interval_secs() -> u64 {
    60
}
fn default_digest_depth() -> u8 {
    8
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_fsync() -> String {
    "always".to_string()
}
fn default_batch_sync_interval_ms() -> u64 {
    50
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ClusterConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Invalid("nodes must not be empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if node.is_empty() {
                return Err(ConfigError::Invalid("nodes must not contain empty ids".into()));
            }
            if !seen.insert(node.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate node id {node:?}")));
            }
        }
        if !seen.contains(self.node_id.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "node_id {:?} is not listed in nodes",
                self.node_id
            )));
        }
        if self.ring.virtual_nodes == 0 {
            return Err(ConfigError::Invalid("ring.virtual_nodes must be > 0".into()));
        }
        if self.kv.n == 0 {
            return Err(ConfigError::Invalid("kv.n must be > 0".into()));
        }
        if self.kv.n > self.nodes.len() {
            return Err(ConfigError::Invalid(format!(
                "kv.n ({}) must be <= number of nodes ({})",
                self.kv.n,
                self.nodes.len()
            )));
        }
        if self.kv.r == 0 || self.kv.r > self.kv.n {
            return Err(ConfigError::Invalid(format!(
                "kv.r ({}) must be in 1..=kv.n ({})",
                self.kv.r, self.kv.n
            )));
        }
        if self.kv.w == 0 || self.kv.w > self.kv.n {
            return Err(ConfigError::Invalid(format!(
                "kv.w ({}) must be in 1..=kv.n ({})",
                self.kv.w, self.kv.n
            )));
        }
        if self.repair.digest_depth > MAX_DIGEST_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "repair.digest_depth ({}) must be <= {}",
                self.repair.digest_depth, MAX_DIGEST_DEPTH
            )));
        }
        if self.hints.max_attempts == Some(0) {
            return Err(ConfigError::Invalid("hints.max_attempts must be > 0".into()));
        }
        let fsync = self.storage.fsync.to_lowercase();
        if !FSYNC_POLICIES.contains(&fsync.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "storage.fsync {:?} must be one of {:?}",
                self.storage.fsync, FSYNC_POLICIES
            )));
        }
        if fsync == "batch" && self.storage.batch_sync_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "storage.batch_sync_interval_ms must be > 0 with batch fsync".into(),
            ));
        }
        Ok(())
    }

    /// True when every read quorum intersects every write quorum.
    pub fn quorums_overlap(&self) -> bool {
        self.kv.r + self.kv.w > self.kv.n
    }
}

/// Load a `ClusterConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<ClusterConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `ClusterConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<ClusterConfig, ConfigError> {
    let config: ClusterConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
