//! Fixed-shape Merkle digest for anti-entropy.
//!
//! Keys are bucketed by the top `depth` bits of their ring token, giving
//! `2^depth` leaf buckets. Leaves hash the sorted `(key, version_set_hash)`
//! pairs of their bucket; internal nodes hash their two children. Because
//! both sides of a comparison build the same shape, two digests can be walked
//! in lockstep from the root to find the diverging buckets.
//!
//! Data structure only: no RPCs, no background tasks.

use ringkv_common::{key_token, VersionedValue};
use sha1::{Digest, Sha1};

/// SHA-1 hash output (20 bytes).
pub type Hash = [u8; 20];

const EMPTY: Hash = [0u8; 20];

/// Binary hash tree over key buckets, stored as an index arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleDigest {
    depth: u8,
    nodes: Vec<DigestNode>,
    root: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DigestNode {
    hash: Hash,
    /// `Some(bucket)` for leaves.
    bucket: Option<usize>,
    left: Option<usize>,
    right: Option<usize>,
}

impl MerkleDigest {
    /// Build a digest over `(key, version_set_hash)` entries. Order of
    /// `entries` does not matter.
    pub fn build(depth: u8, entries: &[(String, Hash)]) -> Self {
        let bucket_count = 1usize << depth;
        let mut buckets: Vec<Vec<(&str, &Hash)>> = vec![Vec::new(); bucket_count];
        for (key, hash) in entries {
            buckets[bucket_of(key, depth)].push((key.as_str(), hash));
        }

        let mut nodes: Vec<DigestNode> = Vec::with_capacity(bucket_count * 2 - 1);

        let mut level: Vec<usize> = buckets
            .iter_mut()
            .enumerate()
            .map(|(i, bucket)| {
                bucket.sort_unstable_by(|a, b| a.0.cmp(b.0));
                let idx = nodes.len();
                nodes.push(DigestNode {
                    hash: bucket_hash(bucket),
                    bucket: Some(i),
                    left: None,
                    right: None,
                });
                idx
            })
            .collect();

        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| {
                    let (left, right) = (pair[0], pair[1]);
                    let hash = internal_hash(&nodes[left].hash, &nodes[right].hash);
                    let idx = nodes.len();
                    nodes.push(DigestNode {
                        hash,
                        bucket: None,
                        left: Some(left),
                        right: Some(right),
                    });
                    idx
                })
                .collect();
        }

        Self {
            depth,
            root: level[0],
            nodes,
        }
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn bucket_count(&self) -> usize {
        1usize << self.depth
    }

    pub fn root_hash(&self) -> Hash {
        self.nodes[self.root].hash
    }

    /// Buckets whose hashes differ, found by descending only into
    /// differing subtrees. Digests of different depths differ everywhere.
    pub fn diff_buckets(&self, other: &MerkleDigest) -> Vec<usize> {
        if self.depth != other.depth {
            return (0..self.bucket_count().max(other.bucket_count())).collect();
        }
        let mut out = Vec::new();
        self.descend(other, self.root, &mut out);
        out
    }

    fn descend(&self, other: &MerkleDigest, idx: usize, out: &mut Vec<usize>) {
        let (mine, theirs) = (&self.nodes[idx], &other.nodes[idx]);
        if mine.hash == theirs.hash {
            return;
        }
        if let Some(bucket) = mine.bucket {
            out.push(bucket);
            return;
        }
        if let Some(left) = mine.left {
            self.descend(other, left, out);
        }
        if let Some(right) = mine.right {
            self.descend(other, right, out);
        }
    }
}

/// Leaf bucket of a key: the top `depth` bits of its ring token.
pub fn bucket_of(key: &str, depth: u8) -> usize {
    if depth == 0 {
        return 0;
    }
    (key_token(key) >> (64 - u32::from(depth))) as usize
}

/// Order-independent hash of a version set.
pub fn version_set_hash(versions: &[VersionedValue]) -> Hash {
    let mut hashes: Vec<Hash> = versions.iter().map(version_hash).collect();
    hashes.sort_unstable();
    let mut hasher = Sha1::new();
    for h in &hashes {
        hasher.update(h);
    }
    hasher.finalize().into()
}

fn version_hash(v: &VersionedValue) -> Hash {
    let mut hasher = Sha1::new();
    for (node, counter) in v.vclock.canonical() {
        hasher.update(node.as_bytes());
        hasher.update([0u8]);
        hasher.update(counter.to_be_bytes());
    }
    hasher.update(v.timestamp_ms.to_be_bytes());
    hasher.update([u8::from(v.tombstone)]);
    hasher.update(&v.value);
    hasher.finalize().into()
}

/// SHA-1 over the bucket's sorted entries; zero for an empty bucket.
fn bucket_hash(entries: &[(&str, &Hash)]) -> Hash {
    if entries.is_empty() {
        return EMPTY;
    }
    let mut hasher = Sha1::new();
    for (key, hash) in entries {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(hash);
    }
    hasher.finalize().into()
}

/// SHA-1( left_hash || right_hash ), zero when both children are empty.
fn internal_hash(left: &Hash, right: &Hash) -> Hash {
    if *left == EMPTY && *right == EMPTY {
        return EMPTY;
    }
    let mut hasher = Sha1::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ringkv_common::VersionVector;
    use std::collections::{BTreeMap, BTreeSet};

    fn entries(pairs: &[(&str, &str)]) -> Vec<(String, Hash)> {
        pairs
            .iter()
            .map(|(k, v)| {
                let version = VersionedValue::new(
                    v.as_bytes().to_vec(),
                    VersionVector::from_entries([("A", 1)]),
                    0,
                );
                (k.to_string(), version_set_hash(&[version]))
            })
            .collect()
    }

    #[test]
    fn test_identical_digests() {
        let data = entries(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let mut shuffled = data.clone();
        shuffled.reverse();
        let d1 = MerkleDigest::build(4, &data);
        let d2 = MerkleDigest::build(4, &shuffled);

        assert_eq!(d1.root_hash(), d2.root_hash());
        assert!(d1.diff_buckets(&d2).is_empty());
    }

    #[test]
    fn test_empty_digest() {
        let d = MerkleDigest::build(3, &[]);
        assert_eq!(d.root_hash(), EMPTY);
        assert_eq!(d.bucket_count(), 8);
        assert!(d.diff_buckets(&MerkleDigest::build(3, &[])).is_empty());
    }

    #[test]
    fn test_diff_finds_changed_bucket() {
        let d1 = MerkleDigest::build(6, &entries(&[("a", "1"), ("b", "2"), ("c", "3")]));
        let d2 = MerkleDigest::build(6, &entries(&[("a", "1"), ("b", "CHANGED"), ("c", "3")]));

        assert_ne!(d1.root_hash(), d2.root_hash());
        assert_eq!(d1.diff_buckets(&d2), vec![bucket_of("b", 6)]);
    }

    #[test]
    fn test_diff_finds_missing_key() {
        let d1 = MerkleDigest::build(6, &entries(&[("a", "1"), ("c", "3")]));
        let d2 = MerkleDigest::build(6, &entries(&[("a", "1"), ("b", "2"), ("c", "3")]));
        assert_eq!(d1.diff_buckets(&d2), vec![bucket_of("b", 6)]);
    }

    #[test]
    fn test_depth_zero_single_bucket() {
        let d1 = MerkleDigest::build(0, &entries(&[("a", "1")]));
        let d2 = MerkleDigest::build(0, &entries(&[("a", "2")]));
        assert_eq!(d1.bucket_count(), 1);
        assert_eq!(d1.diff_buckets(&d2), vec![0]);
    }

    #[test]
    fn test_mismatched_depth_diffs_everything() {
        let d1 = MerkleDigest::build(2, &[]);
        let d2 = MerkleDigest::build(3, &[]);
        assert_eq!(d1.diff_buckets(&d2).len(), 8);
    }

    #[test]
    fn test_large_digest_single_change() {
        let data: Vec<(String, Hash)> = (0..1000)
            .map(|i| {
                let key = format!("key_{:04}", i);
                let hash = version_set_hash(&[VersionedValue::new(
                    format!("val_{}", i).into_bytes(),
                    VersionVector::from_entries([("A", 1)]),
                    0,
                )]);
                (key, hash)
            })
            .collect();

        let d1 = MerkleDigest::build(8, &data);
        let mut data2 = data.clone();
        data2[500].1 = [7u8; 20];
        let d2 = MerkleDigest::build(8, &data2);

        assert_eq!(d1.diff_buckets(&d2), vec![bucket_of("key_0500", 8)]);
    }

    #[test]
    fn test_version_set_hash_is_order_independent() {
        let a = VersionedValue::new(b"a".to_vec(), VersionVector::from_entries([("A", 1)]), 1);
        let b = VersionedValue::new(b"b".to_vec(), VersionVector::from_entries([("B", 1)]), 1);
        assert_eq!(
            version_set_hash(&[a.clone(), b.clone()]),
            version_set_hash(&[b.clone(), a.clone()])
        );
        assert_ne!(version_set_hash(&[a.clone()]), version_set_hash(&[a, b]));
    }

    #[test]
    fn test_bucket_of_in_range() {
        for depth in [1u8, 4, 8, 16] {
            for i in 0..100 {
                assert!(bucket_of(&format!("k{}", i), depth) < (1usize << depth));
            }
        }
    }

    fn arb_entries() -> impl Strategy<Value = BTreeMap<String, u8>> {
        prop::collection::btree_map("[a-z]{1,6}", any::<u8>(), 0..40)
    }

    fn to_entries(map: &BTreeMap<String, u8>) -> Vec<(String, Hash)> {
        map.iter().map(|(k, v)| (k.clone(), [*v; 20])).collect()
    }

    proptest! {
        /// The diff names exactly the buckets holding a key that is missing
        /// on one side or hashed differently.
        #[test]
        fn diff_matches_changed_buckets(
            a in arb_entries(),
            b in arb_entries(),
            depth in 0u8..6,
        ) {
            let da = MerkleDigest::build(depth, &to_entries(&a));
            let db = MerkleDigest::build(depth, &to_entries(&b));

            let expected: BTreeSet<usize> = a
                .keys()
                .chain(b.keys())
                .filter(|k| a.get(*k) != b.get(*k))
                .map(|k| bucket_of(k, depth))
                .collect();
            let diff: BTreeSet<usize> = da.diff_buckets(&db).into_iter().collect();

            prop_assert_eq!(diff, expected.clone());
            prop_assert_eq!(da.root_hash() == db.root_hash(), expected.is_empty());
        }
    }
}
