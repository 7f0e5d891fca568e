//! Resolution of concurrent sibling versions.

use ringkv_common::{VersionVector, VersionedValue};

pub use ringkv_config::ConflictPolicy;

/// What a read hands back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadValue {
    /// A single live value.
    Value(VersionedValue),
    /// Concurrent live siblings, with the merge of every observed vector.
    Conflict {
        siblings: Vec<VersionedValue>,
        context: VersionVector,
    },
}

impl ReadValue {
    /// Payload of a single value, `None` for a conflict.
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            ReadValue::Value(v) => Some(&v.value),
            ReadValue::Conflict { .. } => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ReadValue::Conflict { .. })
    }

    /// Vector a follow-up write should descend from.
    pub fn context(&self) -> &VersionVector {
        match self {
            ReadValue::Value(v) => &v.vclock,
            ReadValue::Conflict { context, .. } => context,
        }
    }
}

/// Outcome of applying a [`ConflictPolicy`] to a reconciled sibling set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Client-visible result. `None` when every survivor is a tombstone.
    pub read: Option<ReadValue>,
    /// The version set every replica should converge on.
    pub canonical: Vec<VersionedValue>,
}

/// Merge of every vector in the set.
pub fn merged_context(versions: &[VersionedValue]) -> VersionVector {
    versions
        .iter()
        .fold(VersionVector::new(), |acc, v| acc.merge(&v.vclock))
}

/// The latest sibling by timestamp, ties broken by canonical vector order.
/// The winner carries the merge of all sibling vectors so it dominates them.
pub fn last_writer_wins(versions: &[VersionedValue]) -> Option<VersionedValue> {
    let winner = versions.iter().max_by(|a, b| {
        a.timestamp_ms
            .cmp(&b.timestamp_ms)
            .then_with(|| a.vclock.canonical().cmp(&b.vclock.canonical()))
    })?;
    let mut resolved = winner.clone();
    resolved.vclock = merged_context(versions);
    Some(resolved)
}

/// Apply `policy` to an already reconciled (dominance-filtered) set.
pub fn resolve(policy: ConflictPolicy, reconciled: Vec<VersionedValue>) -> Resolution {
    if reconciled.len() <= 1 || policy == ConflictPolicy::Siblings {
        let context = merged_context(&reconciled);
        let mut live: Vec<VersionedValue> = reconciled
            .iter()
            .filter(|v| !v.tombstone)
            .cloned()
            .collect();
        let read = match live.len() {
            0 => None,
            1 => {
                // A live value concurrent with a delete still has to carry
                // the delete's history forward.
                let mut value = live.remove(0);
                value.vclock = context;
                Some(ReadValue::Value(value))
            }
            _ => Some(ReadValue::Conflict {
                siblings: live,
                context,
            }),
        };
        return Resolution {
            read,
            canonical: reconciled,
        };
    }

    match last_writer_wins(&reconciled) {
        Some(winner) => Resolution {
            read: (!winner.tombstone).then(|| ReadValue::Value(winner.clone())),
            canonical: vec![winner],
        },
        None => Resolution {
            read: None,
            canonical: Vec::new(),
        },
    }
}

/// True when `held` is not exactly the version set `canonical` (compared by vector).
pub fn differs(held: &[VersionedValue], canonical: &[VersionedValue]) -> bool {
    held.len() != canonical.len()
        || canonical
            .iter()
            .any(|c| !held.iter().any(|h| h.vclock == c.vclock))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vv(value: &[u8], ts: u64, entries: &[(&str, u64)]) -> VersionedValue {
        VersionedValue::new(
            value.to_vec(),
            VersionVector::from_entries(entries.iter().map(|(k, v)| (*k, *v))),
            ts,
        )
    }

    #[test]
    fn test_single_value() {
        let r = resolve(ConflictPolicy::Siblings, vec![vv(b"x", 1, &[("A", 1)])]);
        assert_eq!(r.read.unwrap().value(), Some(&b"x"[..]));
        assert_eq!(r.canonical.len(), 1);
    }

    #[test]
    fn test_siblings_policy_surfaces_conflict() {
        let set = vec![vv(b"left", 5, &[("A", 1)]), vv(b"right", 3, &[("B", 1)])];
        let r = resolve(ConflictPolicy::Siblings, set);
        match r.read.unwrap() {
            ReadValue::Conflict { siblings, context } => {
                assert_eq!(siblings.len(), 2);
                assert_eq!(context, VersionVector::from_entries([("A", 1), ("B", 1)]));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(r.canonical.len(), 2);
    }

    #[test]
    fn test_lww_picks_latest_and_merges_vectors() {
        let set = vec![vv(b"old", 3, &[("A", 1)]), vv(b"new", 9, &[("B", 1)])];
        let r = resolve(ConflictPolicy::LastWriterWins, set.clone());
        let value = match r.read.unwrap() {
            ReadValue::Value(v) => v,
            other => panic!("expected value, got {other:?}"),
        };
        assert_eq!(value.value, b"new");
        assert!(set.iter().all(|s| value.vclock.dominates(&s.vclock)));
        assert_eq!(r.canonical, vec![value]);
    }

    #[test]
    fn test_lww_timestamp_tie_uses_vector_not_payload() {
        let a = vv(b"zzz", 7, &[("A", 1)]);
        let b = vv(b"aaa", 7, &[("B", 1)]);
        let r1 = last_writer_wins(&[a.clone(), b.clone()]).unwrap();
        let r2 = last_writer_wins(&[b, a]).unwrap();
        // "B" sorts after "A" in canonical order.
        assert_eq!(r1.value, b"aaa");
        assert_eq!(r1, r2);
    }

    #[test]
    fn test_tombstone_only_is_not_found() {
        let t = VersionedValue::tombstone(VersionVector::from_entries([("A", 2)]), 4);
        let r = resolve(ConflictPolicy::Siblings, vec![t.clone()]);
        assert!(r.read.is_none());
        assert_eq!(r.canonical, vec![t]);
    }

    #[test]
    fn test_value_concurrent_with_tombstone_carries_merged_context() {
        let t = VersionedValue::tombstone(VersionVector::from_entries([("A", 2)]), 4);
        let v = vv(b"alive", 5, &[("A", 1), ("B", 1)]);
        let r = resolve(ConflictPolicy::Siblings, vec![t.clone(), v]);
        let read = r.read.unwrap();
        assert_eq!(read.value(), Some(&b"alive"[..]));
        assert!(read.context().dominates(&t.vclock));
        assert_eq!(r.canonical.len(), 2);
    }

    #[test]
    fn test_lww_tombstone_winner_is_not_found() {
        let t = VersionedValue::tombstone(VersionVector::from_entries([("A", 1)]), 10);
        let v = vv(b"v", 2, &[("B", 1)]);
        let r = resolve(ConflictPolicy::LastWriterWins, vec![v, t]);
        assert!(r.read.is_none());
        assert!(r.canonical[0].tombstone);
    }

    #[test]
    fn test_differs() {
        let a = vv(b"a", 1, &[("A", 1)]);
        let b = vv(b"b", 1, &[("B", 1)]);
        assert!(!differs(&[a.clone(), b.clone()], &[b.clone(), a.clone()]));
        assert!(differs(&[a.clone()], &[a.clone(), b.clone()]));
        assert!(differs(&[], &[a]));
    }
}
