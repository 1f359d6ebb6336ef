// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests using proptest.
//!
//! These verify the invariants replication depends on for all inputs: the
//! conflict rule is a total order, so any delivery order converges, and the
//! codec never loses or invents data.

use grid_replication::codec::{decode_batch, decode_entry, encode_entry_with, Compression};
use grid_replication::{remote_wins, EngineReplication, KeyValueStore, ReplicatedStore, ReplicationEntry};
use proptest::prelude::*;
use std::cmp::Reverse;
use std::collections::BTreeMap;

// =============================================================================
// Conflict Rule Properties
// =============================================================================

/// Entries for one key with distinct `(timestamp, identifier)` stamps.
fn stamped_entries() -> impl Strategy<Value = Vec<(i64, u8, Option<u32>)>> {
    prop::collection::vec((0i64..40, 1u8..6, prop::option::of(any::<u32>())), 1..20).prop_map(|raw| {
        let unique: BTreeMap<(i64, u8), Option<u32>> = raw.into_iter().map(|(ts, id, v)| ((ts, id), v)).collect();
        unique.into_iter().map(|((ts, id), v)| (ts, id, v)).collect()
    })
}

fn to_entry(ts: i64, id: u8, value: Option<u32>) -> ReplicationEntry {
    let key = serde_json::to_vec("k").unwrap();
    match value {
        Some(v) => ReplicationEntry::put(key, serde_json::to_vec(&v).unwrap(), ts, id),
        None => ReplicationEntry::delete(key, ts, id),
    }
}

fn apply_all(entries: &[(i64, u8, Option<u32>)]) -> Option<u32> {
    let store = ReplicatedStore::<String, u32>::new("prop", 9).unwrap();
    for (ts, id, value) in entries {
        store.apply_replication(&to_entry(*ts, *id, *value)).unwrap();
    }
    store.get(&"k".to_string()).unwrap()
}

proptest! {
    /// Exactly one of two distinct stamps wins against the other.
    #[test]
    fn conflict_rule_is_antisymmetric(
        t1 in 0i64..100, i1 in 0u8..8,
        t2 in 0i64..100, i2 in 0u8..8,
    ) {
        prop_assume!((t1, i1) != (t2, i2));
        let forward = remote_wins(t1, i1, Some((t2, i2)));
        let backward = remote_wins(t2, i2, Some((t1, i1)));
        prop_assert!(forward != backward);
    }

    /// An entry never beats its own stamp, and always beats nothing.
    #[test]
    fn conflict_rule_is_irreflexive(t in any::<i64>(), i in any::<u8>()) {
        prop_assert!(!remote_wins(t, i, Some((t, i))));
        prop_assert!(remote_wins(t, i, None));
    }

    /// Delivery order does not change the outcome; the newest stamp wins, the
    /// smaller identifier on a timestamp tie.
    #[test]
    fn any_delivery_order_converges(
        (entries, shuffled) in stamped_entries()
            .prop_flat_map(|entries| (Just(entries.clone()), Just(entries).prop_shuffle()))
    ) {
        let expected = entries.iter().max_by_key(|(ts, id, _)| (*ts, Reverse(*id))).and_then(|(_, _, v)| *v);

        prop_assert_eq!(apply_all(&entries), expected);
        prop_assert_eq!(apply_all(&shuffled), expected);
    }

    /// Re-delivering any entry changes nothing.
    #[test]
    fn redelivery_is_idempotent(entries in stamped_entries(), repeat in any::<prop::sample::Index>()) {
        let mut doubled = entries.clone();
        doubled.push(entries[repeat.index(entries.len())]);
        prop_assert_eq!(apply_all(&doubled), apply_all(&entries));
    }
}

// =============================================================================
// Codec Properties
// =============================================================================

fn compression() -> impl Strategy<Value = Compression> {
    prop_oneof![Just(Compression::None), Just(Compression::Zstd), Just(Compression::Lz4)]
}

proptest! {
    /// Whatever the compression, a decoded entry carries the encoded data.
    #[test]
    fn entry_survives_the_wire(
        key in prop::collection::vec(any::<u8>(), 0..64),
        value in prop::option::of(prop::collection::vec(any::<u8>(), 0..2048)),
        ts in any::<i64>(),
        id in any::<u8>(),
        bootstrap in 0i64..i64::MAX,
        compression in compression(),
    ) {
        let entry = match value.clone() {
            Some(v) => ReplicationEntry::put(key.clone(), v, ts, id),
            None => ReplicationEntry::delete(key.clone(), ts, id),
        }
        .with_bootstrap_timestamp(bootstrap);

        let decoded = decode_entry(&encode_entry_with(&entry, compression).unwrap()).unwrap();

        prop_assert_eq!(decoded.key(), &key[..]);
        prop_assert_eq!(decoded.value(), value.as_deref());
        prop_assert_eq!(decoded.timestamp(), ts);
        prop_assert_eq!(decoded.identifier(), id);
        prop_assert_eq!(decoded.is_deleted(), value.is_none());
        prop_assert_eq!(decoded.bootstrap_timestamp(), bootstrap);
        prop_assert!(decoded.is_read_only());
    }

    /// Arbitrary input never panics the batch decoder, and every non-blank
    /// line is accounted for.
    #[test]
    fn batch_decoder_never_panics(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        let (entries, skipped) = decode_batch(&data);
        let records = data
            .split(|b| *b == b'\n')
            .filter(|r| !r.iter().all(u8::is_ascii_whitespace))
            .count();
        prop_assert_eq!(entries.len() + skipped, records);
    }
}
