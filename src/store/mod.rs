// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Keyed storage.
//!
//! [`KeyValueStore`] is the only mutation surface for a node's shard of data.
//! [`ReplicatedStore`] implements it together with
//! [`EngineReplication`](crate::replication::EngineReplication): every local
//! mutation is stamped, dirtied for all peers and published on the change
//! feed; remote entries go through the same slots under the conflict rule.
//!
//! # Segments
//!
//! A store shards its keys into `N` segments (default 1) for parallel scans.
//! A key's segment is a pure function of the key and never changes.
//!
//! # Failure Semantics
//!
//! Absent keys are never an error. Operations fail only on a closed store,
//! a write to a read-only store, or key/value bytes that do not match the
//! store's types.

mod feed;
mod replicated;

pub use feed::{ChangeFeed, ChangeListener};
pub use replicated::{ReplicatedStore, StoreBuilder, StoreStats};

use crate::error::{InvalidSubscriber, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::hash::Hash;

/// Bounds every store key satisfies.
pub trait StoreKey: Hash + Eq + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> StoreKey for T where T: Hash + Eq + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Bounds every store value satisfies.
pub trait StoreValue: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> StoreValue for T where T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// How a segment scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Every live entry was visited.
    Completed,
    /// The consumer raised [`InvalidSubscriber`].
    Stopped,
}

/// Consumer of a key scan.
pub type KeyConsumer<'a, K> = dyn FnMut(&K) -> std::result::Result<(), InvalidSubscriber> + 'a;

/// Consumer of an entry scan.
pub type EntryConsumer<'a, K, V> = dyn FnMut(&K, &V) -> std::result::Result<(), InvalidSubscriber> + 'a;

/// A change to one key, as seen by live listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum MapEvent<K, V> {
    Insert { key: K, value: V },
    Update { key: K, old_value: V, value: V },
    Remove { key: K, old_value: V },
}

impl<K, V> MapEvent<K, V> {
    /// Build the event for a transition of one key; `None` if nothing visible changed.
    pub fn from_transition(key: K, old: Option<V>, new: Option<V>) -> Option<Self> {
        match (old, new) {
            (None, Some(value)) => Some(MapEvent::Insert { key, value }),
            (Some(old_value), Some(value)) => Some(MapEvent::Update { key, old_value, value }),
            (Some(old_value), None) => Some(MapEvent::Remove { key, old_value }),
            (None, None) => None,
        }
    }

    pub fn key(&self) -> &K {
        match self {
            MapEvent::Insert { key, .. } | MapEvent::Update { key, .. } | MapEvent::Remove { key, .. } => key,
        }
    }

    /// The value after the change, `None` for a removal.
    pub fn value(&self) -> Option<&V> {
        match self {
            MapEvent::Insert { value, .. } | MapEvent::Update { value, .. } => Some(value),
            MapEvent::Remove { .. } => None,
        }
    }

    pub fn is_remove(&self) -> bool {
        matches!(self, MapEvent::Remove { .. })
    }
}

/// Segment-addressable keyed storage with compare-and-swap mutators.
///
/// Mutations are atomic per key; nothing is atomic across keys.
pub trait KeyValueStore<K, V>: Send + Sync {
    /// Insert or overwrite. Returns true if the key already held a value
    /// (equal or replaced), false if newly added.
    fn put(&self, key: K, value: V) -> Result<bool>;

    /// Insert or overwrite, returning the prior value.
    fn get_and_put(&self, key: K, value: V) -> Result<Option<V>>;

    fn get(&self, key: &K) -> Result<Option<V>>;

    /// Copy the value into `target`, reusing its allocation where `V::clone_from` can.
    ///
    /// Returns `Some(target)` if the key was present; `target` is untouched otherwise.
    fn get_using<'t>(&self, key: &K, target: &'t mut V) -> Result<Option<&'t V>>;

    /// Delete. Returns true iff a mapping existed.
    fn remove(&self, key: &K) -> Result<bool>;

    /// Delete, returning the prior value.
    fn get_and_remove(&self, key: &K) -> Result<Option<V>>;

    /// Replace only if the current value equals `expected`.
    fn replace_if_equal(&self, key: &K, expected: &V, new_value: V) -> Result<bool>;

    /// Delete only if the current value equals `expected`.
    fn remove_if_equal(&self, key: &K, expected: &V) -> Result<bool>;

    /// Live entry count.
    fn long_size(&self) -> Result<u64>;

    /// Number of segments.
    fn segments(&self) -> usize;

    /// Segment holding `key`.
    fn segment_for(&self, key: &K) -> usize;

    /// Call `consumer` once for every live key in `segment`, as the scan
    /// visits it.
    ///
    /// The consumer runs while part of the segment is read-locked and must
    /// not write to this store.
    fn keys_for(&self, segment: usize, consumer: &mut KeyConsumer<'_, K>) -> Result<ScanOutcome>;

    /// Call `consumer` once for every live entry in `segment`. Same locking
    /// rule as [`keys_for`](Self::keys_for).
    fn entries_for(&self, segment: usize, consumer: &mut EntryConsumer<'_, K, V>) -> Result<ScanOutcome>;

    /// Remove everything, replicated as one deletion per key.
    fn clear(&self) -> Result<()>;

    fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.long_size()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_event_transitions() {
        assert_eq!(
            MapEvent::from_transition("k", None, Some(1)),
            Some(MapEvent::Insert { key: "k", value: 1 })
        );
        assert_eq!(
            MapEvent::from_transition("k", Some(1), Some(2)),
            Some(MapEvent::Update {
                key: "k",
                old_value: 1,
                value: 2
            })
        );
        let removed = MapEvent::from_transition("k", Some(2), None).unwrap();
        assert!(removed.is_remove());
        assert_eq!(removed.value(), None);
        assert_eq!(*removed.key(), "k");
        assert_eq!(MapEvent::<&str, i32>::from_transition("k", None, None), None);
    }
}
