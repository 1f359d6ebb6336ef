// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory replicated store.
//!
//! Each segment is a `DashMap` from key to [`Slot`]. A slot keeps the
//! `(timestamp, identifier)` of the last modification next to the value,
//! and survives deletion as a tombstone so late-arriving older puts are
//! still suppressed.
//!
//! # Write Path
//!
//! ```text
//! put(k, v)
//!   └─ segment.entry(k)             (per-key lock held from here...)
//!        ├─ stamp ts = max(clock.now(), slot.ts + 1)
//!        ├─ update slot
//!        ├─ publish MapEvent        (try_send, never waits)
//!        └─ log.record(k, ts, id)   (...to here)
//!   └─ wake peer notifiers          (outside the lock)
//! ```
//!
//! Remote entries take the same path, gated by [`remote_wins`] and keeping
//! the sender's stamp.

use super::{
    ChangeFeed, ChangeListener, EntryConsumer, KeyConsumer, KeyValueStore, MapEvent, ScanOutcome, StoreKey,
    StoreValue,
};
use crate::clock::{Clock, SystemClock};
use crate::config::ReplicationConfig;
use crate::entry::ReplicationEntry;
use crate::error::{InvalidSubscriber, ReplicationError, Result};
use crate::metrics;
use crate::query::QuerySource;
use crate::replication::{
    remote_wins, ApplyOutcome, EngineReplication, EntryLoader, ModificationIterator, ModificationLog,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace};

/// Default buffer for change listeners registered through `listen`.
const DEFAULT_LISTENER_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Slot<V> {
    /// `None` is a tombstone.
    value: Option<V>,
    timestamp: i64,
    identifier: u8,
}

/// Point-in-time counters for a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub name: String,
    pub identifier: u8,
    pub live_entries: u64,
    pub tombstones: u64,
    pub log_records: usize,
    pub peers: Vec<u8>,
}

/// Builder for [`ReplicatedStore`].
pub struct StoreBuilder {
    name: String,
    identifier: u8,
    segments: usize,
    read_only: bool,
    listener_capacity: usize,
    clock: Option<Arc<dyn Clock>>,
}

impl StoreBuilder {
    pub fn new(identifier: u8) -> Self {
        Self {
            name: "store".to_string(),
            identifier,
            segments: 1,
            read_only: false,
            listener_capacity: DEFAULT_LISTENER_CAPACITY,
            clock: None,
        }
    }

    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            name: config.store.name.clone(),
            identifier: config.identifier,
            segments: config.store.segments,
            read_only: config.store.read_only,
            listener_capacity: config.query.subscription_capacity,
            clock: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn segments(mut self, segments: usize) -> Self {
        self.segments = segments;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn listener_capacity(mut self, capacity: usize) -> Self {
        self.listener_capacity = capacity;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build<K: StoreKey, V: StoreValue>(self) -> Result<Arc<ReplicatedStore<K, V>>> {
        if self.segments == 0 {
            return Err(ReplicationError::Config("store needs at least one segment".to_string()));
        }
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));

        let store = Arc::new_cyclic(|weak: &Weak<ReplicatedStore<K, V>>| {
            let loader: Weak<dyn EntryLoader> = weak.clone();
            ReplicatedStore {
                log: ModificationLog::new(self.name.clone(), self.identifier, loader),
                feed: ChangeFeed::new(self.name.clone()),
                segments: (0..self.segments).map(|_| DashMap::new()).collect(),
                name: self.name,
                identifier: self.identifier,
                read_only: self.read_only,
                listener_capacity: self.listener_capacity,
                clock,
                last_modification: DashMap::new(),
                closed: AtomicBool::new(false),
            }
        });

        info!(
            store = %store.name,
            identifier = store.identifier,
            segments = store.segments.len(),
            read_only = store.read_only,
            "Replicated store created"
        );
        Ok(store)
    }
}

/// A segmented key-value store that participates in multi-master replication.
pub struct ReplicatedStore<K, V> {
    name: String,
    identifier: u8,
    read_only: bool,
    listener_capacity: usize,
    segments: Vec<DashMap<K, Slot<V>>>,
    clock: Arc<dyn Clock>,
    log: ModificationLog,
    last_modification: DashMap<u8, i64>,
    feed: ChangeFeed<MapEvent<K, V>>,
    closed: AtomicBool,
}

impl<K: StoreKey, V: StoreValue> ReplicatedStore<K, V> {
    /// Single-segment store named `name` on the system clock.
    pub fn new(name: impl Into<String>, identifier: u8) -> Result<Arc<Self>> {
        StoreBuilder::new(identifier).name(name).build()
    }

    pub fn builder(identifier: u8) -> StoreBuilder {
        StoreBuilder::new(identifier)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the store. Every later operation fails with `Closed`; cursors are
    /// released and change listeners see end-of-feed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.log.close();
        self.feed.close();
        info!(store = %self.name, "Replicated store closed");
    }

    /// Register a live change listener with the configured buffer size.
    pub fn change_listener(&self) -> Result<ChangeListener<MapEvent<K, V>>> {
        self.listen_with_capacity(self.listener_capacity)
    }

    pub fn listen_with_capacity(&self, capacity: usize) -> Result<ChangeListener<MapEvent<K, V>>> {
        self.check_open()?;
        Ok(self.feed.listen(capacity))
    }

    /// Drop tombstones stamped before `older_than`. Returns how many were reclaimed.
    ///
    /// A peer further behind than `older_than` may resurrect a purged key.
    pub fn purge_tombstones(&self, older_than: i64) -> Result<usize> {
        self.check_open()?;
        let mut purged = 0;
        for segment in &self.segments {
            let candidates: Vec<K> = segment
                .iter()
                .filter(|r| r.value().value.is_none() && r.value().timestamp < older_than)
                .map(|r| r.key().clone())
                .collect();

            for key in candidates {
                let key_bytes = encode_bytes("key", &key)?;
                let removed = segment.remove_if(&key, |_, slot| {
                    let stale = slot.value.is_none() && slot.timestamp < older_than;
                    if stale {
                        self.log.forget(&key_bytes);
                    }
                    stale
                });
                if removed.is_some() {
                    purged += 1;
                }
            }
        }
        debug!(store = %self.name, older_than, purged, "Purged tombstones");
        Ok(purged)
    }

    pub fn stats(&self) -> StoreStats {
        let (mut live, mut tombstones) = (0u64, 0u64);
        for segment in &self.segments {
            for slot in segment.iter() {
                if slot.value().value.is_some() {
                    live += 1;
                } else {
                    tombstones += 1;
                }
            }
        }
        StoreStats {
            name: self.name.clone(),
            identifier: self.identifier,
            live_entries: live,
            tombstones,
            log_records: self.log.len(),
            peers: self.log.peers(),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(ReplicationError::closed(self.name.clone()))
        } else {
            Ok(())
        }
    }

    fn check_writable(&self, operation: &'static str) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(ReplicationError::ReadOnly { operation });
        }
        Ok(())
    }

    fn segment_index(&self, key: &K) -> usize {
        if self.segments.len() == 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.segments.len() as u64) as usize
    }

    fn segment(&self, index: usize) -> Result<&DashMap<K, Slot<V>>> {
        self.segments.get(index).ok_or_else(|| {
            ReplicationError::Internal(format!(
                "segment {} out of range for store '{}' ({} segments)",
                index,
                self.name,
                self.segments.len()
            ))
        })
    }

    fn publish(&self, key: &K, old: Option<V>, new: Option<&V>) {
        if !self.feed.has_listeners() {
            return;
        }
        if let Some(event) = MapEvent::from_transition(key.clone(), old, new.cloned()) {
            self.feed.publish(&event);
        }
    }

    /// Run one local mutation of `key`.
    ///
    /// `decide` sees the current live value and returns what to write
    /// (`None` = leave the key alone, `Some(None)` = delete) plus the
    /// caller's result.
    fn mutate<R>(
        &self,
        key: K,
        operation: &'static str,
        decide: impl FnOnce(Option<&V>) -> (Option<Option<V>>, R),
    ) -> Result<R> {
        self.check_writable(operation)?;
        let key_bytes = encode_bytes("key", &key)?;
        let segment = &self.segments[self.segment_index(&key)];

        let (result, wakeups) = match segment.entry(key) {
            Entry::Occupied(mut occupied) => {
                let (write, result) = decide(occupied.get().value.as_ref());
                let Some(new_value) = write else {
                    return Ok(result);
                };
                let slot = occupied.get_mut();
                let timestamp = self.clock.now().max(slot.timestamp + 1);
                let old = std::mem::replace(&mut slot.value, new_value);
                slot.timestamp = timestamp;
                slot.identifier = self.identifier;
                let new_ref = slot.value.clone();
                self.publish(occupied.key(), old, new_ref.as_ref());
                (result, self.log.record(key_bytes, timestamp, self.identifier))
            }
            Entry::Vacant(vacant) => {
                let (write, result) = decide(None);
                let Some(Some(value)) = write else {
                    return Ok(result);
                };
                let timestamp = self.clock.now();
                self.publish(vacant.key(), None, Some(&value));
                vacant.insert(Slot {
                    value: Some(value),
                    timestamp,
                    identifier: self.identifier,
                });
                (result, self.log.record(key_bytes, timestamp, self.identifier))
            }
        };

        wakeups.wake();
        metrics::record_local_mutation(&self.name, operation);
        Ok(result)
    }
}

fn encode_bytes<T: Serialize>(what: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ReplicationError::TypeMismatch(format!("{} does not encode: {}", what, e)))
}

fn decode_bytes<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| ReplicationError::TypeMismatch(format!("{} does not decode to the store type: {}", what, e)))
}

impl<K: StoreKey, V: StoreValue> KeyValueStore<K, V> for ReplicatedStore<K, V> {
    fn put(&self, key: K, value: V) -> Result<bool> {
        self.mutate(key, "put", |current| match current {
            Some(existing) if *existing == value => (None, true),
            Some(_) => (Some(Some(value)), true),
            None => (Some(Some(value)), false),
        })
    }

    fn get_and_put(&self, key: K, value: V) -> Result<Option<V>> {
        self.mutate(key, "put", |current| (Some(Some(value)), current.cloned()))
    }

    fn get(&self, key: &K) -> Result<Option<V>> {
        self.check_open()?;
        Ok(self.segments[self.segment_index(key)]
            .get(key)
            .and_then(|slot| slot.value.clone()))
    }

    fn get_using<'t>(&self, key: &K, target: &'t mut V) -> Result<Option<&'t V>> {
        self.check_open()?;
        match self.segments[self.segment_index(key)].get(key) {
            Some(slot) => match &slot.value {
                Some(value) => {
                    target.clone_from(value);
                    Ok(Some(&*target))
                }
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    fn remove(&self, key: &K) -> Result<bool> {
        self.mutate(key.clone(), "remove", |current| match current {
            Some(_) => (Some(None), true),
            None => (None, false),
        })
    }

    fn get_and_remove(&self, key: &K) -> Result<Option<V>> {
        self.mutate(key.clone(), "remove", |current| match current {
            Some(existing) => (Some(None), Some(existing.clone())),
            None => (None, None),
        })
    }

    fn replace_if_equal(&self, key: &K, expected: &V, new_value: V) -> Result<bool> {
        self.mutate(key.clone(), "replace", |current| match current {
            Some(existing) if existing == expected => (Some(Some(new_value)), true),
            _ => (None, false),
        })
    }

    fn remove_if_equal(&self, key: &K, expected: &V) -> Result<bool> {
        self.mutate(key.clone(), "remove", |current| match current {
            Some(existing) if existing == expected => (Some(None), true),
            _ => (None, false),
        })
    }

    fn long_size(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self
            .segments
            .iter()
            .map(|segment| segment.iter().filter(|r| r.value().value.is_some()).count() as u64)
            .sum())
    }

    fn segments(&self) -> usize {
        self.segments.len()
    }

    fn segment_for(&self, key: &K) -> usize {
        self.segment_index(key)
    }

    fn keys_for(&self, segment: usize, consumer: &mut KeyConsumer<'_, K>) -> Result<ScanOutcome> {
        self.check_open()?;
        for record in self.segment(segment)?.iter() {
            if record.value().value.is_none() {
                continue;
            }
            if consumer(record.key()).is_err() {
                return Ok(ScanOutcome::Stopped);
            }
        }
        Ok(ScanOutcome::Completed)
    }

    fn entries_for(&self, segment: usize, consumer: &mut EntryConsumer<'_, K, V>) -> Result<ScanOutcome> {
        self.check_open()?;
        for record in self.segment(segment)?.iter() {
            let Some(value) = record.value().value.as_ref() else {
                continue;
            };
            if consumer(record.key(), value).is_err() {
                return Ok(ScanOutcome::Stopped);
            }
        }
        Ok(ScanOutcome::Completed)
    }

    fn clear(&self) -> Result<()> {
        self.check_writable("clear")?;
        let mut removed = 0usize;
        for index in 0..self.segments.len() {
            let mut keys = Vec::new();
            self.keys_for(index, &mut |key: &K| {
                keys.push(key.clone());
                Ok(())
            })?;
            for key in keys {
                if self.remove(&key)? {
                    removed += 1;
                }
            }
        }
        debug!(store = %self.name, removed, "Cleared store as per-key deletions");
        Ok(())
    }
}

impl<K: StoreKey, V: StoreValue> EngineReplication for ReplicatedStore<K, V> {
    fn identifier(&self) -> u8 {
        self.identifier
    }

    fn acquire_modification_iterator(&self, remote_identifier: u8) -> Result<Arc<ModificationIterator>> {
        self.check_open()?;
        self.log.acquire(remote_identifier)
    }

    fn last_modification_time(&self, remote_identifier: u8) -> i64 {
        self.last_modification
            .get(&remote_identifier)
            .map(|ts| *ts)
            .unwrap_or(0)
    }

    fn set_last_modification_time(&self, remote_identifier: u8, timestamp: i64) {
        self.last_modification.insert(remote_identifier, timestamp);
    }

    fn apply_replication(&self, entry: &ReplicationEntry) -> Result<ApplyOutcome> {
        self.check_open()?;
        let key: K = decode_bytes("key", entry.key())?;
        let value: Option<V> = entry.value().map(|bytes| decode_bytes("value", bytes)).transpose()?;
        let key_bytes = encode_bytes("key", &key)?;
        let (timestamp, origin) = (entry.timestamp(), entry.identifier());
        let segment = &self.segments[self.segment_index(&key)];

        let wakeups = match segment.entry(key) {
            Entry::Occupied(mut occupied) => {
                let local = occupied.get();
                if !remote_wins(timestamp, origin, Some((local.timestamp, local.identifier))) {
                    trace!(
                        store = %self.name,
                        origin,
                        timestamp,
                        local_timestamp = local.timestamp,
                        local_identifier = local.identifier,
                        "Discarded stale remote entry"
                    );
                    metrics::record_remote_apply(&self.name, origin, false);
                    return Ok(ApplyOutcome::Discarded);
                }
                let slot = occupied.get_mut();
                let old = std::mem::replace(&mut slot.value, value);
                slot.timestamp = timestamp;
                slot.identifier = origin;
                let new_value = slot.value.clone();
                self.publish(occupied.key(), old, new_value.as_ref());
                self.log.record(key_bytes, timestamp, origin)
            }
            Entry::Vacant(vacant) => {
                self.publish(vacant.key(), None, value.as_ref());
                vacant.insert(Slot {
                    value,
                    timestamp,
                    identifier: origin,
                });
                self.log.record(key_bytes, timestamp, origin)
            }
        };

        wakeups.wake();
        self.clock.observe(timestamp);
        metrics::record_remote_apply(&self.name, origin, true);
        trace!(store = %self.name, origin, timestamp, deleted = entry.is_deleted(), "Applied remote entry");
        Ok(ApplyOutcome::Applied)
    }
}

impl<K: StoreKey, V: StoreValue> EntryLoader for ReplicatedStore<K, V> {
    fn load_entry(&self, key: &[u8]) -> Result<Option<ReplicationEntry>> {
        self.check_open()?;
        let decoded: K = decode_bytes("key", key)?;
        let Some(slot) = self.segments[self.segment_index(&decoded)].get(&decoded) else {
            return Ok(None);
        };
        let entry = match &slot.value {
            Some(value) => ReplicationEntry::put(key.to_vec(), encode_bytes("value", value)?, slot.timestamp, slot.identifier),
            None => ReplicationEntry::delete(key.to_vec(), slot.timestamp, slot.identifier),
        };
        Ok(Some(entry))
    }

    fn bootstrap_timestamp(&self) -> i64 {
        self.clock.now()
    }
}

impl<K: StoreKey, V: StoreValue> QuerySource for ReplicatedStore<K, V> {
    type Item = MapEvent<K, V>;

    fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn snapshot_segment(
        &self,
        segment: usize,
        sink: &mut dyn FnMut(Self::Item) -> std::result::Result<(), InvalidSubscriber>,
    ) -> Result<ScanOutcome> {
        self.entries_for(segment, &mut |key: &K, value: &V| {
            sink(MapEvent::Insert {
                key: key.clone(),
                value: value.clone(),
            })
        })
    }

    fn listen(&self, capacity: usize) -> Result<ChangeListener<Self::Item>> {
        self.listen_with_capacity(capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store(identifier: u8, clock: Arc<ManualClock>) -> Arc<ReplicatedStore<String, String>> {
        ReplicatedStore::<String, String>::builder(identifier)
            .name(format!("node-{}", identifier))
            .clock(clock)
            .build()
            .unwrap()
    }

    fn k(s: &str) -> String {
        s.to_string()
    }

    fn remote_put(key: &str, value: &str, ts: i64, id: u8) -> ReplicationEntry {
        ReplicationEntry::put(
            serde_json::to_vec(key).unwrap(),
            serde_json::to_vec(value).unwrap(),
            ts,
            id,
        )
    }

    fn remote_delete(key: &str, ts: i64, id: u8) -> ReplicationEntry {
        ReplicationEntry::delete(serde_json::to_vec(key).unwrap(), ts, id)
    }

    #[test]
    fn test_put_reports_prior_presence() {
        let s = store(1, Arc::new(ManualClock::new(1)));
        assert!(!s.put(k("a"), k("1")).unwrap());
        assert!(s.put(k("a"), k("2")).unwrap());
        // equal value is a no-op but still reports presence
        assert!(s.put(k("a"), k("2")).unwrap());
        assert_eq!(s.get(&k("a")).unwrap(), Some(k("2")));
        assert_eq!(s.long_size().unwrap(), 1);
    }

    #[test]
    fn test_get_and_put_get_and_remove() {
        let s = store(1, Arc::new(ManualClock::new(1)));
        assert_eq!(s.get_and_put(k("a"), k("1")).unwrap(), None);
        assert_eq!(s.get_and_put(k("a"), k("2")).unwrap(), Some(k("1")));
        assert_eq!(s.get_and_remove(&k("a")).unwrap(), Some(k("2")));
        assert_eq!(s.get_and_remove(&k("a")).unwrap(), None);
        assert!(!s.contains_key(&k("a")).unwrap());
    }

    #[test]
    fn test_get_using_reuses_target() {
        let s = store(1, Arc::new(ManualClock::new(1)));
        s.put(k("a"), k("value")).unwrap();
        let mut target = String::with_capacity(64);
        assert_eq!(s.get_using(&k("a"), &mut target).unwrap(), Some(&k("value")));
        assert_eq!(target, "value");

        let mut untouched = k("keep");
        assert_eq!(s.get_using(&k("missing"), &mut untouched).unwrap(), None);
        assert_eq!(untouched, "keep");
    }

    #[test]
    fn test_remove_absent_key_is_not_an_error() {
        let s = store(1, Arc::new(ManualClock::new(1)));
        assert!(!s.remove(&k("nope")).unwrap());
        assert_eq!(s.stats().tombstones, 0);
    }

    #[test]
    fn test_remove_leaves_tombstone() {
        let s = store(1, Arc::new(ManualClock::new(1)));
        s.put(k("a"), k("1")).unwrap();
        assert!(s.remove(&k("a")).unwrap());
        assert!(!s.remove(&k("a")).unwrap());
        let stats = s.stats();
        assert_eq!(stats.live_entries, 0);
        assert_eq!(stats.tombstones, 1);
    }

    #[test]
    fn test_compare_and_swap() {
        let s = store(1, Arc::new(ManualClock::new(1)));
        s.put(k("a"), k("1")).unwrap();
        assert!(!s.replace_if_equal(&k("a"), &k("x"), k("2")).unwrap());
        assert!(s.replace_if_equal(&k("a"), &k("1"), k("2")).unwrap());
        assert_eq!(s.get(&k("a")).unwrap(), Some(k("2")));
        assert!(!s.remove_if_equal(&k("a"), &k("1")).unwrap());
        assert!(s.remove_if_equal(&k("a"), &k("2")).unwrap());
        assert_eq!(s.get(&k("a")).unwrap(), None);
        assert!(!s.replace_if_equal(&k("a"), &k("2"), k("3")).unwrap());
    }

    #[test]
    fn test_local_write_supersedes_newer_remote_stamp() {
        let clock = Arc::new(ManualClock::new(1));
        let s = store(1, Arc::clone(&clock));
        s.apply_replication(&remote_put("a", "remote", 500, 2)).unwrap();
        s.put(k("a"), k("local")).unwrap();

        let it = s.acquire_modification_iterator(3).unwrap();
        it.dirty_entries(0).unwrap();
        let mut shipped = None;
        it.next_entry(|e| shipped = Some(e)).unwrap();
        let shipped = shipped.unwrap();
        assert!(shipped.timestamp() > 500);
        assert_eq!(shipped.identifier(), 1);
    }

    #[test]
    fn test_segments_are_stable_and_scanned_exactly_once() {
        let s: Arc<ReplicatedStore<u32, u32>> = ReplicatedStore::<u32, u32>::builder(1).segments(4).build().unwrap();
        for i in 0..100 {
            s.put(i, i * 10).unwrap();
        }
        assert_eq!(s.segments(), 4);
        assert_eq!(s.segment_for(&7), s.segment_for(&7));

        let mut seen = Vec::new();
        for segment in 0..s.segments() {
            let outcome = s
                .entries_for(segment, &mut |key: &u32, value: &u32| {
                    assert_eq!(*value, key * 10);
                    seen.push(*key);
                    Ok(())
                })
                .unwrap();
            assert_eq!(outcome, ScanOutcome::Completed);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_scan_stops_on_invalid_subscriber() {
        let s: Arc<ReplicatedStore<u32, u32>> = ReplicatedStore::<u32, u32>::builder(1).build().unwrap();
        for i in 0..10 {
            s.put(i, i).unwrap();
        }
        let mut visited = 0;
        let outcome = s
            .keys_for(0, &mut |_: &u32| {
                visited += 1;
                if visited == 3 {
                    Err(InvalidSubscriber)
                } else {
                    Ok(())
                }
            })
            .unwrap();
        assert_eq!(outcome, ScanOutcome::Stopped);
        assert_eq!(visited, 3);
        assert_eq!(s.long_size().unwrap(), 10);
    }

    #[test]
    fn test_scan_out_of_range_segment_errors() {
        let s: Arc<ReplicatedStore<u32, u32>> = ReplicatedStore::<u32, u32>::builder(1).build().unwrap();
        assert!(s.keys_for(5, &mut |_: &u32| Ok(())).is_err());
    }

    #[test]
    fn test_clear_replicates_per_key_deletions() {
        let s = store(1, Arc::new(ManualClock::new(1)));
        let it = s.acquire_modification_iterator(2).unwrap();
        s.put(k("a"), k("1")).unwrap();
        s.put(k("b"), k("2")).unwrap();
        while it.next_entry(|_| {}).unwrap() {}

        s.clear().unwrap();
        assert!(s.is_empty().unwrap());

        let mut deletions = Vec::new();
        while it.next_entry(|e| deletions.push(e)).unwrap() {}
        assert_eq!(deletions.len(), 2);
        assert!(deletions.iter().all(|e| e.is_deleted()));
    }

    #[test]
    fn test_read_only_store_rejects_writes_but_applies_replication() {
        let s: Arc<ReplicatedStore<String, String>> = ReplicatedStore::<String, String>::builder(1).read_only(true).build().unwrap();
        assert!(matches!(
            s.put(k("a"), k("1")),
            Err(ReplicationError::ReadOnly { operation: "put" })
        ));
        assert!(s.clear().is_err());
        assert_eq!(
            s.apply_replication(&remote_put("a", "1", 5, 2)).unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(s.get(&k("a")).unwrap(), Some(k("1")));
    }

    #[test]
    fn test_closed_store_fails_every_call() {
        let s = store(1, Arc::new(ManualClock::new(1)));
        s.put(k("a"), k("1")).unwrap();
        s.close();
        assert!(matches!(s.get(&k("a")), Err(ReplicationError::Closed { .. })));
        assert!(s.put(k("b"), k("2")).is_err());
        assert!(s.acquire_modification_iterator(2).is_err());
        assert!(s.apply_replication(&remote_put("a", "x", 9, 2)).is_err());
    }

    #[test]
    fn test_type_mismatch_on_foreign_bytes() {
        let s: Arc<ReplicatedStore<u32, u32>> = ReplicatedStore::<u32, u32>::builder(1).build().unwrap();
        let err = s.apply_replication(&remote_put("not-a-number", "1", 5, 2)).unwrap_err();
        assert!(matches!(err, ReplicationError::TypeMismatch(_)));
        assert_eq!(s.long_size().unwrap(), 0);
    }

    #[test]
    fn test_conflict_rule_on_apply() {
        let s = store(1, Arc::new(ManualClock::new(1)));
        assert!(s.apply_replication(&remote_put("k", "a", 10, 2)).unwrap().is_applied());
        assert_eq!(
            s.apply_replication(&remote_put("k", "b", 5, 2)).unwrap(),
            ApplyOutcome::Discarded
        );
        assert_eq!(s.get(&k("k")).unwrap(), Some(k("a")));

        // tie broken by smaller identifier
        assert!(s.apply_replication(&remote_put("k", "c", 10, 1)).unwrap().is_applied());
        assert_eq!(
            s.apply_replication(&remote_put("k", "d", 10, 3)).unwrap(),
            ApplyOutcome::Discarded
        );
        assert_eq!(s.get(&k("k")).unwrap(), Some(k("c")));
    }

    #[test]
    fn test_tombstone_precedence() {
        let s = store(1, Arc::new(ManualClock::new(1)));
        s.apply_replication(&remote_delete("k", 7, 2)).unwrap();
        assert_eq!(
            s.apply_replication(&remote_put("k", "late", 6, 3)).unwrap(),
            ApplyOutcome::Discarded
        );
        assert_eq!(s.get(&k("k")).unwrap(), None);

        s.apply_replication(&remote_put("k", "newer", 8, 3)).unwrap();
        assert_eq!(s.get(&k("k")).unwrap(), Some(k("newer")));
    }

    #[test]
    fn test_last_modification_time_bookkeeping() {
        let s = store(1, Arc::new(ManualClock::new(1)));
        assert_eq!(s.last_modification_time(2), 0);
        s.set_last_modification_time(2, 1234);
        assert_eq!(s.last_modification_time(2), 1234);
        assert_eq!(s.last_modification_time(3), 0);
    }

    #[test]
    fn test_purge_tombstones() {
        let clock = Arc::new(ManualClock::new(100));
        let s = store(1, Arc::clone(&clock));
        s.put(k("a"), k("1")).unwrap();
        s.remove(&k("a")).unwrap();
        s.apply_replication(&remote_delete("b", 500, 2)).unwrap();

        assert_eq!(s.purge_tombstones(200).unwrap(), 1);
        let stats = s.stats();
        assert_eq!(stats.tombstones, 1);
        assert_eq!(stats.log_records, 1);
    }

    #[tokio::test]
    async fn test_change_feed_sees_local_and_remote_changes() {
        let s = store(1, Arc::new(ManualClock::new(1)));
        let mut listener = s.change_listener().unwrap();

        s.put(k("a"), k("1")).unwrap();
        s.put(k("a"), k("2")).unwrap();
        s.apply_replication(&remote_delete("a", 1_000, 2)).unwrap();

        assert_eq!(
            listener.recv().await,
            Some(MapEvent::Insert { key: k("a"), value: k("1") })
        );
        assert_eq!(
            listener.recv().await,
            Some(MapEvent::Update {
                key: k("a"),
                old_value: k("1"),
                value: k("2")
            })
        );
        assert_eq!(
            listener.recv().await,
            Some(MapEvent::Remove {
                key: k("a"),
                old_value: k("2")
            })
        );
    }
}
