// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared modification log.
//!
//! The log keeps one record per key: the latest modification, at the
//! sequence number it was appended with. Re-modifying a key moves its record
//! to a fresh sequence number, so draining in sequence order yields keys in
//! the order they were last dirtied. Values are not copied into the log; a
//! cursor loads the current state from the store when it delivers.

use super::iterator::ModificationIterator;
use super::lock;
use crate::entry::ReplicationEntry;
use crate::error::{ReplicationError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::debug;

/// Loads the current state of a key for delivery.
pub trait EntryLoader: Send + Sync {
    /// Current state of `key` as an unsealed entry; `None` if the store no
    /// longer holds anything for it.
    fn load_entry(&self, key: &[u8]) -> Result<Option<ReplicationEntry>>;

    /// Stamp for a backfill pass starting now.
    fn bootstrap_timestamp(&self) -> i64;
}

#[derive(Debug, Clone)]
pub(super) struct LogRecord {
    pub(super) key: Vec<u8>,
    pub(super) timestamp: i64,
    pub(super) identifier: u8,
}

#[derive(Debug, Default)]
pub(super) struct LogState {
    pub(super) next_seq: u64,
    pub(super) records: BTreeMap<u64, LogRecord>,
    index: HashMap<Vec<u8>, u64>,
}

impl LogState {
    fn append(&mut self, key: Vec<u8>, timestamp: i64, identifier: u8) -> u64 {
        if let Some(old) = self.index.remove(&key) {
            self.records.remove(&old);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(key.clone(), seq);
        self.records.insert(
            seq,
            LogRecord {
                key,
                timestamp,
                identifier,
            },
        );
        seq
    }

    fn forget(&mut self, key: &[u8]) {
        if let Some(seq) = self.index.remove(key) {
            self.records.remove(&seq);
        }
    }
}

/// Cursors to wake after an append, fired outside any store lock.
#[must_use]
pub struct PendingWakeups(Vec<Arc<ModificationIterator>>);

impl PendingWakeups {
    pub fn wake(self) {
        for iterator in self.0 {
            iterator.notify();
        }
    }
}

/// The per-store modification log and its per-peer cursors.
pub struct ModificationLog {
    store: String,
    local_identifier: u8,
    state: Arc<Mutex<LogState>>,
    iterators: RwLock<HashMap<u8, Arc<ModificationIterator>>>,
    loader: Weak<dyn EntryLoader>,
}

impl ModificationLog {
    pub fn new(store: impl Into<String>, local_identifier: u8, loader: Weak<dyn EntryLoader>) -> Self {
        Self {
            store: store.into(),
            local_identifier,
            state: Arc::new(Mutex::new(LogState::default())),
            iterators: RwLock::new(HashMap::new()),
            loader,
        }
    }

    /// Append a modification of `key`.
    ///
    /// Cursors for the peer that originated the modification are not woken.
    pub fn record(&self, key: Vec<u8>, timestamp: i64, identifier: u8) -> PendingWakeups {
        lock(&self.state).append(key, timestamp, identifier);

        let iterators = self.iterators.read().unwrap_or_else(|e| e.into_inner());
        PendingWakeups(
            iterators
                .values()
                .filter(|it| it.remote_identifier() != identifier)
                .cloned()
                .collect(),
        )
    }

    /// Drop the record for a key whose state was reclaimed.
    pub fn forget(&self, key: &[u8]) {
        lock(&self.state).forget(key);
    }

    /// Get or create the cursor for `remote_identifier`.
    ///
    /// A new cursor starts at the end of the log; history reaches it only
    /// through [`ModificationIterator::dirty_entries`].
    pub fn acquire(&self, remote_identifier: u8) -> Result<Arc<ModificationIterator>> {
        if remote_identifier == self.local_identifier {
            return Err(ReplicationError::InvalidIdentifier(remote_identifier));
        }

        if let Some(existing) = self
            .iterators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&remote_identifier)
        {
            return Ok(Arc::clone(existing));
        }

        let mut iterators = self.iterators.write().unwrap_or_else(|e| e.into_inner());
        let iterator = iterators.entry(remote_identifier).or_insert_with(|| {
            let position = lock(&self.state).next_seq;
            debug!(
                store = %self.store,
                peer = remote_identifier,
                position,
                "Created modification iterator"
            );
            Arc::new(ModificationIterator::new(
                self.store.clone(),
                remote_identifier,
                position,
                Arc::clone(&self.state),
                self.loader.clone(),
            ))
        });
        Ok(Arc::clone(iterator))
    }

    /// Peers that have a cursor.
    pub fn peers(&self) -> Vec<u8> {
        let mut peers: Vec<u8> = self
            .iterators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        peers.sort_unstable();
        peers
    }

    /// Number of records (distinct keys) in the log.
    pub fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every cursor; outstanding handles fail on their next delivery.
    pub fn close(&self) {
        self.iterators.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoLoader;

    impl EntryLoader for NoLoader {
        fn load_entry(&self, _key: &[u8]) -> Result<Option<ReplicationEntry>> {
            Ok(None)
        }
        fn bootstrap_timestamp(&self) -> i64 {
            0
        }
    }

    fn log_with_loader(loader: &Arc<NoLoader>) -> ModificationLog {
        let weak: Weak<dyn EntryLoader> = Arc::downgrade(loader) as Weak<dyn EntryLoader>;
        ModificationLog::new("test", 1, weak)
    }

    #[test]
    fn test_one_record_per_key() {
        let loader = Arc::new(NoLoader);
        let log = log_with_loader(&loader);
        log.record(b"a".to_vec(), 1, 1).wake();
        log.record(b"b".to_vec(), 2, 1).wake();
        log.record(b"a".to_vec(), 3, 1).wake();
        assert_eq!(log.len(), 2);

        let state = lock(&log.state);
        let keys: Vec<&[u8]> = state.records.values().map(|r| r.key.as_slice()).collect();
        // re-modified key moves to the back
        assert_eq!(keys, vec![&b"b"[..], &b"a"[..]]);
    }

    #[test]
    fn test_forget_removes_record() {
        let loader = Arc::new(NoLoader);
        let log = log_with_loader(&loader);
        log.record(b"a".to_vec(), 1, 1).wake();
        log.forget(b"a");
        assert!(log.is_empty());
    }

    #[test]
    fn test_acquire_is_get_or_create() {
        let loader = Arc::new(NoLoader);
        let log = log_with_loader(&loader);
        let first = log.acquire(2).unwrap();
        let second = log.acquire(2).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(log.peers(), vec![2]);
    }

    #[test]
    fn test_acquire_own_identifier_rejected() {
        let loader = Arc::new(NoLoader);
        let log = log_with_loader(&loader);
        assert!(matches!(log.acquire(1), Err(ReplicationError::InvalidIdentifier(1))));
    }

    #[test]
    fn test_wakeups_skip_originating_peer() {
        let loader = Arc::new(NoLoader);
        let log = log_with_loader(&loader);
        log.acquire(2).unwrap();
        log.acquire(3).unwrap();

        let pending = log.record(b"k".to_vec(), 1, 2);
        let woken: Vec<u8> = pending.0.iter().map(|it| it.remote_identifier()).collect();
        assert_eq!(woken, vec![3]);
    }
}
