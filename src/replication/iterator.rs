// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-peer cursor over the modification log.
//!
//! # Cursor State
//!
//! ```text
//!   seq:   0    1    2    3    4    5    6
//!         [a]  [ ]  [c]  [d]  [ ]  [f]  [g]        ([ ] = moved/forgotten)
//!                         ▲
//!                      position          replay = {0, 2}   (re-armed by dirty_entries)
//! ```
//!
//! * `position` is the next unseen sequence number. Everything at or after it
//!   is pending for this peer.
//! * `replay` holds already-delivered sequence numbers re-armed by
//!   [`ModificationIterator::dirty_entries`]. They are delivered first, in
//!   sequence order, stamped with the pass's bootstrap timestamp.
//!
//! Entries whose origin is the peer itself are skipped so a change never
//! echoes back to the node that made it.
//!
//! One context drains a given cursor at a time. Writers only touch the shared
//! log, never a cursor.

use super::lock;
use super::log::{EntryLoader, LogRecord, LogState};
use crate::entry::ReplicationEntry;
use crate::error::{ReplicationError, Result};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, trace};

/// Callback invoked when an entry becomes available for a peer.
pub type ModificationNotifier = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
struct Cursor {
    position: u64,
    replay: BTreeSet<u64>,
    bootstrap_timestamp: i64,
}

/// Where the next candidate came from.
enum Candidate {
    Replay,
    Live,
}

/// Cursor over one store's changes for one remote peer.
pub struct ModificationIterator {
    store: String,
    remote_identifier: u8,
    cursor: Mutex<Cursor>,
    log: Arc<Mutex<LogState>>,
    loader: Weak<dyn EntryLoader>,
    notifier: Mutex<Option<ModificationNotifier>>,
}

impl ModificationIterator {
    pub(super) fn new(
        store: String,
        remote_identifier: u8,
        position: u64,
        log: Arc<Mutex<LogState>>,
        loader: Weak<dyn EntryLoader>,
    ) -> Self {
        Self {
            store,
            remote_identifier,
            cursor: Mutex::new(Cursor {
                position,
                replay: BTreeSet::new(),
                bootstrap_timestamp: 0,
            }),
            log,
            loader,
            notifier: Mutex::new(None),
        }
    }

    /// The peer this cursor delivers to.
    pub fn remote_identifier(&self) -> u8 {
        self.remote_identifier
    }

    /// True if at least one undelivered entry remains for this peer.
    pub fn has_next(&self) -> bool {
        let cursor = lock(&self.cursor);
        let log = lock(&self.log);

        let deliverable = |record: &LogRecord| record.identifier != self.remote_identifier;

        cursor
            .replay
            .iter()
            .filter_map(|seq| log.records.get(seq))
            .any(deliverable)
            || log.records.range(cursor.position..).map(|(_, r)| r).any(deliverable)
    }

    /// Undelivered entry count, including ones that will be skipped.
    pub fn backlog(&self) -> usize {
        let cursor = lock(&self.cursor);
        let log = lock(&self.log);
        cursor.replay.len() + log.records.range(cursor.position..).count()
    }

    /// Deliver the next entry to `consumer`, if one is ready.
    ///
    /// Never blocks on new data: returns `Ok(false)` immediately when nothing
    /// is pending. The delivered entry is sealed and addressed to this peer.
    /// The cursor is released before `consumer` runs, so the consumer may call
    /// back into this iterator.
    pub fn next_entry<F>(&self, consumer: F) -> Result<bool>
    where
        F: FnOnce(ReplicationEntry),
    {
        let mut cursor = lock(&self.cursor);

        loop {
            let (candidate, record) = {
                let log = lock(&self.log);
                match Self::next_candidate(&mut cursor, &log) {
                    Some(found) => found,
                    None => return Ok(false),
                }
            };

            if record.identifier == self.remote_identifier {
                trace!(peer = self.remote_identifier, "Skipping entry originated by peer");
                continue;
            }

            let loader = self
                .loader
                .upgrade()
                .ok_or_else(|| ReplicationError::closed(self.store.clone()))?;

            let entry = match loader.load_entry(&record.key)? {
                Some(entry) => entry,
                None => continue,
            };
            // state may have been replaced by an entry from this peer since the record was written
            if entry.identifier() == self.remote_identifier {
                continue;
            }

            let bootstrap_timestamp = match candidate {
                Candidate::Replay => cursor.bootstrap_timestamp,
                Candidate::Live => 0,
            };
            let sealed = entry
                .with_remote_identifier(self.remote_identifier)
                .with_bootstrap_timestamp(bootstrap_timestamp)
                .into_read_only();

            drop(cursor);
            consumer(sealed);
            return Ok(true);
        }
    }

    /// Advance past the next candidate and return it.
    fn next_candidate(cursor: &mut Cursor, log: &LogState) -> Option<(Candidate, LogRecord)> {
        while let Some(seq) = cursor.replay.pop_first() {
            if let Some(record) = log.records.get(&seq) {
                return Some((Candidate::Replay, record.clone()));
            }
        }

        let (seq, record) = log.records.range(cursor.position..).next()?;
        cursor.position = seq + 1;
        Some((Candidate::Live, record.clone()))
    }

    /// Re-arm delivered entries with `timestamp >= from_timestamp` for this
    /// peer only. Returns the number of entries re-armed.
    ///
    /// Entries not yet delivered stay pending as they were. Other peers'
    /// cursors are untouched.
    pub fn dirty_entries(&self, from_timestamp: i64) -> Result<usize> {
        let loader = self
            .loader
            .upgrade()
            .ok_or_else(|| ReplicationError::closed(self.store.clone()))?;

        let rearmed = {
            let mut cursor = lock(&self.cursor);
            let log = lock(&self.log);

            let before = cursor.replay.len();
            let candidates: Vec<u64> = log
                .records
                .range(..cursor.position)
                .filter(|(_, r)| r.timestamp >= from_timestamp && r.identifier != self.remote_identifier)
                .map(|(seq, _)| *seq)
                .collect();
            cursor.replay.extend(candidates);
            cursor.bootstrap_timestamp = loader.bootstrap_timestamp();
            cursor.replay.len() - before
        };

        debug!(
            store = %self.store,
            peer = self.remote_identifier,
            from_timestamp,
            rearmed,
            "Re-armed entries for backfill"
        );
        crate::metrics::record_backfill(self.remote_identifier, rearmed);

        if rearmed > 0 {
            self.notify();
        }
        Ok(rearmed)
    }

    /// Register the callback fired when an entry becomes available.
    ///
    /// Replaces any previous notifier; only one is active at a time.
    pub fn set_modification_notifier<F>(&self, notifier: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock(&self.notifier) = Some(Arc::new(notifier));
    }

    /// Remove the notifier, reverting to the no-op default.
    pub fn clear_modification_notifier(&self) {
        *lock(&self.notifier) = None;
    }

    pub(super) fn notify(&self) {
        let notifier = lock(&self.notifier).clone();
        if let Some(notifier) = notifier {
            notifier();
        }
    }
}

impl std::fmt::Debug for ModificationIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModificationIterator")
            .field("store", &self.store)
            .field("remote_identifier", &self.remote_identifier)
            .finish_non_exhaustive()
    }
}
