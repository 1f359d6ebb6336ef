// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-store replication identity, conflict resolution and change cursors.
//!
//! # Data Flow
//!
//! ```text
//!  local put/remove ──► ModificationLog ──┬──► ModificationIterator(peer 2) ──► PeerReplicator ──► wire
//!                       (one record per   ├──► ModificationIterator(peer 3) ──► ...
//!                        key, seq order)  └──► ...
//!
//!  wire ──► codec::decode ──► EngineReplication::apply_replication ──► conflict rule ──► store
//! ```
//!
//! A store stamps every modification with `(timestamp, identifier)`. The
//! writer appends to one shared [`ModificationLog`]; each peer owns a cursor
//! over it, so the writer never learns which peers exist and never waits on
//! any of them.
//!
//! # Conflict Rule
//!
//! Every node applies [`remote_wins`] identically. Timestamps may collide
//! across nodes, so ties go to the smaller identifier. Deletions are ordinary
//! entries under the same rule: a stale delete is discarded and leaves the
//! newer value in place.

mod iterator;
mod log;

pub use iterator::{ModificationIterator, ModificationNotifier};
pub use log::{EntryLoader, ModificationLog};

use crate::entry::ReplicationEntry;
use crate::error::Result;
use std::sync::{Mutex, MutexGuard};
use std::sync::Arc;

/// Result of applying one remote entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The entry won and is now the local state for its key.
    Applied,
    /// The local state is newer (or wins the tie); nothing changed.
    Discarded,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// Replication surface of a store.
pub trait EngineReplication: Send + Sync {
    /// This node's identifier for the store, fixed at construction.
    fn identifier(&self) -> u8;

    /// Get or create the cursor for `remote_identifier`.
    ///
    /// Returns the same instance for the same peer while the store is open.
    fn acquire_modification_iterator(&self, remote_identifier: u8) -> Result<Arc<ModificationIterator>>;

    /// Newest timestamp recorded from `remote_identifier`, 0 if none.
    fn last_modification_time(&self, remote_identifier: u8) -> i64;

    fn set_last_modification_time(&self, remote_identifier: u8, timestamp: i64);

    /// Apply an entry produced by another node, under the conflict rule.
    fn apply_replication(&self, entry: &ReplicationEntry) -> Result<ApplyOutcome>;
}

/// The conflict rule.
///
/// `local` is the `(timestamp, identifier)` currently held for the key, live
/// or tombstone. With no local state the remote entry always applies.
pub fn remote_wins(remote_timestamp: i64, remote_identifier: u8, local: Option<(i64, u8)>) -> bool {
    match local {
        None => true,
        Some((local_timestamp, local_identifier)) => {
            remote_timestamp > local_timestamp
                || (remote_timestamp == local_timestamp && remote_identifier < local_identifier)
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
