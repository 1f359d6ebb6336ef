// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The change record shipped between peers.
//!
//! A [`ReplicationEntry`] describes one mutation of one key: the key and
//! value bytes (value absent for a deletion), the logical write time, the
//! identifier of the node that produced it, and the bootstrap timestamp of
//! the backfill pass it belongs to. `remote_identifier` is routing metadata
//! for the peer the instance is being delivered to and is not part of the
//! persisted change.
//!
//! Entries are built mutable, then sealed with [`ReplicationEntry::into_read_only`]
//! before transmission. Everything handed out by a modification iterator or
//! produced by the decoder is sealed; its setters fail with
//! [`ReplicationError::ImmutableEntry`].

use crate::error::{ReplicationError, Result};

/// One replicated mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationEntry {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
    timestamp: i64,
    identifier: u8,
    remote_identifier: Option<u8>,
    bootstrap_timestamp: i64,
    read_only: bool,
}

impl ReplicationEntry {
    /// A put of `value` under `key`.
    pub fn put(key: Vec<u8>, value: Vec<u8>, timestamp: i64, identifier: u8) -> Self {
        Self {
            key,
            value: Some(value),
            timestamp,
            identifier,
            remote_identifier: None,
            bootstrap_timestamp: 0,
            read_only: false,
        }
    }

    /// A deletion (tombstone) of `key`.
    pub fn delete(key: Vec<u8>, timestamp: i64, identifier: u8) -> Self {
        Self {
            key,
            value: None,
            timestamp,
            identifier,
            remote_identifier: None,
            bootstrap_timestamp: 0,
            read_only: false,
        }
    }

    /// Builder-style routing metadata.
    pub fn with_remote_identifier(mut self, remote_identifier: u8) -> Self {
        self.remote_identifier = Some(remote_identifier);
        self
    }

    /// Builder-style bootstrap timestamp.
    pub fn with_bootstrap_timestamp(mut self, bootstrap_timestamp: i64) -> Self {
        self.bootstrap_timestamp = bootstrap_timestamp;
        self
    }

    /// Seal the entry for transmission.
    pub fn into_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Value bytes, `None` for a deletion.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Identifier of the node that produced this modification.
    pub fn identifier(&self) -> u8 {
        self.identifier
    }

    /// Identifier of the peer this instance is addressed to, if routed.
    pub fn remote_identifier(&self) -> Option<u8> {
        self.remote_identifier
    }

    pub fn is_deleted(&self) -> bool {
        self.value.is_none()
    }

    /// Timestamp at which the sender began the backfill pass this entry was
    /// re-armed by, 0 for a live update.
    pub fn bootstrap_timestamp(&self) -> i64 {
        self.bootstrap_timestamp
    }

    /// True if this entry was delivered as part of a historical replay.
    pub fn is_replay(&self) -> bool {
        self.bootstrap_timestamp > 0 && self.timestamp < self.bootstrap_timestamp
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_value(&mut self, value: Option<Vec<u8>>) -> Result<()> {
        self.check_writable("value")?;
        self.value = value;
        Ok(())
    }

    pub fn set_timestamp(&mut self, timestamp: i64) -> Result<()> {
        self.check_writable("timestamp")?;
        self.timestamp = timestamp;
        Ok(())
    }

    pub fn set_identifier(&mut self, identifier: u8) -> Result<()> {
        self.check_writable("identifier")?;
        self.identifier = identifier;
        Ok(())
    }

    pub fn set_remote_identifier(&mut self, remote_identifier: u8) -> Result<()> {
        self.check_writable("remoteIdentifier")?;
        self.remote_identifier = Some(remote_identifier);
        Ok(())
    }

    pub fn set_bootstrap_timestamp(&mut self, bootstrap_timestamp: i64) -> Result<()> {
        self.check_writable("bootStrapTimeStamp")?;
        self.bootstrap_timestamp = bootstrap_timestamp;
        Ok(())
    }

    fn check_writable(&self, field: &'static str) -> Result<()> {
        if self.read_only {
            Err(ReplicationError::ImmutableEntry { field })
        } else {
            Ok(())
        }
    }
}
