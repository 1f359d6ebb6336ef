// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication core.
//!
//! Errors are grouped by how far they are allowed to travel. Per-record and
//! per-request failures are contained by the surrounding stream or session;
//! store-level failures propagate to the caller that discovered them.
//!
//! # Error Categories
//!
//! | Error Type | Recoverable | Retryable | Description |
//! |------------|-------------|-----------|-------------|
//! | `Decode` | Yes | No | One wire record is structurally incomplete or malformed |
//! | `Decompression` | Yes | No | One value payload failed to decompress |
//! | `UnknownCommand` | Yes | No | Collection RPC event name is not in the command set |
//! | `Rpc` | Yes | No | Collection RPC request had bad arguments |
//! | `Sink` | No | Yes | Shipping a batch to a peer failed |
//! | `ImmutableEntry` | No | No | Mutating a sealed `ReplicationEntry` |
//! | `ReadOnly` | No | No | Write attempted on a read-only store |
//! | `Closed` | No | No | Operation on a closed store |
//! | `TypeMismatch` | No | No | Key/value bytes do not decode to the store's types |
//! | `InvalidIdentifier` | No | No | Peer identifier equals the local identifier |
//! | `Config` | No | No | Configuration invalid |
//! | `Shutdown` | No | No | Replicator is shutting down |
//! | `Internal` | No | No | Unexpected internal error |

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur in the replication core.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The store was closed; fatal for the call, other entries are untouched.
    #[error("Store '{store}' is closed")]
    Closed { store: String },

    /// A write method was called on a read-only store.
    #[error("Store is read-only, rejected {operation}")]
    ReadOnly { operation: &'static str },

    /// A mutating accessor was called on a received or sealed entry.
    #[error("Unsupported operation: entry is read-only (field {field})")]
    ImmutableEntry { field: &'static str },

    /// One wire record could not be decoded.
    ///
    /// Recoverable: the record is skipped and the stream continues.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A compressed value payload could not be decompressed.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Key or value bytes do not match the store's key/value types.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Collection RPC event name outside the known command set.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Collection RPC request was malformed.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A peer identifier that can never be replicated to (e.g. our own).
    #[error("Invalid peer identifier: {0}")]
    InvalidIdentifier(u8),

    /// Shipping changes to a peer failed.
    #[error("Peer sink error ({peer}): {message}")]
    Sink { peer: u8, message: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a closed-store error.
    pub fn closed(store: impl Into<String>) -> Self {
        Self::Closed {
            store: store.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Sink { .. } => true,
            Self::Closed { .. } => false,
            Self::ReadOnly { .. } => false,
            Self::ImmutableEntry { .. } => false,
            Self::Decode(_) => false,
            Self::Decompression(_) => false,
            Self::TypeMismatch(_) => false,
            Self::UnknownCommand(_) => false,
            Self::Rpc(_) => false,
            Self::Config(_) => false,
            Self::InvalidIdentifier(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error is contained by the surrounding stream or session
    /// (skip the record / fail the request, keep going).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::Decompression(_) | Self::UnknownCommand(_) | Self::Rpc(_)
        )
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Non-fatal "stop" signal raised by a segment-scan consumer.
///
/// Returning this from a `keys_for`/`entries_for` callback ends the scan
/// early without touching store state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[error("subscriber is no longer valid")]
pub struct InvalidSubscriber;
