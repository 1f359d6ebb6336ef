// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Grid Replication
//!
//! Multi-master replication core for a segmented key-value grid.
//!
//! ## Architecture
//!
//! Every node holds a [`ReplicatedStore`] and runs one [`PeerReplicator`] per
//! remote node. Local writes are stamped, logged and dirtied for every peer;
//! each peer's [`ModificationIterator`] drains its own cursor over the log.
//!
//! ```text
//! ┌────────────────────────────── node 1 ──────────────────────────────┐
//! │                                                                    │
//! │  put/remove ──► ReplicatedStore ──► ModificationLog                │
//! │                  │   ▲                 │         │                 │
//! │       change feed│   │apply_replication│ iter(2) │ iter(3)         │
//! │                  ▼   │                 ▼         ▼                 │
//! │            RemoteQuery   apply_frames  PeerReplicator(2/3)         │
//! │            (subscribe,       ▲          │ encode_batch + retry     │
//! │             for_each)        │          ▼                          │
//! └──────────────────────────────┼──────── PeerSink ───────────────────┘
//!                                │            │
//!                        batches from         └──► node 2, node 3
//!                        node 2, node 3
//! ```
//!
//! ## Conflict Rule
//!
//! A remote entry wins if its timestamp is greater than the local one, or the
//! timestamps are equal and its origin identifier is smaller. Deletions are
//! kept as tombstones so they take part in the rule. Every node applies the
//! same rule, so all nodes that have seen the same entries agree.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use grid_replication::{
//!     InProcessSink, KeyValueStore, PeerReplicator, ReplicatedStore, ReplicatorConfig,
//! };
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! # async fn example() -> grid_replication::Result<()> {
//! let a = ReplicatedStore::<String, String>::new("users", 1)?;
//! let b = ReplicatedStore::<String, String>::new("users", 2)?;
//!
//! let to_b = Arc::new(PeerReplicator::new(
//!     &*a,
//!     2,
//!     Arc::new(InProcessSink::new(1, b.clone())),
//!     ReplicatorConfig::default(),
//! )?);
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let task = to_b.spawn(shutdown_rx);
//!
//! a.put("alice".into(), "admin".into())?;
//!
//! let _ = shutdown_tx.send(true);
//! let _ = task.await;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod clock;
pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
pub mod metrics;
pub mod query;
pub mod replication;
pub mod replicator;
pub mod resilience;
pub mod rpc;
pub mod store;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{decode_batch, decode_entry, encode_batch, encode_entry, Compression};
pub use config::{CodecConfig, QueryConfig, ReplicationConfig, ReplicatorConfig, StoreConfig};
pub use entry::ReplicationEntry;
pub use error::{InvalidSubscriber, ReplicationError, Result};
pub use query::{RemoteQuery, SubscribeOptions, SubscriptionHandle};
pub use replication::{remote_wins, ApplyOutcome, EngineReplication, ModificationIterator};
pub use replicator::{apply_frames, ApplyStats, InProcessSink, PeerReplicator, PeerSink};
pub use rpc::{CollectionCommand, CollectionDispatcher, RemoteCollection};
pub use store::{KeyValueStore, MapEvent, ReplicatedStore, ScanOutcome};
