// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process cluster of replicated stores driven by hand.
//!
//! Every node acquires an iterator for every other node at construction,
//! before any write, so nothing needs a handshake to be shipped.

use grid_replication::codec::encode_batch;
use grid_replication::{
    apply_frames, ApplyStats, EngineReplication, KeyValueStore, ManualClock, ReplicatedStore,
    ReplicationEntry,
};
use grid_replication::store::StoreBuilder;
use std::sync::Arc;

pub type TestStore = ReplicatedStore<String, String>;

/// One node: identifier, its clock and its store.
pub struct Node {
    pub id: u8,
    pub clock: Arc<ManualClock>,
    pub store: Arc<TestStore>,
}

impl Node {
    pub fn new(id: u8) -> Self {
        let clock = Arc::new(ManualClock::new(1));
        let store = StoreBuilder::new(id)
            .name(format!("node-{}", id))
            .segments(4)
            .clock(clock.clone())
            .build()
            .expect("store");
        Self { id, clock, store }
    }

    /// Put with the next write stamped `ts` (or later, if the key is newer).
    pub fn put_at(&self, ts: i64, key: &str, value: &str) {
        self.clock.set(ts);
        self.store.put(key.to_string(), value.to_string()).expect("put");
    }

    pub fn remove_at(&self, ts: i64, key: &str) {
        self.clock.set(ts);
        self.store.remove(&key.to_string()).expect("remove");
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(&key.to_string()).expect("get")
    }
}

pub struct Cluster {
    pub nodes: Vec<Node>,
}

impl Cluster {
    /// Nodes with identifiers `1..=n`.
    pub fn new(n: u8) -> Self {
        let nodes: Vec<Node> = (1..=n).map(Node::new).collect();
        for node in &nodes {
            for peer in &nodes {
                if peer.id != node.id {
                    node.store.acquire_modification_iterator(peer.id).expect("iterator");
                }
            }
        }
        Self { nodes }
    }

    pub fn node(&self, id: u8) -> &Node {
        &self.nodes[(id - 1) as usize]
    }

    /// Drain everything `from` has pending for `to` and apply it on `to`.
    pub fn ship(&self, from: u8, to: u8) -> ApplyStats {
        let batch = self.pending(from, to);
        let bytes = encode_batch(&batch).expect("encode");
        apply_frames(&*self.node(to).store, from, &bytes).expect("apply")
    }

    /// Drain the entries `from` has pending for `to` without applying them.
    pub fn pending(&self, from: u8, to: u8) -> Vec<ReplicationEntry> {
        let iterator = self
            .node(from)
            .store
            .acquire_modification_iterator(to)
            .expect("iterator");
        let mut batch = Vec::new();
        while iterator.next_entry(|entry| batch.push(entry)).expect("next_entry") {}
        batch
    }

    /// Ship between every ordered pair until nothing moves.
    pub fn settle(&self) {
        loop {
            let mut moved = 0;
            for from in &self.nodes {
                for to in &self.nodes {
                    if from.id != to.id {
                        let stats = self.ship(from.id, to.id);
                        moved += stats.applied + stats.discarded;
                    }
                }
            }
            if moved == 0 {
                return;
            }
        }
    }

    /// Assert every node holds the same value for each of `keys`.
    pub fn assert_converged(&self, keys: &[&str]) {
        for key in keys {
            let expected = self.nodes[0].get(key);
            for node in &self.nodes[1..] {
                assert_eq!(node.get(key), expected, "node {} disagrees on {}", node.id, key);
            }
        }
    }
}
