// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `PeerSink` that forwards into a target store and records what it saw.

use grid_replication::replicator::SinkFuture;
use grid_replication::{apply_frames, decode_batch, EngineReplication, PeerSink, ReplicationEntry, ReplicationError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::TestStore;

pub struct RecordingSink {
    sender: u8,
    target: Arc<TestStore>,
    batches: Mutex<Vec<Vec<ReplicationEntry>>>,
    link_up: AtomicBool,
    send_calls: AtomicUsize,
}

impl RecordingSink {
    pub fn new(sender: u8, target: Arc<TestStore>) -> Self {
        Self {
            sender,
            target,
            batches: Mutex::new(Vec::new()),
            link_up: AtomicBool::new(true),
            send_calls: AtomicUsize::new(0),
        }
    }

    /// Cut or restore the link. A cut link fails every send.
    pub fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::SeqCst);
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    /// Every entry delivered so far, in order.
    pub fn delivered(&self) -> Vec<ReplicationEntry> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

impl PeerSink for RecordingSink {
    fn send(&self, batch: Vec<u8>) -> SinkFuture<'_, ()> {
        Box::pin(async move {
            self.send_calls.fetch_add(1, Ordering::SeqCst);
            if !self.link_up.load(Ordering::SeqCst) {
                return Err(ReplicationError::Sink {
                    peer: self.target.identifier(),
                    message: "link down".into(),
                });
            }
            let (entries, _) = decode_batch(&batch);
            apply_frames(&*self.target, self.sender, &batch)?;
            self.batches.lock().unwrap().push(entries);
            Ok(())
        })
    }

    fn last_modification_time(&self, sender: u8) -> SinkFuture<'_, i64> {
        Box::pin(async move { Ok(self.target.last_modification_time(sender)) })
    }
}
