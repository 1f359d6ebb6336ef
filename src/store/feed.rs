// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Live change feed.
//!
//! Every applied mutation is offered to each registered listener through
//! its own bounded channel with `try_send`. A full listener loses the event
//! (warned and counted); the writer never waits. Dropping a
//! [`ChangeListener`] unregisters it.

use crate::metrics;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

struct FeedInner<T> {
    store: String,
    listeners: DashMap<u64, mpsc::Sender<T>>,
    next_id: AtomicU64,
}

impl<T> FeedInner<T> {
    fn report_listeners(&self) {
        metrics::set_active_listeners(&self.store, self.listeners.len());
    }
}

/// Fan-out of store changes to live listeners.
pub struct ChangeFeed<T> {
    inner: Arc<FeedInner<T>>,
}

impl<T: Clone + Send + 'static> ChangeFeed<T> {
    pub fn new(store: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                store: store.into(),
                listeners: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a listener with a buffer of `capacity` events.
    pub fn listen(&self, capacity: usize) -> ChangeListener<T> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.insert(id, tx);
        self.inner.report_listeners();
        ChangeListener {
            id,
            receiver: rx,
            feed: Arc::downgrade(&self.inner),
        }
    }

    pub fn has_listeners(&self) -> bool {
        !self.inner.listeners.is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Offer an event to every listener without blocking.
    pub fn publish(&self, event: &T) {
        let before = self.inner.listeners.len();
        self.inner.listeners.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(store = %self.inner.store, listener = *id, "Change listener full, dropping event");
                metrics::record_query_dropped("listener_full");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if self.inner.listeners.len() != before {
            self.inner.report_listeners();
        }
    }

    /// Disconnect every listener; they observe end-of-feed after draining.
    pub fn close(&self) {
        self.inner.listeners.clear();
        self.inner.report_listeners();
    }
}

/// Receiving end of a feed registration.
pub struct ChangeListener<T> {
    id: u64,
    receiver: mpsc::Receiver<T>,
    feed: Weak<FeedInner<T>>,
}

impl<T> ChangeListener<T> {
    /// Next event; `None` once the feed is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

impl<T> Drop for ChangeListener<T> {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.listeners.remove(&self.id);
            feed.report_listeners();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_listener() {
        let feed = ChangeFeed::new("s");
        let mut a = feed.listen(4);
        let mut b = feed.listen(4);
        feed.publish(&1u32);
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(1));
    }

    #[test]
    fn test_full_listener_drops_without_blocking() {
        let feed = ChangeFeed::new("s");
        let mut listener = feed.listen(2);
        for i in 0..5u32 {
            feed.publish(&i);
        }
        assert_eq!(listener.try_recv(), Some(0));
        assert_eq!(listener.try_recv(), Some(1));
        assert_eq!(listener.try_recv(), None);
        // still registered
        assert_eq!(feed.listener_count(), 1);
    }

    #[test]
    fn test_drop_unregisters() {
        let feed: ChangeFeed<u32> = ChangeFeed::new("s");
        let listener = feed.listen(1);
        assert!(feed.has_listeners());
        drop(listener);
        assert!(!feed.has_listeners());
    }

    #[tokio::test]
    async fn test_close_ends_listeners_after_drain() {
        let feed = ChangeFeed::new("s");
        let mut listener = feed.listen(4);
        feed.publish(&7u32);
        feed.close();
        assert_eq!(listener.recv().await, Some(7));
        assert_eq!(listener.recv().await, None);
    }
}
