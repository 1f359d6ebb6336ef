// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-peer replication driver.
//!
//! One [`PeerReplicator`] runs per remote node. It owns nothing but a
//! [`ModificationIterator`] and a [`PeerSink`]; the transport behind the sink
//! is the caller's business.
//!
//! ```text
//!   ┌────────────────┐  next_entry   ┌──────────────┐  encode_batch  ┌──────────┐
//!   │ Modification   │ ────────────► │ PeerReplicator│ ─────────────► │ PeerSink │ ──► peer
//!   │ Iterator (P)   │ ◄──────────── │  (batching)  │ ◄───────────── │          │
//!   └────────────────┘  dirty_entries└──────────────┘  send failure  └──────────┘
//!                       (re-arm)
//! ```
//!
//! # Lifecycle
//!
//! 1. **Handshake**: ask the peer for the newest timestamp it has recorded
//!    from us and re-arm everything from there (`dirty_entries`). A peer that
//!    has never heard from us answers 0 and gets a full backfill.
//! 2. **Drain**: pull up to `batch_size` entries, encode them, send through
//!    the circuit breaker with exponential backoff. A batch that exhausts its
//!    attempts is re-armed from its oldest timestamp, never lost. Shutdown
//!    during a backoff re-arms the batch the same way and stops the run.
//! 3. **Park**: when the iterator is empty, wait on the modification notifier
//!    (or `idle_wait`, whichever comes first), or exit on shutdown.
//!
//! [`apply_frames`] is the receiving half.

use crate::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use crate::codec::{decode_batch, encode_batch};
use crate::config::ReplicatorConfig;
use crate::entry::ReplicationEntry;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::replication::{ApplyOutcome, EngineReplication, ModificationIterator};
use crate::resilience::{RateLimiter, RetryConfig};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

/// Boxed future returned by [`PeerSink`] methods.
pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Transport to one remote node.
pub trait PeerSink: Send + Sync + 'static {
    /// Deliver one encoded batch (newline-delimited entry documents).
    fn send(&self, batch: Vec<u8>) -> SinkFuture<'_, ()>;

    /// Newest timestamp the peer has recorded from `sender`.
    fn last_modification_time(&self, sender: u8) -> SinkFuture<'_, i64>;
}

/// Sink that applies batches straight into a store in the same process.
pub struct InProcessSink<E: ?Sized> {
    sender: u8,
    target: Arc<E>,
}

impl<E: EngineReplication + ?Sized + 'static> InProcessSink<E> {
    /// `sender` is the identifier of the node shipping into `target`.
    pub fn new(sender: u8, target: Arc<E>) -> Self {
        Self { sender, target }
    }
}

impl<E: EngineReplication + ?Sized + 'static> PeerSink for InProcessSink<E> {
    fn send(&self, batch: Vec<u8>) -> SinkFuture<'_, ()> {
        Box::pin(async move {
            apply_frames(&*self.target, self.sender, &batch)?;
            Ok(())
        })
    }

    fn last_modification_time(&self, sender: u8) -> SinkFuture<'_, i64> {
        Box::pin(async move { Ok(self.target.last_modification_time(sender)) })
    }
}

/// Counters for one replicator.
#[derive(Debug, Default)]
struct Counters {
    entries_shipped: AtomicU64,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    rearmed: AtomicU64,
}

/// Snapshot of a replicator's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicatorStats {
    pub entries_shipped: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub rearmed: u64,
}

/// Ships one store's changes to one peer.
pub struct PeerReplicator {
    local_identifier: u8,
    iterator: Arc<ModificationIterator>,
    sink: Arc<dyn PeerSink>,
    config: ReplicatorConfig,
    retry: RetryConfig,
    circuit: CircuitBreaker,
    rate_limiter: Option<RateLimiter>,
    wakeup: Arc<Notify>,
    counters: Counters,
}

impl std::fmt::Debug for PeerReplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerReplicator")
            .field("local_identifier", &self.local_identifier)
            .field("peer", &self.iterator.remote_identifier())
            .field("stats", &self.stats())
            .finish()
    }
}

impl PeerReplicator {
    /// Acquire the iterator for `peer` on `engine` and hook its notifier.
    pub fn new<E>(engine: &E, peer: u8, sink: Arc<dyn PeerSink>, config: ReplicatorConfig) -> Result<Self>
    where
        E: EngineReplication + ?Sized,
    {
        let iterator = engine.acquire_modification_iterator(peer)?;
        let wakeup = Arc::new(Notify::new());
        let notify = Arc::clone(&wakeup);
        iterator.set_modification_notifier(move || notify.notify_one());

        Ok(Self {
            local_identifier: engine.identifier(),
            retry: RetryConfig::for_replicator(&config),
            rate_limiter: config.rate_limit_config().map(RateLimiter::new),
            circuit: CircuitBreaker::for_peer(peer, CircuitConfig::default()),
            iterator,
            sink,
            config,
            wakeup,
            counters: Counters::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit(mut self, config: CircuitConfig) -> Self {
        self.circuit = CircuitBreaker::for_peer(self.peer(), config);
        self
    }

    pub fn peer(&self) -> u8 {
        self.iterator.remote_identifier()
    }

    pub fn stats(&self) -> ReplicatorStats {
        ReplicatorStats {
            entries_shipped: self.counters.entries_shipped.load(Ordering::Relaxed),
            batches_sent: self.counters.batches_sent.load(Ordering::Relaxed),
            batches_failed: self.counters.batches_failed.load(Ordering::Relaxed),
            rearmed: self.counters.rearmed.load(Ordering::Relaxed),
        }
    }

    /// Ask the peer where it is and re-arm everything from that point.
    ///
    /// Returns the number of entries re-armed.
    pub async fn handshake(&self) -> Result<usize> {
        let peer = self.peer();
        let from = tokio::time::timeout(
            self.retry.send_timeout,
            self.sink.last_modification_time(self.local_identifier),
        )
        .await
        .map_err(|_| ReplicationError::Sink {
            peer,
            message: "handshake timed out".into(),
        })??;

        let rearmed = self.iterator.dirty_entries(from)?;
        self.counters.rearmed.fetch_add(rearmed as u64, Ordering::Relaxed);
        info!(peer, from_timestamp = from, rearmed, "Handshake complete");
        Ok(rearmed)
    }

    /// Ship at most one batch. Returns the number of entries shipped; 0 means
    /// the iterator had nothing ready.
    ///
    /// If the batch cannot be delivered it is re-armed before the error is
    /// returned.
    pub async fn drain_once(&self) -> Result<usize> {
        self.drain(None).await
    }

    /// [`drain_once`](Self::drain_once) whose retry backoff gives way to
    /// `shutdown` with [`ReplicationError::Shutdown`].
    async fn drain(&self, shutdown: Option<&mut watch::Receiver<bool>>) -> Result<usize> {
        let batch = self.next_batch()?;
        if batch.is_empty() {
            return Ok(0);
        }

        if let Some(ref limiter) = self.rate_limiter {
            limiter.acquire_many(batch.len()).await;
        }

        let peer = self.peer();
        let payload = encode_batch(&batch)?;
        let start = Instant::now();

        match self.send_with_retry(payload, shutdown).await {
            Ok(()) => {
                metrics::record_batch_send_latency(peer, start.elapsed());
                metrics::record_entries_shipped(peer, batch.len());
                self.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .entries_shipped
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                debug!(peer, entries = batch.len(), "Shipped batch");
                Ok(batch.len())
            }
            Err(e) => {
                let oldest = batch.iter().map(ReplicationEntry::timestamp).min().unwrap_or(0);
                let rearmed = self.iterator.dirty_entries(oldest)?;
                self.counters.rearmed.fetch_add(rearmed as u64, Ordering::Relaxed);
                if matches!(e, ReplicationError::Shutdown) {
                    debug!(peer, entries = batch.len(), rearmed, "Shutdown interrupted batch, re-armed");
                    return Err(e);
                }
                self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    peer,
                    entries = batch.len(),
                    from_timestamp = oldest,
                    rearmed,
                    error = %e,
                    "Batch undeliverable, re-armed for retry"
                );
                Err(e)
            }
        }
    }

    fn next_batch(&self) -> Result<Vec<ReplicationEntry>> {
        let mut batch = Vec::with_capacity(self.config.batch_size.min(1024));
        while batch.len() < self.config.batch_size {
            if !self.iterator.next_entry(|entry| batch.push(entry))? {
                break;
            }
        }
        Ok(batch)
    }

    async fn send_with_retry(
        &self,
        payload: Vec<u8>,
        mut shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> Result<()> {
        let peer = self.peer();
        let mut last_error = None;

        for attempt in 1..=self.retry.max_attempts {
            let payload = payload.clone();
            let timeout = self.retry.send_timeout;
            let sink = Arc::clone(&self.sink);

            let result = self
                .circuit
                .call(|| async move {
                    match tokio::time::timeout(timeout, sink.send(payload)).await {
                        Ok(result) => result,
                        Err(_) => Err(ReplicationError::Sink {
                            peer,
                            message: format!("send timed out after {:?}", timeout),
                        }),
                    }
                })
                .await;

            let error = match result {
                Ok(()) => return Ok(()),
                Err(CircuitError::Rejected) => ReplicationError::Sink {
                    peer,
                    message: "circuit open".into(),
                },
                Err(CircuitError::Inner(e)) if !e.is_retryable() => return Err(e),
                Err(CircuitError::Inner(e)) => e,
            };

            metrics::record_send_failure(peer);
            if attempt < self.retry.max_attempts {
                let delay = self.retry.delay_for_attempt(attempt);
                debug!(peer, attempt, delay_ms = delay.as_millis() as u64, error = %error, "Send failed, backing off");
                match shutdown.as_deref_mut() {
                    Some(rx) => {
                        if wait_or_shutdown(rx, delay).await {
                            return Err(ReplicationError::Shutdown);
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
            }
            last_error = Some(error);
        }

        Err(last_error.unwrap_or_else(|| ReplicationError::Sink {
            peer,
            message: "no send attempts configured".into(),
        }))
    }

    /// Handshake, then drain until shutdown or the store closes.
    #[instrument(skip_all, fields(peer = self.peer(), local = self.local_identifier))]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<ReplicatorStats> {
        let idle_wait = self.config.idle_wait_duration();
        let mut consecutive_failures = 0usize;

        // Handshake until it succeeds; nothing may ship before the peer's
        // position is known.
        loop {
            if *shutdown.borrow() {
                return Ok(self.stats());
            }
            match self.handshake().await {
                Ok(_) => break,
                Err(e) if e.is_retryable() => {
                    consecutive_failures += 1;
                    let delay = self.retry.delay_for_attempt(consecutive_failures);
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "Handshake failed, retrying");
                    if wait_or_shutdown(&mut shutdown, delay).await {
                        return Ok(self.stats());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        consecutive_failures = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.drain(Some(&mut shutdown)).await {
                Ok(0) => {
                    consecutive_failures = 0;
                    metrics::set_peer_backlog(self.peer(), self.iterator.backlog());
                    tokio::select! {
                        biased;
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = self.wakeup.notified() => trace!("Woken by modification"),
                        _ = tokio::time::sleep(idle_wait) => {}
                    }
                }
                Ok(_) => consecutive_failures = 0,
                Err(ReplicationError::Closed { store }) => {
                    info!(store = %store, "Store closed, replicator exiting");
                    break;
                }
                Err(ReplicationError::Shutdown) => break,
                Err(e) if e.is_retryable() => {
                    consecutive_failures += 1;
                    let delay = self.retry.delay_for_attempt(consecutive_failures);
                    if wait_or_shutdown(&mut shutdown, delay).await {
                        break;
                    }
                }
                Err(e) => {
                    self.iterator.clear_modification_notifier();
                    return Err(e);
                }
            }
        }

        self.iterator.clear_modification_notifier();
        let stats = self.stats();
        info!(
            entries_shipped = stats.entries_shipped,
            batches_failed = stats.batches_failed,
            "Replicator stopped"
        );
        Ok(stats)
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<ReplicatorStats>> {
        tokio::spawn(self.run(shutdown))
    }
}

/// Sleep for `delay`; true if shutdown was signalled meanwhile.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Outcome of applying one received batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub applied: usize,
    pub discarded: usize,
    /// Records that failed to decode or did not fit the store's types.
    pub skipped: usize,
}

/// Apply a batch received from `sender`.
///
/// Undecodable records and type mismatches are skipped; a closed store aborts
/// the batch. Afterwards the newest timestamp seen is recorded as
/// `last_modification_time(sender)`, never moving it backwards.
pub fn apply_frames<E>(engine: &E, sender: u8, batch: &[u8]) -> Result<ApplyStats>
where
    E: EngineReplication + ?Sized,
{
    let (entries, skipped) = decode_batch(batch);
    let mut stats = ApplyStats {
        skipped,
        ..Default::default()
    };
    let mut newest: Option<i64> = None;

    for entry in &entries {
        match engine.apply_replication(entry) {
            Ok(ApplyOutcome::Applied) => stats.applied += 1,
            Ok(ApplyOutcome::Discarded) => stats.discarded += 1,
            Err(e @ ReplicationError::TypeMismatch(_)) => {
                stats.skipped += 1;
                warn!(sender, key_len = entry.key().len(), error = %e, "Skipping entry of wrong type");
                continue;
            }
            Err(e) => return Err(e),
        }
        newest = Some(newest.map_or(entry.timestamp(), |ts| ts.max(entry.timestamp())));
    }

    if let Some(newest) = newest {
        if newest > engine.last_modification_time(sender) {
            engine.set_last_modification_time(sender, newest);
        }
    }

    debug!(
        sender,
        applied = stats.applied,
        discarded = stats.discarded,
        skipped = stats.skipped,
        "Applied batch"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyValueStore, ReplicatedStore};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    type Store = ReplicatedStore<String, String>;

    fn store(name: &str, id: u8) -> Arc<Store> {
        ReplicatedStore::new(name, id).unwrap()
    }

    /// Fails the first `failures` sends, then records batches.
    struct FlakySink {
        failures: AtomicUsize,
        batches: Mutex<Vec<Vec<u8>>>,
        position: i64,
    }

    impl FlakySink {
        fn new(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                batches: Mutex::new(Vec::new()),
                position: 0,
            }
        }
    }

    impl PeerSink for FlakySink {
        fn send(&self, batch: Vec<u8>) -> SinkFuture<'_, ()> {
            Box::pin(async move {
                let remaining = self.failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failures.store(remaining - 1, Ordering::SeqCst);
                    return Err(ReplicationError::Sink {
                        peer: 2,
                        message: "link down".into(),
                    });
                }
                self.batches.lock().unwrap().push(batch);
                Ok(())
            })
        }

        fn last_modification_time(&self, _sender: u8) -> SinkFuture<'_, i64> {
            Box::pin(async move { Ok(self.position) })
        }
    }

    fn replicator(source: &Store, sink: Arc<dyn PeerSink>) -> PeerReplicator {
        PeerReplicator::new(source, 2, sink, ReplicatorConfig::testing())
            .unwrap()
            .with_retry(RetryConfig::testing())
            .with_circuit(CircuitConfig {
                failure_rate: 1.0,
                window: 100,
                trial_calls: 1,
                recovery_timeout: Duration::from_millis(10),
            })
    }

    #[tokio::test]
    async fn test_handshake_backfills_new_peer() {
        let a = store("a", 1);
        a.put("k1".into(), "v1".into()).unwrap();
        a.put("k2".into(), "v2".into()).unwrap();

        let sink = Arc::new(FlakySink::new(0));
        let rep = replicator(&a, sink.clone());

        assert_eq!(rep.drain_once().await.unwrap(), 0);
        assert_eq!(rep.handshake().await.unwrap(), 2);
        assert_eq!(rep.drain_once().await.unwrap(), 2);

        let batches = sink.batches.lock().unwrap();
        let (entries, skipped) = decode_batch(&batches[0]);
        assert_eq!(skipped, 0);
        assert!(entries.iter().all(|e| e.remote_identifier() == Some(2) && e.is_replay()));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let a = store("a", 1);
        let sink = Arc::new(FlakySink::new(2));
        let rep = replicator(&a, sink.clone());

        a.put("k".into(), "v".into()).unwrap();
        assert_eq!(rep.drain_once().await.unwrap(), 1);
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
        assert_eq!(rep.stats().batches_sent, 1);
    }

    #[tokio::test]
    async fn test_exhausted_batch_is_rearmed() {
        let a = store("a", 1);
        let sink = Arc::new(FlakySink::new(3));
        let rep = replicator(&a, sink.clone());

        a.put("k".into(), "v".into()).unwrap();
        let err = rep.drain_once().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Sink { peer: 2, .. }));
        assert_eq!(rep.stats().batches_failed, 1);
        assert_eq!(rep.stats().rearmed, 1);

        // the link is back; the same entry goes out again
        assert_eq!(rep.drain_once().await.unwrap(), 1);
        let batches = sink.batches.lock().unwrap();
        let (entries, _) = decode_batch(&batches[0]);
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_batches_respect_batch_size() {
        let a = store("a", 1);
        let sink = Arc::new(FlakySink::new(0));
        let rep = replicator(&a, sink.clone());

        for i in 0..40 {
            a.put(format!("k{}", i), "v".into()).unwrap();
        }
        assert_eq!(rep.drain_once().await.unwrap(), 16);
        assert_eq!(rep.drain_once().await.unwrap(), 16);
        assert_eq!(rep.drain_once().await.unwrap(), 8);
        assert_eq!(rep.drain_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_apply_frames_records_newest_timestamp() {
        let a = store("a", 1);
        let b = store("b", 2);
        let rep = PeerReplicator::new(&*a, 2, Arc::new(InProcessSink::new(1, b.clone())), ReplicatorConfig::testing())
            .unwrap();

        a.put("x".into(), "1".into()).unwrap();
        a.put("y".into(), "2".into()).unwrap();
        rep.drain_once().await.unwrap();

        assert_eq!(b.get(&"y".to_string()).unwrap(), Some("2".to_string()));
        assert!(b.last_modification_time(1) > 0);

        // an older batch never moves the position back
        let before = b.last_modification_time(1);
        let stale = encode_batch(&[ReplicationEntry::put(
            serde_json::to_vec("z").unwrap(),
            serde_json::to_vec("old").unwrap(),
            1,
            1,
        )])
        .unwrap();
        let stats = apply_frames(&*b, 1, &stale).unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(b.last_modification_time(1), before);
    }

    #[test]
    fn test_apply_frames_skips_bad_records() {
        let b = store("b", 2);
        let mut batch = b"not a document\n".to_vec();
        batch.extend(
            encode_batch(&[ReplicationEntry::put(
                serde_json::to_vec(&7u32).unwrap(),
                serde_json::to_vec("v").unwrap(),
                10,
                1,
            )])
            .unwrap(),
        );
        batch.extend(
            encode_batch(&[ReplicationEntry::put(
                serde_json::to_vec("ok").unwrap(),
                serde_json::to_vec("v").unwrap(),
                11,
                1,
            )])
            .unwrap(),
        );

        let stats = apply_frames(&*b, 1, &batch).unwrap();
        assert_eq!(stats, ApplyStats { applied: 1, discarded: 0, skipped: 2 });
        assert_eq!(b.last_modification_time(1), 11);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff_and_rearms() {
        let a = store("a", 1);
        let sink = Arc::new(FlakySink::new(usize::MAX));
        let rep = Arc::new(
            PeerReplicator::new(&*a, 2, sink.clone(), ReplicatorConfig::testing())
                .unwrap()
                .with_retry(RetryConfig {
                    max_attempts: 5,
                    initial_delay: Duration::from_secs(30),
                    max_delay: Duration::from_secs(30),
                    ..RetryConfig::testing()
                })
                .with_circuit(CircuitConfig {
                    failure_rate: 1.0,
                    window: 100,
                    trial_calls: 1,
                    recovery_timeout: Duration::from_millis(10),
                }),
        );
        a.put("k".into(), "v".into()).unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&rep).spawn(rx);
        for _ in 0..100 {
            if sink.failures.load(Ordering::SeqCst) < usize::MAX {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(sink.failures.load(Ordering::SeqCst) < usize::MAX, "no send attempted");

        // the first backoff is 30s; shutdown must not wait for it
        tx.send(true).unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.batches_failed, 0);
        assert_eq!(stats.entries_shipped, 0);
        assert!(stats.rearmed >= 1);
        assert!(rep.iterator.has_next());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let a = store("a", 1);
        let b = store("b", 2);
        let rep = Arc::new(
            PeerReplicator::new(&*a, 2, Arc::new(InProcessSink::new(1, b.clone())), ReplicatorConfig::testing())
                .unwrap(),
        );
        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&rep).spawn(rx);

        a.put("live".into(), "1".into()).unwrap();
        for _ in 0..100 {
            if b.get(&"live".to_string()).unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(b.get(&"live".to_string()).unwrap(), Some("1".to_string()));

        tx.send(true).unwrap();
        let stats = handle.await.unwrap().unwrap();
        assert!(stats.entries_shipped >= 1);
    }
}
