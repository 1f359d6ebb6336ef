// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-side query and subscription pipeline.
//!
//! A [`RemoteQuery`] is a lazily composed chain of stages (`filter`, `map`,
//! `flat_map`, `project`) over a [`QuerySource`]. Nothing runs until a
//! terminal operation is called.
//!
//! # Terminal Operations
//!
//! | Operation | Mode | Ends |
//! |-----------|------|------|
//! | [`subscribe`](RemoteQuery::subscribe) | async task, action per element | when cancelled or the source closes |
//! | [`subscribe_with`](RemoteQuery::subscribe_with) | as above, explicit [`SubscribeOptions`] | per options |
//! | [`for_each`](RemoteQuery::for_each) | drained on the caller's task | after the bootstrap snapshot |
//! | [`collect`](RemoteQuery::collect) | `for_each` into a [`Collector`] | after the bootstrap snapshot |
//!
//! # The `for_each` Bridge
//!
//! ```text
//!  producer (blocking thread)         bounded queue (128)            caller
//!  ──────────────────────────         ───────────────────            ──────
//!  snapshot segment ─► stages ─► send_timeout(20s) ──► [■■■■□□□] ──► recv (timeout 1s)
//!                                    │ timed out                       │ idle: re-check cancel
//!                                    ▼                                 ▼
//!                         drop element + diagnostics              action(element)
//! ```
//!
//! A stall is a diagnostic safety valve, not a retry: the dropped element is
//! gone. Redelivery is the replication layer's job
//! ([`dirty_entries`](crate::replication::ModificationIterator::dirty_entries)).
//!
//! Cancellation is cooperative. A cancelled token is observed at the next
//! offer, receive or wait, never in the middle of an action.

mod collector;
mod diagnostics;

pub use collector::{collector, Collector, Counting, FnCollector, ToVec};
pub use diagnostics::{BackpressureDiagnostics, StallReport, ThreadDumpDiagnostics};

use crate::config::QueryConfig;
use crate::error::{InvalidSubscriber, ReplicationError, Result};
use crate::metrics;
use crate::store::{ChangeListener, ScanOutcome};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A source of elements for a query: a segmented snapshot plus a live feed.
pub trait QuerySource: Send + Sync + 'static {
    type Item: Send + 'static;

    fn segment_count(&self) -> usize;

    /// Push every current element of `segment` into `sink` as the scan
    /// visits it. Called on a blocking thread.
    fn snapshot_segment(
        &self,
        segment: usize,
        sink: &mut dyn FnMut(Self::Item) -> std::result::Result<(), InvalidSubscriber>,
    ) -> Result<ScanOutcome>;

    /// Register a live listener with a buffer of `capacity` elements.
    fn listen(&self, capacity: usize) -> Result<ChangeListener<Self::Item>>;
}

type Stage<S, T> = Arc<dyn Fn(S, &mut dyn FnMut(T)) + Send + Sync>;

/// How a subscription starts and ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Deliver the current contents before live changes.
    pub bootstrap: bool,
    /// Stop once the current contents are delivered instead of following
    /// live changes.
    pub end_after_bootstrap: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            bootstrap: true,
            end_after_bootstrap: false,
        }
    }
}

impl SubscribeOptions {
    /// Live changes only.
    pub fn live() -> Self {
        Self {
            bootstrap: false,
            end_after_bootstrap: false,
        }
    }

    /// Current contents only.
    pub fn bootstrap_only() -> Self {
        Self {
            bootstrap: true,
            end_after_bootstrap: true,
        }
    }
}

/// Result of a `for_each` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ForEachSummary {
    pub delivered: u64,
    /// Elements dropped after a timed-out offer.
    pub dropped: u64,
    pub cancelled: bool,
}

/// Handle of a running subscription. Dropping it cancels the subscription.
pub struct SubscriptionHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl SubscriptionHandle {
    /// Stop delivery; no element is handed to the action after this returns
    /// except one already in progress.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Wait for the subscription to end (bootstrap done, source closed or
    /// cancelled) and surface its error, if any.
    pub async fn join(mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| ReplicationError::Internal(format!("subscription task failed: {}", e)))?,
            None => Ok(()),
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Where a running subscription puts its elements.
enum Delivery<T> {
    Action(Box<dyn FnMut(T) + Send>),
    Queue(QueueOffer<T>),
}

struct QueueOffer<T> {
    tx: mpsc::Sender<T>,
    capacity: usize,
    offer_timeout: Duration,
    dropped: Arc<AtomicU64>,
    diagnostics: Arc<dyn BackpressureDiagnostics>,
}

impl<T: Send> Delivery<T> {
    /// Hand one element over. Returns false once nobody is receiving.
    async fn deliver(&mut self, item: T, cancel: &CancellationToken) -> bool {
        match self {
            Delivery::Action(action) => {
                if cancel.is_cancelled() {
                    return false;
                }
                action(item);
                true
            }
            Delivery::Queue(queue) => queue.offer(item, cancel).await,
        }
    }
}

impl<T: Send> QueueOffer<T> {
    async fn offer(&self, item: T, cancel: &CancellationToken) -> bool {
        let started = Instant::now();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = self.tx.send_timeout(item, self.offer_timeout) => match sent {
                Ok(()) => true,
                Err(SendTimeoutError::Timeout(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    let waited = started.elapsed();
                    metrics::record_query_dropped("offer_timeout");
                    metrics::record_backpressure_stall(waited);
                    self.diagnostics.on_backpressure(&StallReport {
                        waited,
                        queue_capacity: self.capacity,
                        dropped,
                    });
                    true
                }
                Err(SendTimeoutError::Closed(_)) => false,
            }
        }
    }
}

/// A lazily composed query over a [`QuerySource`].
pub struct RemoteQuery<Src: QuerySource, T> {
    source: Arc<Src>,
    stage: Stage<Src::Item, T>,
    queue_capacity: usize,
    offer_timeout: Duration,
    poll_interval: Duration,
    subscription_capacity: usize,
    diagnostics: Arc<dyn BackpressureDiagnostics>,
}

impl<Src: QuerySource, T> Clone for RemoteQuery<Src, T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            stage: Arc::clone(&self.stage),
            queue_capacity: self.queue_capacity,
            offer_timeout: self.offer_timeout,
            poll_interval: self.poll_interval,
            subscription_capacity: self.subscription_capacity,
            diagnostics: Arc::clone(&self.diagnostics),
        }
    }
}

impl<Src: QuerySource> RemoteQuery<Src, Src::Item> {
    /// Query over `source` with default settings.
    pub fn new(source: Arc<Src>) -> Self {
        Self::with_config(source, &QueryConfig::default())
    }

    pub fn with_config(source: Arc<Src>, config: &QueryConfig) -> Self {
        Self {
            source,
            stage: Arc::new(|item: Src::Item, emit: &mut dyn FnMut(Src::Item)| emit(item)),
            queue_capacity: config.queue_capacity.max(1),
            offer_timeout: config.offer_timeout_duration(),
            poll_interval: config.poll_interval_duration(),
            subscription_capacity: config.subscription_capacity.max(1),
            diagnostics: Arc::new(ThreadDumpDiagnostics::new(config.reserved_thread_prefixes.clone())),
        }
    }
}

impl<Src: QuerySource, T: Send + 'static> RemoteQuery<Src, T> {
    /// Replace the backpressure hook.
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn BackpressureDiagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    fn then<U, G>(self, next: G) -> RemoteQuery<Src, U>
    where
        U: Send + 'static,
        G: Fn(T, &mut dyn FnMut(U)) + Send + Sync + 'static,
    {
        let prev = self.stage;
        let stage: Stage<Src::Item, U> = Arc::new(move |item: Src::Item, emit: &mut dyn FnMut(U)| {
            prev(item, &mut |t| next(t, &mut *emit));
        });
        RemoteQuery {
            source: self.source,
            stage,
            queue_capacity: self.queue_capacity,
            offer_timeout: self.offer_timeout,
            poll_interval: self.poll_interval,
            subscription_capacity: self.subscription_capacity,
            diagnostics: self.diagnostics,
        }
    }

    /// Keep elements matching `predicate`.
    pub fn filter<P>(self, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.then::<T, _>(move |item, emit| {
            if predicate(&item) {
                emit(item);
            }
        })
    }

    pub fn map<U, F>(self, f: F) -> RemoteQuery<Src, U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.then(move |item, emit: &mut dyn FnMut(U)| emit(f(item)))
    }

    /// Replace each element with zero or more elements.
    pub fn flat_map<U, I, F>(self, f: F) -> RemoteQuery<Src, U>
    where
        U: Send + 'static,
        I: IntoIterator<Item = U>,
        F: Fn(T) -> I + Send + Sync + 'static,
    {
        self.then(move |item, emit: &mut dyn FnMut(U)| {
            for out in f(item) {
                emit(out);
            }
        })
    }

    /// Convert each element into a projection type.
    pub fn project<P>(self) -> RemoteQuery<Src, P>
    where
        P: From<T> + Send + 'static,
    {
        self.map(P::from)
    }

    /// Run `action` per element: current contents, then live changes.
    pub fn subscribe<F>(&self, action: F) -> Result<SubscriptionHandle>
    where
        F: FnMut(T) + Send + 'static,
    {
        self.subscribe_with(SubscribeOptions::default(), action)
    }

    /// Run `action` per element on a background task. Does not block.
    ///
    /// Must be called from within a Tokio runtime. During the bootstrap
    /// snapshot the action runs on a blocking thread while the segment is
    /// being scanned; it must not write to the source store.
    pub fn subscribe_with<F>(&self, options: SubscribeOptions, action: F) -> Result<SubscriptionHandle>
    where
        F: FnMut(T) + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ReplicationError::Internal("subscribe requires a Tokio runtime".to_string()))?;

        // Register before the snapshot: a change racing the snapshot may be
        // delivered twice, never lost.
        let listener = if options.end_after_bootstrap {
            None
        } else {
            Some(self.source.listen(self.subscription_capacity)?)
        };

        let cancel = CancellationToken::new();
        let task = runtime.spawn(drive(
            Arc::clone(&self.source),
            Arc::clone(&self.stage),
            options,
            listener,
            Delivery::Action(Box::new(action)),
            cancel.clone(),
        ));

        debug!(?options, "Query subscription started");
        Ok(SubscriptionHandle {
            cancel,
            task: Some(task),
        })
    }

    /// Deliver the current contents to `action` on the calling task, through
    /// the bounded queue.
    pub async fn for_each<F>(&self, action: F) -> Result<ForEachSummary>
    where
        F: FnMut(T),
    {
        self.for_each_until(CancellationToken::new(), action).await
    }

    /// [`for_each`](Self::for_each) that stops early once `cancel` fires.
    pub async fn for_each_until<F>(&self, cancel: CancellationToken, mut action: F) -> Result<ForEachSummary>
    where
        F: FnMut(T),
    {
        let (tx, mut rx) = mpsc::channel(self.queue_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let producer_cancel = cancel.child_token();

        let producer = tokio::spawn(drive(
            Arc::clone(&self.source),
            Arc::clone(&self.stage),
            SubscribeOptions::bootstrap_only(),
            None,
            Delivery::Queue(QueueOffer {
                tx,
                capacity: self.queue_capacity,
                offer_timeout: self.offer_timeout,
                dropped: Arc::clone(&dropped),
                diagnostics: Arc::clone(&self.diagnostics),
            }),
            producer_cancel.clone(),
        ));

        let mut summary = ForEachSummary::default();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                received = tokio::time::timeout(self.poll_interval, rx.recv()) => match received {
                    Ok(Some(item)) => {
                        action(item);
                        summary.delivered += 1;
                    }
                    // producer finished and the remainder is drained
                    Ok(None) => break,
                    Err(_) => trace!("Query queue empty, re-checking"),
                }
            }
        }

        producer_cancel.cancel();
        drop(rx);
        producer
            .await
            .map_err(|e| ReplicationError::Internal(format!("query producer failed: {}", e)))??;

        summary.dropped = dropped.load(Ordering::Relaxed);
        metrics::record_query_delivered(summary.delivered);
        debug!(
            delivered = summary.delivered,
            dropped = summary.dropped,
            cancelled = summary.cancelled,
            "Query for_each finished"
        );
        Ok(summary)
    }

    /// Reduce the current contents with `collector`.
    pub async fn collect<C>(&self, collector: C) -> Result<C::Output>
    where
        C: Collector<T>,
    {
        let mut container = collector.supply();
        self.for_each(|item| collector.accumulate(&mut container, item)).await?;
        Ok(collector.finish(container))
    }

    /// Current contents as a `Vec`.
    pub async fn to_vec(&self) -> Result<Vec<T>> {
        self.collect(ToVec).await
    }
}

/// Body of every subscription: optional snapshot, then the live feed.
async fn drive<Src, T>(
    source: Arc<Src>,
    stage: Stage<Src::Item, T>,
    options: SubscribeOptions,
    listener: Option<ChangeListener<Src::Item>>,
    mut delivery: Delivery<T>,
    cancel: CancellationToken,
) -> Result<()>
where
    Src: QuerySource,
    T: Send + 'static,
{
    if options.bootstrap {
        let runtime = tokio::runtime::Handle::current();
        let scan_source = Arc::clone(&source);
        let scan_stage = Arc::clone(&stage);
        let scan_cancel = cancel.clone();
        let (returned, completed) = tokio::task::spawn_blocking(move || {
            let completed = snapshot(&*scan_source, &scan_stage, &mut delivery, &scan_cancel, &runtime);
            (delivery, completed)
        })
        .await
        .map_err(|e| ReplicationError::Internal(format!("query snapshot failed: {}", e)))?;
        if !completed? {
            return Ok(());
        }
        delivery = returned;
    }

    let Some(mut listener) = listener else {
        return Ok(());
    };

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            event = listener.recv() => event,
        };
        let Some(event) = event else {
            debug!("Query source closed, ending subscription");
            return Ok(());
        };

        let mut staged = Vec::new();
        stage(event, &mut |out| staged.push(out));
        for out in staged {
            if !delivery.deliver(out, &cancel).await {
                return Ok(());
            }
        }
    }
}

/// Deliver every current element as the scan visits it. Runs on a blocking
/// thread; an element waits for queue space while its segment is still being
/// read, so at most one queue of elements is in flight.
///
/// Returns false once delivery stopped early.
fn snapshot<Src, T>(
    source: &Src,
    stage: &Stage<Src::Item, T>,
    delivery: &mut Delivery<T>,
    cancel: &CancellationToken,
    runtime: &tokio::runtime::Handle,
) -> Result<bool>
where
    Src: QuerySource,
    T: Send + 'static,
{
    for segment in 0..source.segment_count() {
        let outcome = source.snapshot_segment(segment, &mut |item| {
            let mut staged = Vec::new();
            stage(item, &mut |out| staged.push(out));
            for out in staged {
                if !runtime.block_on(delivery.deliver(out, cancel)) {
                    return Err(InvalidSubscriber);
                }
            }
            Ok(())
        })?;
        if outcome == ScanOutcome::Stopped {
            trace!(segment, "Query snapshot stopped early");
            return Ok(false);
        }
    }
    Ok(true)
}
