// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backpressure diagnostics.
//!
//! When a bounded offer times out the producer drops the element and hands
//! a [`StallReport`] to the configured [`BackpressureDiagnostics`]. The
//! default, [`ThreadDumpDiagnostics`], logs the stalled task's backtrace and
//! every live thread of the process except reserved ones, which is usually
//! enough to see what the consumer is stuck on.

use std::backtrace::Backtrace;
use std::time::Duration;
use tracing::warn;

/// What happened when an offer gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallReport {
    /// How long the producer waited.
    pub waited: Duration,
    /// Capacity of the queue that stayed full.
    pub queue_capacity: usize,
    /// Elements dropped by this pipeline so far, including this one.
    pub dropped: u64,
}

/// Hook invoked on every backpressure stall.
pub trait BackpressureDiagnostics: Send + Sync {
    fn on_backpressure(&self, report: &StallReport);
}

/// Logs a thread dump on every stall.
#[derive(Debug, Clone, Default)]
pub struct ThreadDumpDiagnostics {
    reserved_prefixes: Vec<String>,
}

impl ThreadDumpDiagnostics {
    /// Threads whose names start with any of `reserved_prefixes` are left out.
    pub fn new(reserved_prefixes: Vec<String>) -> Self {
        Self { reserved_prefixes }
    }

    fn is_reserved(&self, name: &str) -> bool {
        self.reserved_prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
    }

    /// Live threads of this process as `(tid, name)`, reserved ones removed.
    ///
    /// Only Linux exposes the list; elsewhere this is empty.
    pub fn live_threads(&self) -> Vec<(u64, String)> {
        let Ok(tasks) = std::fs::read_dir("/proc/self/task") else {
            return Vec::new();
        };

        let mut threads: Vec<(u64, String)> = tasks
            .flatten()
            .filter_map(|task| {
                let tid = task.file_name().to_str()?.parse::<u64>().ok()?;
                let name = std::fs::read_to_string(task.path().join("comm"))
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                Some((tid, name))
            })
            .filter(|(_, name)| !self.is_reserved(name))
            .collect();
        threads.sort_unstable();
        threads
    }
}

impl BackpressureDiagnostics for ThreadDumpDiagnostics {
    fn on_backpressure(&self, report: &StallReport) {
        let threads = self.live_threads();
        let listing: Vec<String> = threads.iter().map(|(tid, name)| format!("{} {}", tid, name)).collect();
        let backtrace = Backtrace::force_capture();

        warn!(
            waited_ms = report.waited.as_millis() as u64,
            queue_capacity = report.queue_capacity,
            dropped = report.dropped,
            thread_count = threads.len(),
            threads = %listing.join(", "),
            "Query consumer stalled, dropped element. Producer backtrace:\n{}",
            backtrace
        );
    }
}
