// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry backoff and rate limiting for peer shipping.
//!
//! - [`RetryConfig`]: exponential backoff between attempts to hand a batch
//!   to a [`PeerSink`](crate::replicator::PeerSink)
//! - [`RateLimiter`]: token bucket pacing entries per second, so a peer that
//!   reconnects after a long partition is backfilled without flooding it
//!
//! ```text
//!   attempt:   1      2       3          4
//!   delay:     50ms   100ms   200ms ...  capped at max_delay
//! ```

use crate::config::ReplicatorConfig;
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

/// Backoff schedule for sink sends.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per batch before it is given up and re-armed.
    pub max_attempts: usize,

    /// Delay after the first failure.
    pub initial_delay: Duration,

    /// Ceiling on any single delay.
    pub max_delay: Duration,

    /// Growth factor between consecutive delays.
    pub backoff_factor: f64,

    /// Bound on a single send call.
    pub send_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            send_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Default schedule with the attempt budget taken from replicator settings.
    pub fn for_replicator(config: &ReplicatorConfig) -> Self {
        Self {
            max_attempts: config.max_send_attempts.max(1),
            ..Default::default()
        }
    }

    /// Fails quickly to keep tests short.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(40),
            backoff_factor: 2.0,
            send_timeout: Duration::from_millis(500),
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay = Duration::from_secs_f64(self.initial_delay.as_secs_f64() * multiplier);

        std::cmp::min(delay, self.max_delay)
    }
}

/// Token bucket settings: `refill_rate` tokens per second, at most
/// `burst_size` banked. One token per shipped entry.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can accumulate.
    pub burst_size: u32,

    /// Tokens added per second.
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_size: 1000,
            refill_rate: 10_000,
        }
    }
}

/// Async token bucket backed by `governor`.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait for one token. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Wait for `n` tokens, one at a time so a batch larger than the burst
    /// still makes progress.
    pub async fn acquire_many(&self, n: usize) {
        for _ in 0..n {
            self.limiter.until_ready().await;
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
