//! Reconnect delay schedule.
//!
//! # Backoff Formula
//!
//! delay = min(initial * 2^attempt + jitter, max), never shorter than the
//! previous delay.
//!
//! With the defaults (1s initial, 60s cap, up to 1s jitter) that is roughly
//! 1s, 2s, 4s, 8s, 16s, 32s, then 60s until the budget of ten consecutive
//! failures runs out.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Tracks consecutive connection failures and yields the next delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    /// Fresh schedule.
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            config: config.clone(),
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }

        let exponent = self.attempt.min(32);
        let base = self
            .config
            .initial_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.max_ms);
        let jitter = if self.config.jitter_ms == 0 {
            0
        } else {
            rand::random::<u64>() % self.config.jitter_ms
        };

        let delay = Duration::from_millis(base.saturating_add(jitter).min(self.config.max_ms)).max(self.last);

        self.attempt += 1;
        self.last = delay;
        Some(delay)
    }

    /// Consecutive failures recorded so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }
}
