//! Exponential backoff with jitter

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::BackoffConfig;

/// Retry delay policy: `min(base * 2^retry, max)` with random jitter
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    config: BackoffConfig,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Delay before attempt number `retry + 1`
    pub fn delay(&self, retry: u32) -> Duration {
        // 2^63 already saturates any sane max
        let exp = 2f64.powi(retry.min(63) as i32);
        let nominal = (self.config.base_secs * exp).min(self.config.max_secs);
        let spread = nominal * self.config.jitter;
        let secs = if spread > 0.0 {
            nominal + rand::rng().random_range(-spread..=spread)
        } else {
            nominal
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// When an item that failed `retry` times may be tried again
    pub fn next_retry_at(&self, retry: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(retry)).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
