//! Remote collector capability and health caching

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Errors reported by a [`Client`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Collector rejected metrics: {0}")]
    Rejected(String),

    #[error("Collector unavailable")]
    Unavailable,
}

/// Remote metrics collector
///
/// Implemented over the network outside this crate; delivery only needs
/// these two calls. `save_metrics` must be idempotent for a given
/// `(project, run, step)` since items can be retried after a partial
/// failure.
pub trait Client: Send + Sync {
    fn save_metrics(
        &self,
        project: &str,
        run: &str,
        step: i64,
        metrics: &BTreeMap<String, f64>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), ClientError>;

    fn health_check(&self) -> bool;
}

/// Health check result cached for a fixed TTL
#[derive(Debug)]
pub struct HealthCache {
    ttl: Duration,
    state: Mutex<Option<(bool, Instant)>>,
}

impl HealthCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(None),
        }
    }

    /// Cached availability, refreshed when stale or when `force` is set
    pub fn is_available(&self, client: &dyn Client, force: bool) -> bool {
        if !force {
            let cached = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((available, checked_at)) = cached {
                if checked_at.elapsed() < self.ttl {
                    return available;
                }
            }
        }
        let available = client.health_check();
        self.set(available);
        available
    }

    pub fn mark_available(&self) {
        self.set(true);
    }

    pub fn mark_unavailable(&self) {
        self.set(false);
    }

    fn set(&self, available: bool) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some((available, Instant::now()));
    }
}
