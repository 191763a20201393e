//! Direct send with queue fallback

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::DeliveryConfig;
use crate::error::Result;
use crate::layout::DataLayout;

use super::client::{Client, HealthCache};
use super::queue::{DeliveryQueue, QueueItem};
use super::worker::DeliveryWorker;

/// How a metric write was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by the collector right away
    Sent,
    /// Stored in the run's queue for the worker to retry
    Queued,
}

/// Remote metric writer for one run that rides out collector outages
///
/// Points are sent directly while the queue is empty and the collector
/// looks healthy. Anything else goes through the durable queue, drained in
/// step order by a background [`DeliveryWorker`].
pub struct ReliableSender {
    client: Arc<dyn Client>,
    queue: Arc<DeliveryQueue>,
    health: Arc<HealthCache>,
    worker: DeliveryWorker,
    flush_timeout: Duration,
}

impl std::fmt::Debug for ReliableSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableSender")
            .field("queue", &self.queue)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

impl ReliableSender {
    pub fn new(
        layout: &DataLayout,
        project: &str,
        run: &str,
        client: Arc<dyn Client>,
        config: &DeliveryConfig,
    ) -> Result<Self> {
        let queue = Arc::new(DeliveryQueue::open(layout, project, run, config)?);
        let health = Arc::new(HealthCache::new(config.health_ttl()));
        let worker = DeliveryWorker::new(Arc::clone(&queue), Arc::clone(&client), Arc::clone(&health), config);
        let sender = Self {
            client,
            queue,
            health,
            worker,
            flush_timeout: config.flush_timeout(),
        };
        // leftovers from a previous process
        if !sender.queue.is_empty() {
            tracing::info!(project, run, pending = sender.queue.len(), "resuming queued deliveries");
            sender.worker.start()?;
        }
        Ok(sender)
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn worker(&self) -> &DeliveryWorker {
        &self.worker
    }

    /// Send one step of metrics, queueing it if the collector cannot take it
    pub fn send(
        &self,
        step: i64,
        metrics: &BTreeMap<String, f64>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Delivery> {
        // queued items go first so steps reach the collector in order
        if self.queue.is_empty() && self.health.is_available(self.client.as_ref(), false) {
            match self
                .client
                .save_metrics(self.queue.project(), self.queue.run(), step, metrics, timestamp)
            {
                Ok(()) => {
                    self.health.mark_available();
                    return Ok(Delivery::Sent);
                }
                Err(e) => {
                    self.health.mark_unavailable();
                    tracing::warn!(step, error = %e, "direct delivery failed, queueing");
                }
            }
        }
        self.queue.enqueue(QueueItem::new(step, metrics.clone(), timestamp))?;
        self.worker.start()?;
        Ok(Delivery::Queued)
    }

    /// Stop the worker and flush what is left; returns undelivered items
    pub fn finish(&self, timeout: Duration) -> Result<usize> {
        let started = std::time::Instant::now();
        self.worker.stop(timeout);
        let left = self.worker.flush(timeout.saturating_sub(started.elapsed()))?;
        if left > 0 {
            tracing::warn!(
                project = %self.queue.project(),
                run = %self.queue.run(),
                left,
                "undelivered metrics remain queued"
            );
        }
        Ok(left)
    }

    /// [`finish`](Self::finish) with the configured flush timeout
    pub fn close(&self) -> Result<usize> {
        self.finish(self.flush_timeout)
    }
}
