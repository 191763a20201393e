//! Background retry loop draining a delivery queue
//!
//! One worker thread per run. Its lifecycle is an explicit
//! [`WorkerState`] guarded by a mutex, and a single condvar wakes the
//! thread both when the poll interval elapses and when a stop is
//! requested.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::error::Result;

use super::backoff::Backoff;
use super::client::{Client, HealthCache};
use super::queue::{DeliveryQueue, QueueItem};

/// Lifecycle of a [`DeliveryWorker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
    Stopping,
}

struct Shared {
    queue: Arc<DeliveryQueue>,
    client: Arc<dyn Client>,
    health: Arc<HealthCache>,
    backoff: Backoff,
    batch_size: usize,
    poll_interval: Duration,
    state: Mutex<WorkerState>,
    signal: Condvar,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) {
        tracing::debug!(project = %self.queue.project(), run = %self.queue.run(), "delivery worker started");
        loop {
            if *self.state() != WorkerState::Running {
                break;
            }
            self.pass(Utc::now(), false);

            let guard = self.state();
            let (guard, _) = self
                .signal
                .wait_timeout_while(guard, self.poll_interval, |state| *state == WorkerState::Running)
                .unwrap_or_else(PoisonError::into_inner);
            if *guard != WorkerState::Running {
                break;
            }
        }
        *self.state() = WorkerState::Stopped;
        self.signal.notify_all();
        tracing::debug!(project = %self.queue.project(), run = %self.queue.run(), "delivery worker stopped");
    }

    /// One send attempt over the items ready at `now`; returns items sent
    fn pass(&self, now: DateTime<Utc>, force_health: bool) -> usize {
        let items = match self.queue.ready_items_at(now, self.batch_size) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(project = %self.queue.project(), run = %self.queue.run(), error = %e, "reading delivery queue failed");
                return 0;
            }
        };
        if items.is_empty() {
            return 0;
        }
        if !self.health.is_available(self.client.as_ref(), force_health) {
            tracing::debug!(pending = items.len(), "collector unavailable, skipping pass");
            return 0;
        }

        let mut sent: Vec<Uuid> = Vec::with_capacity(items.len());
        for item in &items {
            match self.send(item) {
                Ok(()) => {
                    self.health.mark_available();
                    sent.push(item.id);
                }
                Err(e) => {
                    // keep order: later items wait for this one
                    self.health.mark_unavailable();
                    self.schedule_retry(item);
                    tracing::warn!(step = item.step, retry = item.retry_count + 1, error = %e, "delivery failed");
                    break;
                }
            }
        }

        if !sent.is_empty() {
            if let Err(e) = self.queue.dequeue(&sent) {
                tracing::warn!(error = %e, "dequeue after delivery failed");
            }
            tracing::debug!(sent = sent.len(), "delivered queued metrics");
        }
        sent.len()
    }

    fn send(&self, item: &QueueItem) -> std::result::Result<(), super::client::ClientError> {
        self.client.save_metrics(
            self.queue.project(),
            self.queue.run(),
            item.step,
            &item.metrics,
            item.timestamp,
        )
    }

    fn schedule_retry(&self, item: &QueueItem) {
        let next = self.backoff.next_retry_at(item.retry_count, Utc::now());
        if let Err(e) = self.queue.update_retry_info(item.id, item.retry_count + 1, next) {
            tracing::warn!(error = %e, "recording retry info failed");
        }
    }
}

/// Background thread retrying queued deliveries for one run
pub struct DeliveryWorker {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DeliveryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryWorker")
            .field("project", &self.shared.queue.project())
            .field("run", &self.shared.queue.run())
            .field("state", &self.state())
            .finish()
    }
}

impl DeliveryWorker {
    pub fn new(
        queue: Arc<DeliveryQueue>,
        client: Arc<dyn Client>,
        health: Arc<HealthCache>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue,
                client,
                health,
                backoff: Backoff::new(config.backoff.clone()),
                batch_size: config.batch_size.max(1),
                poll_interval: config.poll_interval(),
                state: Mutex::new(WorkerState::Stopped),
                signal: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Start the thread; returns `false` if it is already running or
    /// still stopping
    pub fn start(&self) -> Result<bool> {
        let mut state = self.shared.state();
        if *state != WorkerState::Stopped {
            return Ok(false);
        }
        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = thread.take() {
            // already stopped, this only reaps it
            let _ = previous.join();
        }
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(format!("entrenar-delivery-{}", self.shared.queue.run()))
            .spawn(move || shared.run())?;
        *thread = Some(handle);
        *state = WorkerState::Running;
        Ok(true)
    }

    /// Request a stop and wait up to `timeout` for the thread to exit
    ///
    /// Returns `true` once the worker is stopped.
    pub fn stop(&self, timeout: Duration) -> bool {
        let guard = {
            let mut state = self.shared.state();
            if *state == WorkerState::Running {
                *state = WorkerState::Stopping;
                self.shared.signal.notify_all();
            }
            let (guard, _) = self
                .shared
                .signal
                .wait_timeout_while(state, timeout, |state| *state != WorkerState::Stopped)
                .unwrap_or_else(PoisonError::into_inner);
            *guard
        };
        if guard != WorkerState::Stopped {
            tracing::warn!(?timeout, run = %self.shared.queue.run(), "delivery worker did not stop in time");
            return false;
        }
        if let Some(handle) = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take() {
            if handle.join().is_err() {
                tracing::warn!("delivery worker panicked");
            }
        }
        true
    }

    /// Run one pass on the calling thread
    pub fn process_pass(&self) -> usize {
        self.shared.pass(Utc::now(), false)
    }

    /// Deliver everything still queued, giving up after `timeout`
    ///
    /// Retry schedules are ignored; a failure waits one poll interval and
    /// forces a fresh health check. Returns the number of items still
    /// undelivered. Queue files are removed only when nothing is left.
    pub fn flush(&self, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.shared.queue.len();
            if pending == 0 {
                self.shared.queue.remove_files()?;
                return Ok(0);
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                tracing::warn!(pending, run = %self.shared.queue.run(), "flush deadline reached");
                return Ok(pending);
            };
            if self.shared.pass(DateTime::<Utc>::MAX_UTC, true) == 0 {
                std::thread::sleep(self.shared.poll_interval.min(remaining));
            }
        }
    }
}

impl Drop for DeliveryWorker {
    fn drop(&mut self) {
        if self.state() != WorkerState::Stopped {
            self.stop(self.shared.poll_interval * 2);
        }
    }
}
