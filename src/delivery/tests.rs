//! Tests for the delivery worker and sender

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::*;
use crate::config::DeliveryConfig;
use crate::layout::DataLayout;

#[derive(Default)]
struct FakeClient {
    offline: AtomicBool,
    failing_steps: Mutex<HashSet<i64>>,
    received: Mutex<Vec<i64>>,
    health_checks: AtomicUsize,
}

impl FakeClient {
    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn fail_step(&self, step: i64) {
        self.failing_steps.lock().unwrap().insert(step);
    }

    fn heal_step(&self, step: i64) {
        self.failing_steps.lock().unwrap().remove(&step);
    }

    fn received(&self) -> Vec<i64> {
        self.received.lock().unwrap().clone()
    }
}

impl Client for FakeClient {
    fn save_metrics(
        &self,
        _project: &str,
        _run: &str,
        step: i64,
        _metrics: &BTreeMap<String, f64>,
        _timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), ClientError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ClientError::Network("connection refused".into()));
        }
        if self.failing_steps.lock().unwrap().contains(&step) {
            return Err(ClientError::Rejected(format!("step {step}")));
        }
        self.received.lock().unwrap().push(step);
        Ok(())
    }

    fn health_check(&self) -> bool {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        !self.offline.load(Ordering::SeqCst)
    }
}

fn fast_config() -> DeliveryConfig {
    DeliveryConfig {
        poll_interval_ms: 20,
        health_ttl_secs: 0,
        ..DeliveryConfig::default()
    }
}

fn metrics(step: i64) -> BTreeMap<String, f64> {
    BTreeMap::from([("loss".to_string(), 1.0 / (step + 1) as f64)])
}

struct Fixture {
    _dir: tempfile::TempDir,
    client: Arc<FakeClient>,
    queue: Arc<DeliveryQueue>,
    worker: DeliveryWorker,
}

fn fixture(config: &DeliveryConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(FakeClient::default());
    let queue = Arc::new(DeliveryQueue::open(&DataLayout::new(dir.path()), "p", "r", config).unwrap());
    let health = Arc::new(HealthCache::new(config.health_ttl()));
    let worker = DeliveryWorker::new(Arc::clone(&queue), client.clone(), health, config);
    Fixture {
        _dir: dir,
        client,
        queue,
        worker,
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn test_pass_sends_in_step_order() {
    let f = fixture(&fast_config());
    for step in [3, 1, 2] {
        f.queue.enqueue(QueueItem::new(step, metrics(step), None)).unwrap();
    }
    assert_eq!(f.worker.process_pass(), 3);
    assert_eq!(f.client.received(), vec![1, 2, 3]);
    assert!(f.queue.is_empty());
}

#[test]
fn test_pass_stops_at_first_failure() {
    let f = fixture(&fast_config());
    for step in 0..4 {
        f.queue.enqueue(QueueItem::new(step, metrics(step), None)).unwrap();
    }
    f.client.fail_step(1);

    assert_eq!(f.worker.process_pass(), 1);
    assert_eq!(f.client.received(), vec![0]);
    assert_eq!(f.queue.len(), 3);

    // step 1 now waits for its backoff, and the steps behind it wait too
    assert!(f.queue.ready_items(10).unwrap().iter().all(|i| i.step != 1));
    let later = f.queue.ready_items_at(Utc::now() + chrono::Duration::seconds(5), 10).unwrap();
    let failed = later.iter().find(|i| i.step == 1).unwrap();
    assert_eq!(failed.retry_count, 1);
    assert!(failed.next_retry_at > Utc::now());
}

#[test]
fn test_unhealthy_collector_skips_pass() {
    let config = DeliveryConfig {
        health_ttl_secs: 30,
        ..fast_config()
    };
    let f = fixture(&config);
    f.queue.enqueue(QueueItem::new(0, metrics(0), None)).unwrap();
    f.client.set_offline(true);

    assert_eq!(f.worker.process_pass(), 0);
    assert_eq!(f.worker.process_pass(), 0);
    assert_eq!(f.client.health_checks.load(Ordering::SeqCst), 1);
    assert_eq!(f.queue.len(), 1);
    assert_eq!(f.queue.ready_items(10).unwrap()[0].retry_count, 0);
}

#[test]
fn test_worker_lifecycle() {
    let f = fixture(&fast_config());
    assert_eq!(f.worker.state(), WorkerState::Stopped);
    assert!(f.worker.start().unwrap());
    assert!(!f.worker.start().unwrap());
    assert!(f.worker.is_running());

    f.queue.enqueue(QueueItem::new(0, metrics(0), None)).unwrap();
    f.queue.enqueue(QueueItem::new(1, metrics(1), None)).unwrap();
    assert!(wait_until(Duration::from_secs(5), || f.queue.is_empty()));
    assert_eq!(f.client.received(), vec![0, 1]);

    assert!(f.worker.stop(Duration::from_secs(2)));
    assert_eq!(f.worker.state(), WorkerState::Stopped);
    assert!(f.worker.stop(Duration::from_millis(10)));

    // restartable after a stop
    assert!(f.worker.start().unwrap());
    assert!(f.worker.stop(Duration::from_secs(2)));
}

#[test]
fn test_worker_retries_after_outage() {
    let config = DeliveryConfig {
        backoff: crate::config::BackoffConfig {
            base_secs: 0.05,
            max_secs: 0.2,
            jitter: 0.0,
        },
        ..fast_config()
    };
    let f = fixture(&config);
    f.client.fail_step(0);
    f.queue.enqueue(QueueItem::new(0, metrics(0), None)).unwrap();
    f.queue.enqueue(QueueItem::new(1, metrics(1), None)).unwrap();
    f.worker.start().unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        f.queue.ready_items_at(Utc::now() + chrono::Duration::seconds(10), 1).unwrap()[0].retry_count >= 2
    }));
    assert!(f.client.received().is_empty());

    f.client.heal_step(0);
    assert!(wait_until(Duration::from_secs(5), || f.queue.is_empty()));
    assert_eq!(f.client.received(), vec![0, 1]);
    assert!(f.worker.stop(Duration::from_secs(2)));
}

#[test]
fn test_flush_drains_and_removes_files() {
    let f = fixture(&fast_config());
    let mut delayed = QueueItem::new(0, metrics(0), None);
    delayed.next_retry_at = Utc::now() + chrono::Duration::hours(1);
    f.queue.enqueue(delayed).unwrap();
    f.queue.enqueue(QueueItem::new(1, metrics(1), None)).unwrap();

    assert_eq!(f.worker.flush(Duration::from_secs(2)).unwrap(), 0);
    assert_eq!(f.client.received(), vec![0, 1]);
    assert!(!f.queue.path().exists());
}

#[test]
fn test_flush_gives_up_at_deadline() {
    let f = fixture(&fast_config());
    f.queue.enqueue(QueueItem::new(0, metrics(0), None)).unwrap();
    f.queue.enqueue(QueueItem::new(1, metrics(1), None)).unwrap();
    f.client.set_offline(true);

    let started = Instant::now();
    assert_eq!(f.worker.flush(Duration::from_millis(200)).unwrap(), 2);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(f.queue.path().exists());
}

#[test]
fn test_reliable_sender_falls_back_to_queue() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let client = Arc::new(FakeClient::default());
    let sender = ReliableSender::new(&layout, "p", "r", client.clone(), &fast_config()).unwrap();

    assert_eq!(sender.send(0, &metrics(0), None).unwrap(), Delivery::Sent);
    assert!(!sender.worker().is_running());

    client.set_offline(true);
    assert_eq!(sender.send(1, &metrics(1), None).unwrap(), Delivery::Queued);
    assert!(sender.worker().is_running());

    client.set_offline(false);
    // the queue is not empty yet, so this one queues behind step 1
    let third = sender.send(2, &metrics(2), None).unwrap();
    assert!(wait_until(Duration::from_secs(5), || sender.queue().is_empty()));
    assert_eq!(client.received(), vec![0, 1, 2]);
    assert!(matches!(third, Delivery::Queued | Delivery::Sent));

    assert_eq!(sender.finish(Duration::from_secs(2)).unwrap(), 0);
    assert!(!layout.queue_path("p", "r").exists());
}

#[test]
fn test_reliable_sender_resumes_leftover_queue() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let config = fast_config();
    DeliveryQueue::open(&layout, "p", "r", &config)
        .unwrap()
        .enqueue(QueueItem::new(7, metrics(7), None))
        .unwrap();

    let client = Arc::new(FakeClient::default());
    let sender = ReliableSender::new(&layout, "p", "r", client.clone(), &config).unwrap();
    assert!(wait_until(Duration::from_secs(5), || client.received() == vec![7]));
    assert_eq!(sender.finish(Duration::from_secs(2)).unwrap(), 0);
}

#[test]
fn test_close_uses_configured_flush_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let config = DeliveryConfig {
        flush_timeout_secs: 1,
        ..fast_config()
    };
    let client = Arc::new(FakeClient::default());
    client.set_offline(true);
    let sender = ReliableSender::new(&layout, "p", "r", client.clone(), &config).unwrap();
    for step in 0..3 {
        assert_eq!(sender.send(step, &metrics(step), None).unwrap(), Delivery::Queued);
    }

    let started = Instant::now();
    assert_eq!(sender.close().unwrap(), 3);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5));
    assert!(layout.queue_path("p", "r").exists());
}
