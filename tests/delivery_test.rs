//! Integration tests for the reliable delivery queue

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use entrenar_live::config::{BackoffConfig, DeliveryConfig};
use entrenar_live::delivery::{Backoff, Client, ClientError, Delivery, DeliveryQueue, QueueItem, ReliableSender};
use entrenar_live::DataLayout;

#[derive(Default)]
struct FlakyCollector {
    down: AtomicBool,
    steps: Mutex<Vec<i64>>,
}

impl Client for FlakyCollector {
    fn save_metrics(
        &self,
        _project: &str,
        _run: &str,
        step: i64,
        _metrics: &BTreeMap<String, f64>,
        _timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), ClientError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ClientError::Unavailable);
        }
        self.steps.lock().unwrap().push(step);
        Ok(())
    }

    fn health_check(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }
}

#[test]
fn test_backoff_bounds() {
    let backoff = Backoff::new(BackoffConfig::default());
    for _ in 0..100 {
        let first = backoff.delay(0);
        assert!(first >= Duration::from_millis(900) && first <= Duration::from_millis(1100));
        let fifth = backoff.delay(4);
        assert!(fifth >= Duration::from_millis(14_400) && fifth <= Duration::from_millis(17_600));
        assert!(backoff.delay(100) <= Duration::from_secs(330));
    }
}

#[test]
fn test_queue_orders_by_step_then_enqueue_time() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let queue = DeliveryQueue::open(&DataLayout::new(dir.path()), "p", "r", &DeliveryConfig::default())
        .expect("operation should succeed");

    let now = Utc::now();
    let logged_at = DateTime::from_timestamp(1_714_564_800, 0).expect("valid timestamp");
    let mut ids = Vec::new();
    for step in [5, 1, 3, 1] {
        let item = QueueItem::new(step, BTreeMap::from([("loss".to_string(), 0.1)]), Some(logged_at));
        ids.push((step, item.id));
        queue.enqueue(item).expect("operation should succeed");
    }
    let mut not_ready = QueueItem::new(0, BTreeMap::new(), None);
    not_ready.next_retry_at = now + chrono::Duration::minutes(5);
    queue.enqueue(not_ready).expect("operation should succeed");

    let ready = queue.ready_items_at(now + chrono::Duration::seconds(1), 100).expect("operation should succeed");
    let order: Vec<_> = ready.iter().map(|i| (i.step, i.id)).collect();
    assert_eq!(order, vec![ids[1], ids[3], ids[2], ids[0]]);
    assert_eq!(ready[0].timestamp, Some(logged_at));

    let removed = queue.dequeue(&[ids[1].1, ids[2].1]).expect("operation should succeed");
    assert_eq!(removed, 2);
    assert_eq!(queue.len(), 3);
    let stats = queue.stats();
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.dropped_total, 0);
}

#[test]
fn test_outage_is_ridden_out() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let layout = DataLayout::new(dir.path());
    let config = DeliveryConfig {
        poll_interval_ms: 10,
        health_ttl_secs: 0,
        backoff: BackoffConfig {
            base_secs: 0.01,
            max_secs: 0.05,
            jitter: 0.1,
        },
        ..DeliveryConfig::default()
    };
    let collector = Arc::new(FlakyCollector::default());
    let sender = ReliableSender::new(&layout, "p", "r", collector.clone(), &config)
        .expect("operation should succeed");

    collector.down.store(true, Ordering::SeqCst);
    for step in 0..5 {
        let outcome = sender
            .send(step, &BTreeMap::from([("loss".to_string(), step as f64)]), None)
            .expect("operation should succeed");
        assert_eq!(outcome, Delivery::Queued);
    }
    assert!(layout.queue_path("p", "r").exists());

    collector.down.store(false, Ordering::SeqCst);
    let left = sender.finish(Duration::from_secs(5)).expect("operation should succeed");
    assert_eq!(left, 0);
    assert_eq!(*collector.steps.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert!(!layout.queue_path("p", "r").exists());
    assert!(!layout.queue_meta_path("p", "r").exists());
}
