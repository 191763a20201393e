//! Tests for live subscriptions

use std::time::Duration;

use chrono::{TimeZone, Utc};

use super::*;
use crate::config::StreamConfig;
use crate::layout::DataLayout;
use crate::record::{LiveRecord, MetricPoint, RunStatus};
use crate::sidecar::RunMeta;
use crate::store::{ArchiveStore, JsonlStore, MetricStore};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(400);

fn point(step: i64) -> MetricPoint {
    let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(step);
    MetricPoint::at(ts, step).with_metric("loss", 1.0 / (step + 1) as f64)
}

async fn next(sub: &mut Subscription) -> LiveRecord {
    match sub.recv_timeout(WAIT).await {
        RecvOutcome::Record(record) => record,
        other => panic!("expected a record, got {other:?}"),
    }
}

fn step_of(record: &LiveRecord) -> i64 {
    record.as_metric().map(|p| p.step).expect("metric record")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_catch_up_then_live() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let mut store = JsonlStore::open(layout.log_path("mnist", "r1")).unwrap();
    store.save(&point(1)).unwrap();
    store.save(&point(0)).unwrap();
    RunMeta::update_status(&layout.meta_path("mnist", "r1"), RunStatus::Running, None).unwrap();

    let mux = ChangeMultiplexer::instance(dir.path()).unwrap();
    let mut sub = mux.subscribe(Targets::new().run("mnist", "r1"), None).unwrap();
    assert_eq!(sub.pending_catch_up(), 3);

    // history is replayed sorted, followed by the current status
    assert_eq!(step_of(&next(&mut sub).await), 0);
    assert_eq!(step_of(&next(&mut sub).await), 1);
    let status = next(&mut sub).await;
    assert_eq!(status.as_status().unwrap().status, RunStatus::Running);

    store.save(&point(2)).unwrap();
    let live = next(&mut sub).await;
    assert_eq!(live.project(), "mnist");
    assert_eq!(live.run(), "r1");
    assert_eq!(step_of(&live), 2);
    assert_eq!(sub.recv_timeout(QUIET).await, RecvOutcome::TimedOut);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_catch_up_respects_since() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let mut store = JsonlStore::open(layout.log_path("p", "r")).unwrap();
    for step in 0..5 {
        store.save(&point(step)).unwrap();
    }

    let mux = ChangeMultiplexer::instance(dir.path()).unwrap();
    let since = point(3).timestamp;
    let mut sub = mux.subscribe(Targets::new().project("p"), Some(since)).unwrap();
    assert_eq!(step_of(&next(&mut sub).await), 3);
    assert_eq!(step_of(&next(&mut sub).await), 4);
    assert_eq!(sub.recv_timeout(QUIET).await, RecvOutcome::TimedOut);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fan_out_to_matching_subscriptions_only() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    std::fs::create_dir_all(layout.project_dir("a")).unwrap();
    std::fs::create_dir_all(layout.project_dir("b")).unwrap();

    let mux = ChangeMultiplexer::instance(dir.path()).unwrap();
    let mut first = mux.subscribe(Targets::new().run("a", "r1"), None).unwrap();
    let mut second = mux.subscribe(Targets::new().project("a"), None).unwrap();
    let mut other = mux.subscribe(Targets::new().project("b"), None).unwrap();
    assert_eq!(mux.subscriber_count(), 3);

    let mut store = JsonlStore::open(layout.log_path("a", "r1")).unwrap();
    store.save(&point(7)).unwrap();

    assert_eq!(step_of(&next(&mut first).await), 7);
    assert_eq!(step_of(&next(&mut second).await), 7);
    assert_eq!(other.recv_timeout(QUIET).await, RecvOutcome::TimedOut);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_event_only_on_transition() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let meta_path = layout.meta_path("p", "r");
    RunMeta::update_status(&meta_path, RunStatus::Running, None).unwrap();

    let mux = ChangeMultiplexer::instance(dir.path()).unwrap();
    let mut sub = mux.subscribe(Targets::new().run("p", "r"), None).unwrap();
    assert!(next(&mut sub).await.as_status().is_some());

    // same status, new timestamp: no event
    RunMeta::update_status(&meta_path, RunStatus::Running, None).unwrap();
    assert_eq!(sub.recv_timeout(QUIET).await, RecvOutcome::TimedOut);

    RunMeta::update_status(&meta_path, RunStatus::Failed, Some(3)).unwrap();
    let record = next(&mut sub).await;
    let event = record.as_status().unwrap();
    assert_eq!(event.status, RunStatus::Failed);
    assert!(event.is_finished);
    assert_eq!(event.exit_code, Some(3));
    assert_eq!(sub.recv_timeout(QUIET).await, RecvOutcome::TimedOut);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_archive_run_catch_up_and_truncation() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let mut store = ArchiveStore::open(layout.wal_path("p", "r"), layout.archive_dir("p", "r"), 1).unwrap();
    store.save(&point(0)).unwrap();
    store.save(&point(1)).unwrap();

    let mux = ChangeMultiplexer::instance(dir.path()).unwrap();
    let mut sub = mux.subscribe(Targets::new().run("p", "r"), None).unwrap();
    assert_eq!(step_of(&next(&mut sub).await), 0);
    assert_eq!(step_of(&next(&mut sub).await), 1);

    // compacts step 1 away, truncating the WAL under the reader
    store.save(&point(2)).unwrap();
    assert_eq!(step_of(&next(&mut sub).await), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partial_line_is_delivered_once_complete() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let path = layout.log_path("p", "r");
    std::fs::create_dir_all(layout.project_dir("p")).unwrap();
    std::fs::write(&path, "").unwrap();

    let mux = ChangeMultiplexer::instance(dir.path()).unwrap();
    let mut sub = mux.subscribe(Targets::new().run("p", "r"), None).unwrap();

    let line = point(5).to_json_line().unwrap();
    let (head, tail) = line.split_at(10);
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(head.as_bytes()).unwrap();
    file.sync_all().unwrap();
    assert_eq!(sub.recv_timeout(QUIET).await, RecvOutcome::TimedOut);

    file.write_all(tail.as_bytes()).unwrap();
    file.sync_all().unwrap();
    assert_eq!(step_of(&next(&mut sub).await), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_is_idempotent_and_stops_watch() {
    let dir = tempfile::tempdir().unwrap();
    let mux = ChangeMultiplexer::instance_with_config(
        dir.path(),
        StreamConfig {
            stop_timeout_ms: 500,
            ..StreamConfig::default()
        },
    )
    .unwrap();
    let mut first = mux.subscribe(Targets::new().project("p"), None).unwrap();
    let second = mux.subscribe(Targets::new().project("p"), None).unwrap();
    assert!(mux.is_watching());

    first.close();
    first.close();
    assert_eq!(mux.subscriber_count(), 1);
    assert!(mux.is_watching());
    assert_eq!(first.recv().await, None);
    assert_eq!(first.recv_timeout(QUIET).await, RecvOutcome::Closed);

    let second_id = second.id();
    drop(second);
    assert!(!mux.unsubscribe(second_id));
    assert_eq!(mux.subscriber_count(), 0);
    assert!(!mux.is_watching());

    // a new subscriber restarts the watch
    let _third = mux.subscribe(Targets::new().project("p"), None).unwrap();
    assert!(mux.is_watching());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_instance_is_shared_per_root() {
    let dir = tempfile::tempdir().unwrap();
    let a = ChangeMultiplexer::instance(dir.path()).unwrap();
    let b = ChangeMultiplexer::instance(dir.path().join(".")).unwrap();
    assert!(std::sync::Arc::ptr_eq(&a, &b));

    let other = tempfile::tempdir().unwrap();
    let c = ChangeMultiplexer::instance(other.path()).unwrap();
    assert!(!std::sync::Arc::ptr_eq(&a, &c));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscription_as_stream() {
    use futures::StreamExt;

    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let mut store = JsonlStore::open(layout.log_path("p", "r")).unwrap();
    store.save(&point(0)).unwrap();

    let mux = ChangeMultiplexer::instance(dir.path()).unwrap();
    let mut sub = mux.subscribe(Targets::new().project("p"), None).unwrap();
    let first = tokio::time::timeout(WAIT, sub.next()).await.unwrap().unwrap();
    assert_eq!(step_of(&first), 0);

    store.save(&point(1)).unwrap();
    let second = tokio::time::timeout(WAIT, sub.next()).await.unwrap().unwrap();
    assert_eq!(step_of(&second), 1);

    mux.shutdown();
    assert!(tokio::time::timeout(WAIT, sub.next()).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_points_compacted_between_batches_are_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    std::fs::create_dir_all(layout.project_dir("p")).unwrap();

    let mux = ChangeMultiplexer::instance(dir.path()).unwrap();
    let mut sub = mux.subscribe(Targets::new().run("p", "r"), None).unwrap();
    assert_eq!(sub.pending_catch_up(), 0);

    // every save after the first compacts the previous point away
    let mut store = ArchiveStore::open(layout.wal_path("p", "r"), layout.archive_dir("p", "r"), 1).unwrap();
    for step in 0..5 {
        store.save(&point(step)).unwrap();
    }

    let mut steps = Vec::new();
    for _ in 0..5 {
        steps.push(step_of(&next(&mut sub).await));
    }
    assert_eq!(steps, vec![0, 1, 2, 3, 4]);
    assert_eq!(sub.recv_timeout(QUIET).await, RecvOutcome::TimedOut);
    assert_eq!(store.load(None).unwrap().steps(), steps);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_archive_catch_up_reads_newest_partitions_only() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let mut store = ArchiveStore::open(layout.wal_path("p", "r"), layout.archive_dir("p", "r"), 1 << 20).unwrap();
    for day in 0..3 {
        for step in 0..2 {
            store.save(&point(day * 86_400 + step)).unwrap();
        }
    }
    store.finish().unwrap();

    let mux = ChangeMultiplexer::instance_with_config(
        dir.path(),
        StreamConfig {
            tail_threshold_bytes: 1,
            tail_bytes: 1,
            ..StreamConfig::default()
        },
    )
    .unwrap();
    let mut sub = mux.subscribe(Targets::new().run("p", "r"), None).unwrap();
    assert_eq!(sub.pending_catch_up(), 2);
    assert_eq!(step_of(&next(&mut sub).await), 2 * 86_400);
    assert_eq!(step_of(&next(&mut sub).await), 2 * 86_400 + 1);

    store.save(&point(2 * 86_400 + 2)).unwrap();
    assert_eq!(step_of(&next(&mut sub).await), 2 * 86_400 + 2);
    assert_eq!(sub.recv_timeout(QUIET).await, RecvOutcome::TimedOut);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_catch_up_does_not_stall_live_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let mut big = ArchiveStore::open(layout.wal_path("p", "big"), layout.archive_dir("p", "big"), 1 << 30).unwrap();
    for step in 0..2_000 {
        big.save(&point(step * 600)).unwrap();
    }
    big.finish().unwrap();
    let mut live = JsonlStore::open(layout.log_path("p", "live")).unwrap();
    live.save(&point(0)).unwrap();

    let mux = ChangeMultiplexer::instance(dir.path()).unwrap();
    let mut watcher = mux.subscribe(Targets::new().run("p", "live"), None).unwrap();
    assert_eq!(step_of(&next(&mut watcher).await), 0);

    let catching_up = {
        let mux = std::sync::Arc::clone(&mux);
        tokio::task::spawn_blocking(move || mux.subscribe(Targets::new().run("p", "big"), None))
    };
    live.save(&point(1)).unwrap();
    assert_eq!(step_of(&next(&mut watcher).await), 1);

    let late = catching_up.await.unwrap().unwrap();
    assert_eq!(late.pending_catch_up(), 2_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_consumer_does_not_stall_others() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    std::fs::create_dir_all(layout.project_dir("p")).unwrap();

    let mux = ChangeMultiplexer::instance(dir.path()).unwrap();
    let mut idle = mux.subscribe(Targets::new().run("p", "r"), None).unwrap();
    let mut active = mux.subscribe(Targets::new().run("p", "r"), None).unwrap();

    let mut store = JsonlStore::open(layout.log_path("p", "r")).unwrap();
    for step in 0..50 {
        store.save(&point(step)).unwrap();
    }
    for step in 0..50 {
        assert_eq!(step_of(&next(&mut active).await), step);
    }

    // everything the idle subscription missed is buffered, in order
    for step in 0..50 {
        match idle.recv_timeout(Duration::ZERO).await {
            RecvOutcome::Record(record) => assert_eq!(step_of(&record), step),
            other => panic!("step {step} not buffered: {other:?}"),
        }
    }
    assert_eq!(idle.recv_timeout(QUIET).await, RecvOutcome::TimedOut);
}
