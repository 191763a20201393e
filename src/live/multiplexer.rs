//! Process-wide change multiplexer
//!
//! One [`ChangeMultiplexer`] exists per data root. It owns a single
//! recursive `notify` watch and a dispatch thread that turns change
//! notifications into [`LiveRecord`]s for every registered subscription.
//! The watch is started by the first subscription and torn down when the
//! last one goes away.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::layout::{DataLayout, FileKind};
use crate::record::{LiveRecord, MetricPoint, RunStatus};
use crate::sidecar::RunMeta;
use crate::store::parquet;
use crate::store::MetricFrame;

use super::subscription::Subscription;
use super::tail::{self, Chunk, TailPos};
use super::targets::Targets;

/// How often the dispatch thread checks its stop flag while idle
const IDLE_POLL: Duration = Duration::from_millis(100);

static INSTANCES: LazyLock<Mutex<HashMap<PathBuf, Arc<ChangeMultiplexer>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fan-out watcher shared by every subscription on one data root
#[derive(Debug)]
pub struct ChangeMultiplexer {
    layout: DataLayout,
    config: StreamConfig,
    registry: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
}

#[derive(Debug, Default)]
struct Registry {
    subscriptions: HashMap<u64, SubscriptionEntry>,
    watch: Option<WatchHandle>,
}

type RunKey = (String, String);
type PointKey = (DateTime<Utc>, i64);

/// Kinds of run files touched within one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Changes {
    log: bool,
    wal: bool,
    archive: bool,
    meta: bool,
}

impl Changes {
    fn mark(&mut self, kind: FileKind) {
        match kind {
            FileKind::Log => self.log = true,
            FileKind::Wal => self.wal = true,
            FileKind::Archive => self.archive = true,
            FileKind::Meta => self.meta = true,
        }
    }

    fn merge(&mut self, other: Changes) {
        self.log |= other.log;
        self.wal |= other.wal;
        self.archive |= other.archive;
        self.meta |= other.meta;
    }
}

/// Per-subscription read state gathered by catch-up
#[derive(Debug, Default)]
struct CatchUp {
    backlog: VecDeque<LiveRecord>,
    tails: HashMap<PathBuf, TailPos>,
    watermarks: HashMap<RunKey, PointKey>,
    statuses: HashMap<RunKey, Option<RunStatus>>,
}

#[derive(Debug)]
struct SubscriptionEntry {
    targets: Targets,
    since: Option<DateTime<Utc>>,
    tails: HashMap<PathBuf, TailPos>,
    /// Newest `(timestamp, step)` seen per run; archive rows above it were
    /// compacted before the tail could read them from the WAL
    watermarks: HashMap<RunKey, PointKey>,
    /// Points recovered from the archive that the WAL may still hold until
    /// its truncation is observed
    recovered: HashMap<RunKey, HashSet<PointKey>>,
    statuses: HashMap<RunKey, Option<RunStatus>>,
    /// Changes seen while catch-up was still reading; `None` once live
    missed: Option<BTreeMap<RunKey, Changes>>,
    tx: mpsc::UnboundedSender<LiveRecord>,
    shutdown: watch::Sender<bool>,
}

impl SubscriptionEntry {
    fn accepts(&self, point: &MetricPoint) -> bool {
        self.since.map_or(true, |since| point.timestamp >= since)
    }

    fn push(&self, record: LiveRecord) {
        // a closed receiver means the subscription is being dropped
        let _ = self.tx.send(record);
    }

    fn go_live(&mut self, state: CatchUp) -> BTreeMap<RunKey, Changes> {
        self.tails = state.tails;
        self.watermarks = state.watermarks;
        self.statuses = state.statuses;
        self.missed.take().unwrap_or_default()
    }

    fn emit(&mut self, project: &str, run: &str, points: Vec<MetricPoint>) {
        let mut newest = None;
        for point in points {
            newest = newest.max(Some(point.sort_key()));
            if self.accepts(&point) {
                self.push(LiveRecord::metric(project, run, point));
            }
        }
        if let Some(newest) = newest {
            let mark = self
                .watermarks
                .entry((project.to_string(), run.to_string()))
                .or_insert(newest);
            *mark = (*mark).max(newest);
        }
    }
}

#[derive(Debug)]
struct WatchHandle {
    watcher: RecommendedWatcher,
    stop: Arc<AtomicBool>,
    done: std_mpsc::Receiver<()>,
    thread: JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the dispatch thread, waiting at most `timeout`
    fn stop(self, timeout: Duration) {
        let Self {
            watcher,
            stop,
            done,
            thread,
        } = self;
        stop.store(true, Ordering::SeqCst);
        // dropping the watcher disconnects the event channel
        drop(watcher);
        match done.recv_timeout(timeout) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                if thread.join().is_err() {
                    tracing::warn!("dispatch thread panicked");
                }
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(?timeout, "dispatch thread did not stop in time, detaching");
            }
        }
    }
}

impl ChangeMultiplexer {
    /// Shared instance for `root`, created on first use
    pub fn instance(root: impl AsRef<Path>) -> Result<Arc<Self>> {
        Self::instance_with_config(root, StreamConfig::default())
    }

    /// Like [`instance`](Self::instance); `config` only applies when this
    /// call creates the instance
    pub fn instance_with_config(root: impl AsRef<Path>, config: StreamConfig) -> Result<Arc<Self>> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let root = root.canonicalize()?;

        let mut instances = lock(&INSTANCES);
        if let Some(existing) = instances.get(&root) {
            return Ok(Arc::clone(existing));
        }
        let mux = Arc::new(Self {
            layout: DataLayout::new(&root),
            config,
            registry: Arc::new(Mutex::new(Registry::default())),
            next_id: AtomicU64::new(1),
        });
        instances.insert(root.clone(), Arc::clone(&mux));
        tracing::debug!(root = %root.display(), "created change multiplexer");
        Ok(mux)
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).subscriptions.len()
    }

    /// Whether the shared watch is currently running
    pub fn is_watching(&self) -> bool {
        lock(&self.registry).watch.is_some()
    }

    /// Subscribe to `targets`, replaying history newer than `since`
    ///
    /// The returned subscription first yields the catch-up records, then
    /// live records as the files change.
    pub fn subscribe(self: &Arc<Self>, targets: Targets, since: Option<DateTime<Utc>>) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut registry = lock(&self.registry);
            if registry.watch.is_none() {
                registry.watch = Some(self.start_watch()?);
            }
            registry.subscriptions.insert(
                id,
                SubscriptionEntry {
                    targets: targets.clone(),
                    since,
                    tails: HashMap::new(),
                    watermarks: HashMap::new(),
                    recovered: HashMap::new(),
                    statuses: HashMap::new(),
                    missed: Some(BTreeMap::new()),
                    tx,
                    shutdown: shutdown_tx,
                },
            );
        }

        // history is read without holding the registry; the dispatch loop
        // records what changes meanwhile and it is replayed below
        let mut state = self.catch_up(&targets, since);
        let backlog = std::mem::take(&mut state.backlog);

        let mut registry = lock(&self.registry);
        let Some(entry) = registry.subscriptions.get_mut(&id) else {
            return Err(Error::Closed);
        };
        let missed = entry.go_live(state);
        let mut batch = Batch::new(&self.layout);
        for ((project, run), changes) in missed {
            deliver(entry, &project, &run, changes, &mut batch);
        }
        let subscribers = registry.subscriptions.len();
        drop(registry);

        tracing::info!(id, subscribers, backlog = backlog.len(), "subscription started");
        Ok(Subscription::new(id, backlog, rx, shutdown_rx, Arc::clone(self)))
    }

    /// Remove a subscription; returns `false` if it was already removed
    ///
    /// Removing the last subscription stops the shared watch, waiting at
    /// most the configured stop timeout.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let stopping = {
            let mut registry = lock(&self.registry);
            let Some(entry) = registry.subscriptions.remove(&id) else {
                return false;
            };
            let _ = entry.shutdown.send(true);
            tracing::info!(id, subscribers = registry.subscriptions.len(), "subscription ended");
            if registry.subscriptions.is_empty() {
                registry.watch.take()
            } else {
                None
            }
        };
        if let Some(handle) = stopping {
            handle.stop(self.config.stop_timeout());
            tracing::debug!(root = %self.root().display(), "stopped watching data root");
        }
        true
    }

    /// Close every subscription and stop the watch
    pub fn shutdown(&self) {
        let stopping = {
            let mut registry = lock(&self.registry);
            for (_, entry) in registry.subscriptions.drain() {
                let _ = entry.shutdown.send(true);
            }
            registry.watch.take()
        };
        if let Some(handle) = stopping {
            handle.stop(self.config.stop_timeout());
        }
    }

    fn start_watch(&self) -> Result<WatchHandle> {
        let (event_tx, event_rx) = std_mpsc::channel();
        let mut watcher = RecommendedWatcher::new(event_tx, notify::Config::default())?;
        watcher.watch(self.layout.root(), RecursiveMode::Recursive)?;

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = std_mpsc::channel();
        let dispatcher = Dispatcher {
            layout: self.layout.clone(),
            registry: Arc::clone(&self.registry),
            window: self.config.batch_window(),
            stop: Arc::clone(&stop),
        };
        let thread = std::thread::Builder::new()
            .name("entrenar-live-dispatch".to_string())
            .spawn(move || {
                dispatcher.run(event_rx);
                let _ = done_tx.send(());
            })?;

        tracing::debug!(root = %self.root().display(), "watching data root");
        Ok(WatchHandle {
            watcher,
            stop,
            done,
            thread,
        })
    }

    fn catch_up(&self, targets: &Targets, since: Option<DateTime<Utc>>) -> CatchUp {
        let mut state = CatchUp::default();
        for (project, run) in targets.resolve(&self.layout) {
            let mut points = self.archived_points(&project, &run, since);

            for path in [self.layout.log_path(&project, &run), self.layout.wal_path(&project, &run)] {
                match tail::read_catch_up(&path, self.config.tail_threshold_bytes, self.config.tail_bytes) {
                    Ok(chunk) => {
                        state.tails.insert(path, chunk.pos);
                        points.extend(chunk.points);
                    }
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "catch-up read failed"),
                }
            }
            points.sort_by_key(MetricPoint::sort_key);
            // rows can sit in both the archive and the WAL mid-compaction
            points.dedup_by_key(|point| point.sort_key());
            if let Some(newest) = points.last() {
                state.watermarks.insert((project.clone(), run.clone()), newest.sort_key());
            }
            state.backlog.extend(
                points
                    .into_iter()
                    .filter(|point| since.map_or(true, |since| point.timestamp >= since))
                    .map(|point| LiveRecord::metric(&project, &run, point)),
            );

            let meta = read_meta(&self.layout.meta_path(&project, &run));
            state
                .statuses
                .insert((project.clone(), run.clone()), meta.as_ref().and_then(|m| m.status));
            if let Some(event) = meta.and_then(|m| m.status_event(&project, &run)) {
                state.backlog.push_back(LiveRecord::Status(event));
            }
        }
        state
    }

    /// Archived history for catch-up, limited to the newest partitions once
    /// the archive outgrows the tail threshold
    fn archived_points(&self, project: &str, run: &str, since: Option<DateTime<Utc>>) -> Vec<MetricPoint> {
        let dir = self.layout.archive_dir(project, run);
        let from = since.map(|since| since.date_naive());
        let read = || -> Result<Vec<MetricPoint>> {
            let mut partitions = Vec::new();
            for (date, path) in parquet::list_partitions(&dir)? {
                if from.is_some_and(|from| date < from) {
                    continue;
                }
                let size = parquet::partition_size(&path)?;
                partitions.push((path, size));
            }
            let total = partitions.len();
            let selected = newest_within(partitions, self.config.tail_threshold_bytes, self.config.tail_bytes);
            if selected.len() < total {
                tracing::debug!(
                    archive = %dir.display(),
                    read = selected.len(),
                    skipped = total - selected.len(),
                    "catching up from newest archive partitions"
                );
            }
            let mut rows = Vec::new();
            for path in &selected {
                rows.extend(parquet::read_partition(path)?);
            }
            Ok(MetricFrame::from_long(rows).to_points())
        };
        match read() {
            Ok(points) => points,
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "archive catch-up failed");
                Vec::new()
            }
        }
    }
}

/// Partitions (oldest first) to read: all of them when their total size is
/// within `threshold`, otherwise the newest ones until `budget` bytes are
/// covered, always at least one
fn newest_within(partitions: Vec<(PathBuf, u64)>, threshold: u64, budget: u64) -> Vec<PathBuf> {
    let total: u64 = partitions.iter().map(|(_, size)| size).sum();
    if total <= threshold {
        return partitions.into_iter().map(|(path, _)| path).collect();
    }
    let mut covered = 0;
    let mut selected = Vec::new();
    for (path, size) in partitions.into_iter().rev() {
        if !selected.is_empty() && covered >= budget {
            break;
        }
        covered += size;
        selected.push(path);
    }
    selected.reverse();
    selected
}

fn read_meta(path: &Path) -> Option<RunMeta> {
    match RunMeta::read(path) {
        Ok(meta) => meta,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "unreadable sidecar");
            None
        }
    }
}

/// State moved onto the dispatch thread
struct Dispatcher {
    layout: DataLayout,
    registry: Arc<Mutex<Registry>>,
    window: Duration,
    stop: Arc<AtomicBool>,
}

impl Dispatcher {
    fn run(self, events: std_mpsc::Receiver<notify::Result<Event>>) {
        while !self.stop.load(Ordering::SeqCst) {
            let first = match events.recv_timeout(IDLE_POLL) {
                Ok(event) => event,
                Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            };
            let mut changed = BTreeMap::new();
            self.collect(first, &mut changed);

            let deadline = Instant::now() + self.window;
            while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
                match events.recv_timeout(remaining) {
                    Ok(event) => self.collect(event, &mut changed),
                    Err(_) => break,
                }
            }
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            if !changed.is_empty() {
                dispatch(&self.layout, &mut lock(&self.registry), &changed);
            }
        }
        tracing::debug!("dispatch loop exited");
    }

    fn collect(&self, event: notify::Result<Event>, changed: &mut BTreeMap<RunKey, Changes>) {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "watch error");
                return;
            }
        };
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }
        for file in event.paths.iter().filter_map(|path| self.layout.classify(path)) {
            changed.entry((file.project, file.run)).or_default().mark(file.kind);
        }
    }
}

/// Reads shared by every subscription within one batch
struct Batch<'a> {
    layout: &'a DataLayout,
    tails: HashMap<(PathBuf, TailPos), Option<Chunk>>,
    archives: HashMap<(RunKey, Option<NaiveDate>), Vec<MetricPoint>>,
    metas: HashMap<RunKey, Option<Option<RunMeta>>>,
}

impl<'a> Batch<'a> {
    fn new(layout: &'a DataLayout) -> Self {
        Self {
            layout,
            tails: HashMap::new(),
            archives: HashMap::new(),
            metas: HashMap::new(),
        }
    }

    fn tail(&mut self, path: &Path, pos: &TailPos) -> Option<Chunk> {
        self.tails
            .entry((path.to_path_buf(), pos.clone()))
            .or_insert_with(|| match tail::read_from(path, pos) {
                Ok(chunk) => Some(chunk),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "tail read failed");
                    None
                }
            })
            .clone()
    }

    /// Archived points of a run from partitions dated `from` or later
    fn archive(&mut self, project: &str, run: &str, from: Option<NaiveDate>) -> &[MetricPoint] {
        let layout = self.layout;
        self.archives
            .entry(((project.to_string(), run.to_string()), from))
            .or_insert_with(|| {
                let dir = layout.archive_dir(project, run);
                match parquet::read_archive(&dir, from) {
                    Ok(rows) => MetricFrame::from_long(rows).to_points(),
                    Err(e) => {
                        tracing::warn!(path = %dir.display(), error = %e, "archive read failed");
                        Vec::new()
                    }
                }
            })
    }

    /// Sidecar of a run; `None` if it could not be read
    fn meta(&mut self, project: &str, run: &str) -> Option<&Option<RunMeta>> {
        let layout = self.layout;
        self.metas
            .entry((project.to_string(), run.to_string()))
            .or_insert_with(|| {
                let path = layout.meta_path(project, run);
                match RunMeta::read(&path) {
                    Ok(meta) => Some(meta),
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "unreadable sidecar");
                        None
                    }
                }
            })
            .as_ref()
    }
}

/// Push the records produced by one batch of changed runs
fn dispatch(layout: &DataLayout, registry: &mut Registry, changed: &BTreeMap<RunKey, Changes>) {
    let mut batch = Batch::new(layout);
    for entry in registry.subscriptions.values_mut() {
        for ((project, run), changes) in changed {
            if !entry.targets.matches(project, run) {
                continue;
            }
            if let Some(missed) = entry.missed.as_mut() {
                missed.entry((project.clone(), run.clone())).or_default().merge(*changes);
                continue;
            }
            deliver(entry, project, run, *changes, &mut batch);
        }
    }
}

/// Bring one subscription up to date with one run
fn deliver(entry: &mut SubscriptionEntry, project: &str, run: &str, changes: Changes, batch: &mut Batch<'_>) {
    if changes.log {
        let path = batch.layout.log_path(project, run);
        let pos = entry.tails.get(&path).cloned().unwrap_or_default();
        if let Some(chunk) = batch.tail(&path, &pos) {
            entry.tails.insert(path, chunk.pos);
            entry.emit(project, run, chunk.points);
        }
    }

    if changes.wal || changes.archive {
        let path = batch.layout.wal_path(project, run);
        let pos = entry.tails.get(&path).cloned().unwrap_or_default();
        let chunk = batch.tail(&path, &pos);
        let run_key = (project.to_string(), run.to_string());
        let watermark = entry.watermarks.get(&run_key).copied();
        let above = |point: &MetricPoint| watermark.map_or(true, |mark| point.sort_key() > mark);

        let restarted = chunk.as_ref().is_some_and(|chunk| chunk.restarted);
        let mut points = Vec::new();
        if let Some(chunk) = chunk {
            entry.tails.insert(path, chunk.pos);
            points = chunk.points;
            if restarted {
                // a refilled WAL may repeat points already recovered below
                entry.recovered.remove(&run_key);
                points.retain(|point| above(point));
            } else if let Some(recovered) = entry.recovered.get(&run_key) {
                points.retain(|point| !recovered.contains(&point.sort_key()));
            }
        }
        if restarted || changes.archive {
            // points compacted before the tail reached them
            let in_wal: HashSet<PointKey> = points.iter().map(MetricPoint::sort_key).collect();
            let compacted: Vec<MetricPoint> = batch
                .archive(project, run, watermark.map(|(timestamp, _)| timestamp.date_naive()))
                .iter()
                .filter(|point| above(*point) && !in_wal.contains(&point.sort_key()))
                .cloned()
                .collect();
            if !compacted.is_empty() {
                tracing::debug!(project, run, recovered = compacted.len(), "recovered compacted points");
                entry
                    .recovered
                    .entry(run_key)
                    .or_default()
                    .extend(compacted.iter().map(MetricPoint::sort_key));
                points.extend(compacted);
                points.sort_by_key(MetricPoint::sort_key);
            }
        }
        entry.emit(project, run, points);
    }

    if changes.meta {
        let Some(meta) = batch.meta(project, run) else {
            return;
        };
        let status = meta.as_ref().and_then(|m| m.status);
        let key = (project.to_string(), run.to_string());
        if entry.statuses.get(&key) == Some(&status) {
            return;
        }
        entry.statuses.insert(key, status);
        if let Some(event) = meta.as_ref().and_then(|m| m.status_event(project, run)) {
            entry.push(LiveRecord::Status(event));
        }
    }
}
