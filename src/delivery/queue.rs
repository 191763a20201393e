//! Durable per-run queue of metrics awaiting remote delivery
//!
//! Items live in `{data_dir}/.queue/{project}/{run}.queue.jsonl`, one JSON
//! object per line in enqueue order. Appends go straight to the file;
//! removals and retry updates rewrite it through a temp file and rename.
//! Counters are kept in memory, seeded from the file when the queue is
//! opened, and mirrored in `{run}.queue.meta.json`; appends never reread
//! the queue file.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::error::Result;
use crate::layout::DataLayout;

/// One pending remote write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub step: i64,
    pub metrics: BTreeMap<String, f64>,
    #[serde(
        default,
        with = "crate::record::timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
}

impl QueueItem {
    /// New item, ready immediately
    pub fn new(step: i64, metrics: BTreeMap<String, f64>, timestamp: Option<DateTime<Utc>>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            step,
            metrics,
            timestamp,
            created_at: now,
            retry_count: 0,
            next_retry_at: now,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at <= now
    }
}

/// Queue counters, persisted next to the queue file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub bytes: u64,
    /// Items discarded by the capacity policy since the queue was created
    pub dropped_total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct QueueState {
    pending: usize,
    bytes: u64,
    dropped_total: u64,
}

/// Bounded durable queue for one run
#[derive(Debug)]
pub struct DeliveryQueue {
    project: String,
    run: String,
    path: PathBuf,
    meta_path: PathBuf,
    max_items: usize,
    max_bytes: u64,
    drop_batch: usize,
    state: Mutex<QueueState>,
}

impl DeliveryQueue {
    /// Open (or lazily create) the queue of `project/run`
    pub fn open(layout: &DataLayout, project: &str, run: &str, config: &DeliveryConfig) -> Result<Self> {
        let path = layout.queue_path(project, run);
        let meta_path = layout.queue_meta_path(project, run);
        let dropped_total = match std::fs::read(&meta_path) {
            Ok(bytes) => serde_json::from_slice::<QueueStats>(&bytes)
                .map(|stats| stats.dropped_total)
                .unwrap_or_else(|e| {
                    tracing::warn!(path = %meta_path.display(), error = %e, "ignoring unreadable queue meta");
                    0
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let pending = read_items(&path)?.len();
        let bytes = file_len(&path)?;
        Ok(Self {
            project: project.to_string(),
            run: run.to_string(),
            path,
            meta_path,
            max_items: config.max_items,
            max_bytes: config.max_bytes,
            drop_batch: config.drop_batch(),
            state: Mutex::new(QueueState {
                pending,
                bytes,
                dropped_total,
            }),
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn run(&self) -> &str {
        &self.run
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item, dropping the oldest items if a bound is exceeded
    pub fn enqueue(&self, item: QueueItem) -> Result<()> {
        let mut state = self.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(&item)?;
        line.push('\n');
        {
            let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            file.write_all(line.as_bytes())?;
            file.sync_data()?;
        }
        state.pending += 1;
        state.bytes += line.len() as u64;

        if state.pending > self.max_items || state.bytes > self.max_bytes {
            let mut items = read_items(&self.path)?;
            let dropped = self.shed_oldest(&mut items);
            state.dropped_total += dropped as u64;
            tracing::warn!(
                project = %self.project,
                run = %self.run,
                dropped,
                remaining = items.len(),
                "delivery queue full, dropped oldest items"
            );
            self.rewrite(&mut state, &items)?;
        }
        self.write_meta(&state)
    }

    /// Remove oldest items until both bounds hold, at least one drop batch
    /// at a time; the newest item is always kept
    fn shed_oldest(&self, items: &mut Vec<QueueItem>) -> usize {
        let keep_min = 1.min(items.len());
        let removable = items.len() - keep_min;
        let mut drop = self
            .drop_batch
            .max(items.len().saturating_sub(self.max_items))
            .min(removable);
        let mut remaining: u64 = items[drop..].iter().map(encoded_len).sum();
        while remaining > self.max_bytes && drop < removable {
            remaining -= encoded_len(&items[drop]);
            drop += 1;
        }
        items.drain(..drop);
        drop
    }

    /// Items ready for another attempt, in `(step, created_at)` order
    pub fn ready_items(&self, limit: usize) -> Result<Vec<QueueItem>> {
        self.ready_items_at(Utc::now(), limit)
    }

    /// [`ready_items`](Self::ready_items) against an explicit clock
    pub fn ready_items_at(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueItem>> {
        let state = self.lock();
        if state.pending == 0 {
            return Ok(Vec::new());
        }
        let mut ready: Vec<QueueItem> = read_items(&self.path)?.into_iter().filter(|item| item.is_ready(now)).collect();
        ready.sort_by(|a, b| (a.step, a.created_at).cmp(&(b.step, b.created_at)));
        ready.truncate(limit);
        Ok(ready)
    }

    /// Remove the given ids; returns how many were removed
    pub fn dequeue(&self, ids: &[Uuid]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut state = self.lock();
        let ids: HashSet<&Uuid> = ids.iter().collect();
        let mut items = read_items(&self.path)?;
        let before = items.len();
        items.retain(|item| !ids.contains(&item.id));
        let removed = before - items.len();
        if removed > 0 {
            self.rewrite(&mut state, &items)?;
            self.write_meta(&state)?;
        }
        Ok(removed)
    }

    /// Record a failed attempt; returns `false` if the id is unknown
    pub fn update_retry_info(&self, id: Uuid, retry_count: u32, next_retry_at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.lock();
        let mut items = read_items(&self.path)?;
        let Some(item) = items.iter_mut().find(|item| item.id == id) else {
            return Ok(false);
        };
        item.retry_count = retry_count;
        item.next_retry_at = next_retry_at;
        self.rewrite(&mut state, &items)?;
        self.write_meta(&state)?;
        Ok(true)
    }

    /// Pending items, ready or not
    pub fn len(&self) -> usize {
        self.lock().pending
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats()
    }

    /// Delete the queue and meta files once nothing is pending
    ///
    /// Returns `false` and leaves the files alone if items remain.
    pub fn remove_files(&self) -> Result<bool> {
        let mut state = self.lock();
        if state.pending > 0 {
            return Ok(false);
        }
        for path in [&self.path, &self.meta_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        state.bytes = 0;
        tracing::debug!(project = %self.project, run = %self.run, "removed drained delivery queue");
        Ok(true)
    }

    /// Replace the queue file with `items` and reset the counters to match
    fn rewrite(&self, state: &mut QueueState, items: &[QueueItem]) -> Result<()> {
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp)?;
            for item in items {
                serde_json::to_writer(&mut file, item)?;
                file.write_all(b"\n")?;
            }
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        state.pending = items.len();
        state.bytes = file_len(&self.path)?;
        Ok(())
    }

    fn write_meta(&self, state: &QueueState) -> Result<()> {
        let stats = state.stats();
        let tmp = self.meta_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&stats)?)?;
        std::fs::rename(&tmp, &self.meta_path)?;
        Ok(())
    }
}

impl QueueState {
    fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending,
            bytes: self.bytes,
            dropped_total: self.dropped_total,
            updated_at: Some(Utc::now()),
        }
    }
}

fn read_items(path: &Path) -> Result<Vec<QueueItem>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut items = Vec::new();
    for line in BufReader::new(file).split(b'\n') {
        let line = line?;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<QueueItem>(&line) {
            Ok(item) => items.push(item),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping corrupted queue item"),
        }
    }
    Ok(items)
}

fn encoded_len(item: &QueueItem) -> u64 {
    serde_json::to_string(item).map_or(0, |line| line.len() as u64 + 1)
}

fn file_len(path: &Path) -> Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}
