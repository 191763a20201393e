//! On-disk layout of the data directory
//!
//! ```text
//! {root}/{project}/{run}.jsonl                          simple backend
//! {root}/{project}/{run}.wal.jsonl                      archiving backend WAL
//! {root}/{project}/{run}_archive/date=YYYY-MM-DD/*.parquet
//! {root}/{project}/{run}.meta.json                      status sidecar
//! {root}/.queue/{project}/{run}.queue.jsonl             delivery queue
//! {root}/.queue/{project}/{run}.queue.meta.json
//! ```

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use chrono::NaiveDate;

const LOG_SUFFIX: &str = ".jsonl";
const WAL_SUFFIX: &str = ".wal.jsonl";
const META_SUFFIX: &str = ".meta.json";
const ARCHIVE_SUFFIX: &str = "_archive";
const QUEUE_DIR: &str = ".queue";

/// Kind of file a change notification refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileKind {
    /// `{run}.jsonl`
    Log,
    /// `{run}.wal.jsonl`
    Wal,
    /// Anything below `{run}_archive/`
    Archive,
    /// `{run}.meta.json`
    Meta,
}

/// A changed path resolved against the layout
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunFile {
    pub project: String,
    pub run: String,
    pub kind: FileKind,
    pub path: PathBuf,
}

/// Path arithmetic for one data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.root.join(project)
    }

    pub fn log_path(&self, project: &str, run: &str) -> PathBuf {
        self.project_dir(project).join(format!("{run}{LOG_SUFFIX}"))
    }

    pub fn wal_path(&self, project: &str, run: &str) -> PathBuf {
        self.project_dir(project).join(format!("{run}{WAL_SUFFIX}"))
    }

    pub fn archive_dir(&self, project: &str, run: &str) -> PathBuf {
        self.project_dir(project).join(format!("{run}{ARCHIVE_SUFFIX}"))
    }

    pub fn meta_path(&self, project: &str, run: &str) -> PathBuf {
        self.project_dir(project).join(format!("{run}{META_SUFFIX}"))
    }

    pub fn queue_path(&self, project: &str, run: &str) -> PathBuf {
        self.root.join(QUEUE_DIR).join(project).join(format!("{run}.queue.jsonl"))
    }

    pub fn queue_meta_path(&self, project: &str, run: &str) -> PathBuf {
        self.root.join(QUEUE_DIR).join(project).join(format!("{run}.queue.meta.json"))
    }

    /// Resolve a changed path to the run file it belongs to
    ///
    /// Returns `None` for paths outside the root, the queue directory,
    /// temporary files and anything not following the layout.
    pub fn classify(&self, path: &Path) -> Option<RunFile> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut parts = relative.components().filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        });
        let project = parts.next()?;
        if project.starts_with('.') {
            return None;
        }
        let name = parts.next()?;
        let nested = parts.next().is_some();

        let (run, kind) = if let Some(run) = name.strip_suffix(ARCHIVE_SUFFIX) {
            (run, FileKind::Archive)
        } else if nested {
            return None;
        } else {
            parse_run_file_name(name)?
        };
        if run.is_empty() {
            return None;
        }
        Some(RunFile {
            project: project.to_string(),
            run: run.to_string(),
            kind,
            path: path.to_path_buf(),
        })
    }

    /// Every run with at least one file in the project directory
    pub fn discover_runs(&self, project: &str) -> std::io::Result<BTreeSet<String>> {
        let dir = self.project_dir(project);
        let mut runs = BTreeSet::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let run = if entry.file_type()?.is_dir() {
                name.strip_suffix(ARCHIVE_SUFFIX).map(str::to_owned)
            } else {
                parse_run_file_name(&name).map(|(run, _)| run.to_owned())
            };
            if let Some(run) = run.filter(|r| !r.is_empty()) {
                runs.insert(run);
            }
        }
        Ok(runs)
    }
}

fn parse_run_file_name(name: &str) -> Option<(&str, FileKind)> {
    if let Some(run) = name.strip_suffix(WAL_SUFFIX) {
        Some((run, FileKind::Wal))
    } else if let Some(run) = name.strip_suffix(META_SUFFIX) {
        Some((run, FileKind::Meta))
    } else if let Some(run) = name.strip_suffix(LOG_SUFFIX) {
        Some((run, FileKind::Log))
    } else {
        None
    }
}

/// Directory name of a date partition (`date=YYYY-MM-DD`)
pub fn partition_name(date: NaiveDate) -> String {
    format!("date={}", date.format("%Y-%m-%d"))
}

/// Inverse of [`partition_name`]
pub fn parse_partition_name(name: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix("date=")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}
