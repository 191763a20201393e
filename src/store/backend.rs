//! Backend selection for a run
//!
//! A run is bound to one backend for its whole life. The choice is made the
//! first time the run is opened and recorded in the run sidecar; later opens
//! follow the sidecar, or the files already on disk for runs created by
//! older writers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::layout::DataLayout;
use crate::record::MetricPoint;
use crate::sidecar::RunMeta;

use super::archive::ArchiveStore;
use super::frame::MetricFrame;
use super::jsonl::JsonlStore;
use super::traits::MetricStore;

/// Storage backend of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Append-only `{run}.jsonl`
    Jsonl,
    /// `{run}.wal.jsonl` plus `{run}_archive/`
    Archive,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jsonl => "jsonl",
            Self::Archive => "archive",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jsonl" | "simple" => Ok(Self::Jsonl),
            "archive" | "parquet" | "wal" => Ok(Self::Archive),
            other => Err(Error::Config(format!("unknown store backend '{other}'"))),
        }
    }
}

/// Backend already used by a run, if any
pub fn detect_backend(layout: &DataLayout, project: &str, run: &str) -> Result<Option<BackendKind>> {
    let meta_path = layout.meta_path(project, run);
    match RunMeta::read(&meta_path) {
        Ok(Some(RunMeta {
            backend: Some(kind),
            ..
        })) => return Ok(Some(kind)),
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(path = %meta_path.display(), error = %e, "unreadable run sidecar");
        }
    }
    if layout.wal_path(project, run).exists() || layout.archive_dir(project, run).exists() {
        Ok(Some(BackendKind::Archive))
    } else if layout.log_path(project, run).exists() {
        Ok(Some(BackendKind::Jsonl))
    } else {
        Ok(None)
    }
}

/// Metric store of one run, dispatching to its backend
#[derive(Debug)]
pub enum RunStore {
    Jsonl(JsonlStore),
    Archive(ArchiveStore),
}

impl RunStore {
    /// Open a run with the backend it already uses, or the configured one
    pub fn open(layout: &DataLayout, project: &str, run: &str, config: &StoreConfig) -> Result<Self> {
        let kind = match detect_backend(layout, project, run)? {
            Some(kind) => kind,
            None => {
                record_backend(layout, project, run, config.backend)?;
                config.backend
            }
        };
        Self::open_kind(layout, project, run, kind, config)
    }

    /// Open a run requiring a specific backend
    pub fn open_as(
        layout: &DataLayout,
        project: &str,
        run: &str,
        kind: BackendKind,
        config: &StoreConfig,
    ) -> Result<Self> {
        match detect_backend(layout, project, run)? {
            Some(existing) if existing != kind => Err(Error::BackendMismatch {
                run: format!("{project}/{run}"),
                existing,
                requested: kind,
            }),
            Some(_) => Self::open_kind(layout, project, run, kind, config),
            None => {
                record_backend(layout, project, run, kind)?;
                Self::open_kind(layout, project, run, kind, config)
            }
        }
    }

    fn open_kind(
        layout: &DataLayout,
        project: &str,
        run: &str,
        kind: BackendKind,
        config: &StoreConfig,
    ) -> Result<Self> {
        Ok(match kind {
            BackendKind::Jsonl => Self::Jsonl(JsonlStore::open(layout.log_path(project, run))?),
            BackendKind::Archive => Self::Archive(ArchiveStore::open(
                layout.wal_path(project, run),
                layout.archive_dir(project, run),
                config.archive_threshold_bytes,
            )?),
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Jsonl(_) => BackendKind::Jsonl,
            Self::Archive(_) => BackendKind::Archive,
        }
    }

    fn inner(&self) -> &dyn MetricStore {
        match self {
            Self::Jsonl(store) => store,
            Self::Archive(store) => store,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn MetricStore {
        match self {
            Self::Jsonl(store) => store,
            Self::Archive(store) => store,
        }
    }
}

fn record_backend(layout: &DataLayout, project: &str, run: &str, kind: BackendKind) -> Result<()> {
    let path = layout.meta_path(project, run);
    let mut meta = RunMeta::read(&path)?.unwrap_or_default();
    meta.backend = Some(kind);
    meta.write(&path)
}

impl MetricStore for RunStore {
    fn save(&mut self, point: &MetricPoint) -> Result<()> {
        self.inner_mut().save(point)
    }

    fn load(&self, metrics: Option<&[&str]>) -> Result<MetricFrame> {
        self.inner().load(metrics)
    }

    fn finish(&mut self) -> Result<()> {
        self.inner_mut().finish()
    }

    fn close(&mut self) -> Result<()> {
        self.inner_mut().close()
    }
}
