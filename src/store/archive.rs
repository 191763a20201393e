//! Write-ahead log plus date-partitioned Parquet archive
//!
//! High-frequency saves land in a small JSON lines WAL. Once the WAL grows
//! past the configured threshold, the next save first moves its contents
//! into the archive and only then appends the new point, so at any instant
//! the WAL holds exactly the points that are not archived yet.
//!
//! The WAL is truncated in place, never unlinked: tailing readers keep a
//! valid handle and simply observe the file shrinking.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::error::{Error, Result};
use crate::layout::partition_name;
use crate::record::MetricPoint;

use super::frame::{point_to_long, LongRow, MetricFrame};
use super::jsonl::read_points;
use super::parquet;
use super::traits::MetricStore;

/// Outcome of one compaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// WAL points moved into the archive
    pub points: usize,
    /// Long rows written for those points
    pub rows: usize,
    /// Date partitions rewritten
    pub partitions: usize,
}

/// WAL + archive metric store (archiving backend)
#[derive(Debug)]
pub struct ArchiveStore {
    wal_path: PathBuf,
    archive_dir: PathBuf,
    threshold: u64,
    wal: Option<File>,
}

impl ArchiveStore {
    /// Open a store for the given WAL file and archive directory
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        wal_path: P,
        archive_dir: Q,
        threshold_bytes: u64,
    ) -> Result<Self> {
        let wal_path = wal_path.as_ref().to_path_buf();
        if let Some(parent) = wal_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            wal_path,
            archive_dir: archive_dir.as_ref().to_path_buf(),
            threshold: threshold_bytes,
            wal: None,
        })
    }

    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Current WAL size in bytes
    pub fn wal_size(&self) -> Result<u64> {
        match std::fs::metadata(&self.wal_path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn wal(&mut self) -> Result<&mut File> {
        if self.wal.is_none() {
            let file = OpenOptions::new().create(true).append(true).open(&self.wal_path)?;
            self.wal = Some(file);
        }
        self.wal.as_mut().ok_or(Error::Closed)
    }

    fn wal_points(&self) -> Result<Vec<MetricPoint>> {
        match read_points(&self.wal_path) {
            Ok(points) => Ok(points),
            Err(Error::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Move every WAL point into the archive, then truncate the WAL
    pub fn compact(&mut self) -> Result<CompactionStats> {
        let points = self.wal_points()?;
        let mut by_date: BTreeMap<NaiveDate, Vec<LongRow>> = BTreeMap::new();
        for point in &points {
            by_date
                .entry(point.timestamp.date_naive())
                .or_default()
                .extend(point_to_long(point));
        }

        let mut stats = CompactionStats {
            points: points.len(),
            ..CompactionStats::default()
        };
        for (date, rows) in by_date {
            stats.rows += rows.len();
            stats.partitions += 1;
            let dir = self.archive_dir.join(partition_name(date));
            parquet::merge_into_partition(&dir, rows)?;
        }

        if self.wal_path.exists() {
            let wal = self.wal()?;
            wal.set_len(0)?;
            wal.sync_all()?;
        }
        tracing::debug!(
            wal = %self.wal_path.display(),
            points = stats.points,
            partitions = stats.partitions,
            "compacted WAL into archive"
        );
        Ok(stats)
    }
}

impl MetricStore for ArchiveStore {
    /// Points must carry at least one metric: the archive stores one row
    /// per metric value and has no way to represent an empty point
    fn save(&mut self, point: &MetricPoint) -> Result<()> {
        point.validate()?;
        if point.metrics.is_empty() {
            return Err(Error::InvalidPoint(format!(
                "no metrics at step {}; the archive backend stores metric values only",
                point.step
            )));
        }
        if self.wal_size()? >= self.threshold {
            self.compact()?;
        }
        let line = point.to_json_line()?;
        let wal = self.wal()?;
        wal.write_all(line.as_bytes())?;
        wal.flush()?;
        wal.sync_data()?;
        Ok(())
    }

    fn load(&self, metrics: Option<&[&str]>) -> Result<MetricFrame> {
        let has_archive = self.archive_dir.is_dir();
        if !has_archive && !self.wal_path.exists() {
            return Err(Error::NotFound(self.wal_path.display().to_string()));
        }

        let mut rows = if has_archive {
            parquet::read_archive(&self.archive_dir, None)?
        } else {
            Vec::new()
        };
        for point in self.wal_points()? {
            rows.extend(point_to_long(&point));
        }
        if let Some(names) = metrics {
            rows.retain(|row| names.contains(&row.metric.as_str()));
        }
        Ok(MetricFrame::from_long(rows))
    }

    fn finish(&mut self) -> Result<()> {
        self.compact()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(wal) = self.wal.take() {
            wal.sync_all()?;
        }
        Ok(())
    }
}
