//! Long-format Parquet partitions
//!
//! Each archive partition directory (`date=YYYY-MM-DD`) holds the rows of
//! one UTC day in long format:
//!
//! | column      | type                       |
//! |-------------|----------------------------|
//! | timestamp   | Timestamp(µs, UTC)         |
//! | step        | Int64                      |
//! | metric_name | Utf8                       |
//! | value       | Float64 (nullable)         |
//!
//! Readers cast whatever they find to this schema, so partitions written
//! with a different timestamp unit or integer values still load.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDate};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;

use crate::error::{Error, Result};
use crate::layout::parse_partition_name;

use super::frame::LongRow;

/// File name used for the single data file of a partition
pub const PARTITION_FILE: &str = "data.parquet";

const PARQUET_EXTENSION: &str = "parquet";

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

fn long_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("timestamp", timestamp_type(), false),
        Field::new("step", DataType::Int64, false),
        Field::new("metric_name", DataType::Utf8, false),
        Field::new("value", DataType::Float64, true),
    ]))
}

fn writer_properties() -> WriterProperties {
    let writer = KeyValue {
        key: "writer".to_string(),
        value: Some(concat!("entrenar-live ", env!("CARGO_PKG_VERSION")).to_string()),
    };
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![writer]))
        .build()
}

fn to_batch(rows: &[LongRow]) -> Result<RecordBatch> {
    let timestamps = TimestampMicrosecondArray::from(
        rows.iter().map(|r| r.timestamp.timestamp_micros()).collect::<Vec<_>>(),
    )
    .with_timezone("UTC");
    let steps = Int64Array::from(rows.iter().map(|r| r.step).collect::<Vec<_>>());
    let names = StringArray::from(rows.iter().map(|r| r.metric.as_str()).collect::<Vec<_>>());
    let values = Float64Array::from(rows.iter().map(|r| r.value).collect::<Vec<_>>());
    let columns: Vec<ArrayRef> = vec![
        Arc::new(timestamps),
        Arc::new(steps),
        Arc::new(names),
        Arc::new(values),
    ];
    Ok(RecordBatch::try_new(long_schema(), columns)?)
}

/// Write rows to `path` durably: temp file, fsync, atomic rename
pub(crate) fn write_partition_file(path: &Path, rows: &[LongRow]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Config(format!("partition path has no parent: {}", path.display())))?;
    std::fs::create_dir_all(parent)?;

    let batch = to_batch(rows)?;
    let tmp = path.with_extension("parquet.tmp");
    let file = File::create(&tmp)?;
    let mut writer = ArrowWriter::try_new(file, long_schema(), Some(writer_properties()))?;
    writer.write(&batch)?;
    let file = writer.into_inner()?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)?;
    sync_dir(parent);
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(dir = %dir.display(), error = %e, "directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn column(batch: &RecordBatch, name: &str, target: &DataType) -> Result<ArrayRef> {
    let col = batch
        .column_by_name(name)
        .ok_or_else(|| ArrowError::SchemaError(format!("missing column '{name}'")))?;
    if col.data_type() == target {
        Ok(Arc::clone(col))
    } else {
        Ok(cast(col, target)?)
    }
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, name: &str) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::Arrow(ArrowError::CastError(format!("unexpected type for '{name}'"))))
}

fn batch_to_rows(batch: &RecordBatch, out: &mut Vec<LongRow>) -> Result<()> {
    let ts_col = column(batch, "timestamp", &timestamp_type())?;
    let step_col = column(batch, "step", &DataType::Int64)?;
    let name_col = column(batch, "metric_name", &DataType::Utf8)?;
    let value_col = column(batch, "value", &DataType::Float64)?;

    let timestamps = downcast::<TimestampMicrosecondArray>(&ts_col, "timestamp")?;
    let steps = downcast::<Int64Array>(&step_col, "step")?;
    let names = downcast::<StringArray>(&name_col, "metric_name")?;
    let values = downcast::<Float64Array>(&value_col, "value")?;

    for row in 0..batch.num_rows() {
        if timestamps.is_null(row) || steps.is_null(row) || names.is_null(row) || values.is_null(row)
        {
            continue;
        }
        let Some(timestamp) = DateTime::from_timestamp_micros(timestamps.value(row)) else {
            continue;
        };
        out.push(LongRow {
            timestamp,
            step: steps.value(row),
            metric: names.value(row).to_string(),
            value: values.value(row),
        });
    }
    Ok(())
}

/// Read every row of one Parquet file
pub(crate) fn read_partition_file(path: &Path) -> Result<Vec<LongRow>> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut rows = Vec::new();
    for batch in reader {
        batch_to_rows(&batch?, &mut rows)?;
    }
    Ok(rows)
}

/// Parquet files inside one partition directory, in name order
pub(crate) fn partition_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == PARQUET_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Date partitions of an archive, oldest first
pub(crate) fn list_partitions(archive_dir: &Path) -> Result<Vec<(NaiveDate, PathBuf)>> {
    let entries = match std::fs::read_dir(archive_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut partitions = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(date) = entry.file_name().to_str().and_then(parse_partition_name) {
            partitions.push((date, entry.path()));
        }
    }
    partitions.sort();
    Ok(partitions)
}

/// Total size of the Parquet files in a partition directory
pub(crate) fn partition_size(dir: &Path) -> Result<u64> {
    let mut size = 0;
    for file in partition_files(dir)? {
        size += std::fs::metadata(&file)?.len();
    }
    Ok(size)
}

/// Read every row of a partition directory
pub(crate) fn read_partition(dir: &Path) -> Result<Vec<LongRow>> {
    let mut rows = Vec::new();
    for file in partition_files(dir)? {
        rows.extend(read_partition_file(&file)?);
    }
    Ok(rows)
}

/// Read the archive, optionally skipping partitions older than `from`
pub(crate) fn read_archive(archive_dir: &Path, from: Option<NaiveDate>) -> Result<Vec<LongRow>> {
    let mut rows = Vec::new();
    for (date, dir) in list_partitions(archive_dir)? {
        if from.is_some_and(|from| date < from) {
            continue;
        }
        rows.extend(read_partition(&dir)?);
    }
    Ok(rows)
}

/// Merge `rows` into the partition at `dir`
///
/// Existing files are read, combined with `rows` and rewritten as a single
/// [`PARTITION_FILE`]. Superseded files are removed only after the new file
/// is durable; a crash in between leaves duplicate rows, which the wide
/// pivot collapses on read.
pub(crate) fn merge_into_partition(dir: &Path, mut rows: Vec<LongRow>) -> Result<usize> {
    let existing = if dir.exists() { partition_files(dir)? } else { Vec::new() };
    for file in &existing {
        rows.extend(read_partition_file(file)?);
    }
    rows.sort_by(|a, b| {
        (a.timestamp, a.step, &a.metric).cmp(&(b.timestamp, b.step, &b.metric))
    });

    let target = dir.join(PARTITION_FILE);
    write_partition_file(&target, &rows)?;
    for file in existing.iter().filter(|f| **f != target) {
        std::fs::remove_file(file)?;
    }
    Ok(rows.len())
}
