//! Wide-format query results
//!
//! Storage keeps metrics in long format (one row per metric value) while
//! every read path hands back a [`MetricFrame`]: one row per
//! `(timestamp, step)` and one nullable column per metric, named with a
//! leading underscore (`_loss`).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::record::MetricPoint;

/// Prefix applied to metric names to form wide column names
pub const METRIC_COLUMN_PREFIX: &str = "_";

/// Base columns present in every frame
pub const BASE_COLUMNS: [&str; 2] = ["timestamp", "step"];

/// One metric value in long format
#[derive(Debug, Clone, PartialEq)]
pub struct LongRow {
    pub timestamp: DateTime<Utc>,
    pub step: i64,
    pub metric: String,
    pub value: f64,
}

/// Expand a point into long rows
pub fn point_to_long(point: &MetricPoint) -> impl Iterator<Item = LongRow> + '_ {
    point.metrics.iter().map(move |(name, value)| LongRow {
        timestamp: point.timestamp,
        step: point.step,
        metric: name.clone(),
        value: *value,
    })
}

/// One wide row
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRow {
    pub timestamp: DateTime<Utc>,
    pub step: i64,
    /// Values aligned with [`MetricFrame::metric_names`]
    pub values: Vec<Option<f64>>,
}

/// Wide-format metric table sorted by `(timestamp, step)`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricFrame {
    metric_names: Vec<String>,
    rows: Vec<FrameRow>,
}

type Pivot = BTreeMap<(DateTime<Utc>, i64), BTreeMap<String, f64>>;

impl MetricFrame {
    /// Frame with base columns only
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from points; points without metrics still produce a row
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a MetricPoint>) -> Self {
        let mut pivot = Pivot::new();
        for point in points {
            pivot
                .entry(point.sort_key())
                .or_default()
                .extend(point.metrics.iter().map(|(k, v)| (k.clone(), *v)));
        }
        Self::from_pivot(pivot)
    }

    /// Pivot long rows to wide format
    ///
    /// Rows sharing `(timestamp, step)` collapse into one; a repeated metric
    /// keeps the value seen last.
    pub fn from_long(rows: impl IntoIterator<Item = LongRow>) -> Self {
        let mut pivot = Pivot::new();
        for row in rows {
            pivot
                .entry((row.timestamp, row.step))
                .or_default()
                .insert(row.metric, row.value);
        }
        Self::from_pivot(pivot)
    }

    fn from_pivot(pivot: Pivot) -> Self {
        let metric_names: Vec<String> = pivot
            .values()
            .flat_map(|metrics| metrics.keys())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .cloned()
            .collect();
        let rows = pivot
            .into_iter()
            .map(|((timestamp, step), metrics)| FrameRow {
                timestamp,
                step,
                values: metric_names.iter().map(|name| metrics.get(name).copied()).collect(),
            })
            .collect();
        Self { metric_names, rows }
    }

    /// Keep only the named metrics (without prefix)
    ///
    /// Rows with no value for any kept metric are dropped.
    pub fn select<S: AsRef<str>>(self, metrics: &[S]) -> Self {
        let keep: Vec<usize> = self
            .metric_names
            .iter()
            .enumerate()
            .filter(|(_, name)| metrics.iter().any(|m| m.as_ref() == name.as_str()))
            .map(|(idx, _)| idx)
            .collect();
        let metric_names = keep.iter().map(|&idx| self.metric_names[idx].clone()).collect();
        let rows = self
            .rows
            .into_iter()
            .filter_map(|row| {
                let values: Vec<Option<f64>> = keep.iter().map(|&idx| row.values[idx]).collect();
                values.iter().any(Option::is_some).then_some(FrameRow {
                    timestamp: row.timestamp,
                    step: row.step,
                    values,
                })
            })
            .collect();
        Self { metric_names, rows }
    }

    /// Column names: `timestamp`, `step`, then `_<metric>` in name order
    pub fn columns(&self) -> Vec<String> {
        BASE_COLUMNS
            .iter()
            .map(|c| (*c).to_string())
            .chain(self.metric_names.iter().map(|m| format!("{METRIC_COLUMN_PREFIX}{m}")))
            .collect()
    }

    pub fn metric_names(&self) -> &[String] {
        &self.metric_names
    }

    pub fn rows(&self) -> &[FrameRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn steps(&self) -> Vec<i64> {
        self.rows.iter().map(|r| r.step).collect()
    }

    /// Values of one metric column, by metric name or `_`-prefixed column name
    pub fn column(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let idx = self.metric_index(name)?;
        Some(self.rows.iter().map(|row| row.values[idx]).collect())
    }

    /// Single cell lookup
    pub fn value(&self, row: usize, metric: &str) -> Option<f64> {
        let idx = self.metric_index(metric)?;
        self.rows.get(row)?.values[idx]
    }

    fn metric_index(&self, name: &str) -> Option<usize> {
        self.metric_names
            .iter()
            .position(|m| m == name)
            .or_else(|| {
                let bare = name.strip_prefix(METRIC_COLUMN_PREFIX)?;
                self.metric_names.iter().position(|m| m == bare)
            })
    }

    /// Convert back to points, dropping null cells
    pub fn to_points(&self) -> Vec<MetricPoint> {
        self.rows
            .iter()
            .map(|row| MetricPoint {
                timestamp: row.timestamp,
                step: row.step,
                metrics: self
                    .metric_names
                    .iter()
                    .zip(&row.values)
                    .filter_map(|(name, value)| value.map(|v| (name.clone(), v)))
                    .collect(),
            })
            .collect()
    }

    /// Export as an Arrow batch with the same column names
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let mut fields = vec![
            Field::new(
                BASE_COLUMNS[0],
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
            Field::new(BASE_COLUMNS[1], DataType::Int64, false),
        ];
        let timestamps = TimestampMicrosecondArray::from(
            self.rows.iter().map(|r| r.timestamp.timestamp_micros()).collect::<Vec<_>>(),
        )
        .with_timezone("UTC");
        let steps = Int64Array::from(self.rows.iter().map(|r| r.step).collect::<Vec<_>>());
        let mut columns: Vec<ArrayRef> = vec![Arc::new(timestamps), Arc::new(steps)];

        for (idx, name) in self.metric_names.iter().enumerate() {
            fields.push(Field::new(
                format!("{METRIC_COLUMN_PREFIX}{name}"),
                DataType::Float64,
                true,
            ));
            let values: Float64Array = self.rows.iter().map(|r| r.values[idx]).collect();
            columns.push(Arc::new(values));
        }

        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
    }
}
