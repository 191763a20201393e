//! Metric records and run status events
//!
//! A [`MetricPoint`] is one logged step: a timestamp, an integer step and a
//! map of named values. On disk it is one JSON line:
//!
//! ```text
//! {"timestamp": "2024-05-01T12:00:00.000000Z", "step": 3, "metrics": {"loss": 0.25}}
//! ```
//!
//! Timestamps are accepted either as ISO-8601 strings or as epoch
//! milliseconds and are always written back as RFC 3339 UTC.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One logged training step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub step: i64,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl MetricPoint {
    /// Create a point stamped with the current time
    pub fn new(step: i64) -> Self {
        Self::at(Utc::now(), step)
    }

    /// Create a point with an explicit timestamp
    pub fn at(timestamp: DateTime<Utc>, step: i64) -> Self {
        Self {
            timestamp,
            step,
            metrics: BTreeMap::new(),
        }
    }

    /// Add a metric value
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Reject points that cannot be stored faithfully
    pub fn validate(&self) -> Result<()> {
        if self.metrics.keys().any(String::is_empty) {
            return Err(Error::InvalidPoint(format!(
                "empty metric name at step {}",
                self.step
            )));
        }
        Ok(())
    }

    /// Serialize as a single JSON line terminated by `\n`
    pub fn to_json_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one JSON line, returning `None` for corrupted input
    pub fn from_json_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str(line) {
            Ok(point) => Some(point),
            Err(e) => {
                tracing::debug!(error = %e, "skipping corrupted metric line");
                None
            }
        }
    }

    /// Ordering key used by every read path
    pub fn sort_key(&self) -> (DateTime<Utc>, i64) {
        (self.timestamp, self.step)
    }
}

/// Lifecycle status of a run as recorded in its sidecar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Run is actively logging
    Running,
    /// Run completed successfully
    Finished,
    /// Run terminated with an error
    Failed,
    /// Run was stopped before completion
    Cancelled,
}

impl RunStatus {
    /// Whether the run has reached a terminal state
    pub fn is_finished(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted when the status of a watched run changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub project: String,
    pub run: String,
    pub status: RunStatus,
    pub is_finished: bool,
    pub exit_code: Option<i32>,
}

impl StatusEvent {
    pub fn new(project: &str, run: &str, status: RunStatus, exit_code: Option<i32>) -> Self {
        Self {
            project: project.to_string(),
            run: run.to_string(),
            status,
            is_finished: status.is_finished(),
            exit_code,
        }
    }
}

/// A metric point tagged with the run it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricUpdate {
    pub project: String,
    pub run: String,
    #[serde(flatten)]
    pub point: MetricPoint,
}

/// Record delivered to live subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveRecord {
    Metric(MetricUpdate),
    Status(StatusEvent),
}

impl LiveRecord {
    pub(crate) fn metric(project: &str, run: &str, point: MetricPoint) -> Self {
        Self::Metric(MetricUpdate {
            project: project.to_string(),
            run: run.to_string(),
            point,
        })
    }

    pub fn project(&self) -> &str {
        match self {
            Self::Metric(update) => &update.project,
            Self::Status(event) => &event.project,
        }
    }

    pub fn run(&self) -> &str {
        match self {
            Self::Metric(update) => &update.run,
            Self::Status(event) => &event.run,
        }
    }

    pub fn as_metric(&self) -> Option<&MetricPoint> {
        match self {
            Self::Metric(update) => Some(&update.point),
            Self::Status(_) => None,
        }
    }

    pub fn as_status(&self) -> Option<&StatusEvent> {
        match self {
            Self::Status(event) => Some(event),
            Self::Metric(_) => None,
        }
    }
}

/// Serde adapter accepting ISO-8601 strings or epoch milliseconds
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Millis(i64),
        FractionalMillis(f64),
        Text(String),
    }

    /// Parse an ISO-8601 timestamp; naive values are taken as UTC
    pub fn parse(text: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(dt.with_timezone(&Utc));
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
            .map(|naive| naive.and_utc())
    }

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let parsed = match RawTimestamp::deserialize(deserializer)? {
            RawTimestamp::Millis(ms) => DateTime::from_timestamp_millis(ms),
            RawTimestamp::FractionalMillis(ms) => {
                DateTime::from_timestamp_micros((ms * 1000.0).round() as i64)
            }
            RawTimestamp::Text(text) => parse(&text),
        };
        parsed.ok_or_else(|| de::Error::custom("invalid timestamp"))
    }

    /// Same as the parent module for `Option<DateTime<Utc>>` fields
    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => super::serialize(ts, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(with = "super")] DateTime<Utc>);

            Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(ts)| ts))
        }
    }
}
