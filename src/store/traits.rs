//! Metric store trait definitions

use crate::error::Result;
use crate::record::MetricPoint;

use super::frame::MetricFrame;

/// Durable per-run metric storage
///
/// One store instance serves one `(project, run)` and assumes it is the only
/// writer for that run. Readers in other threads or processes may read the
/// same files concurrently without locking.
pub trait MetricStore: Send {
    /// Persist one point; returns once the point is durable
    fn save(&mut self, point: &MetricPoint) -> Result<()>;

    /// Read every stored point in wide format, sorted by `(timestamp, step)`
    ///
    /// `metrics` restricts the result to the named metrics (without the `_`
    /// column prefix).
    fn load(&self, metrics: Option<&[&str]>) -> Result<MetricFrame>;

    /// Called once when the run ends
    fn finish(&mut self) -> Result<()>;

    /// Release file handles; further saves reopen them
    fn close(&mut self) -> Result<()>;
}
