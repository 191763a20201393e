//! Metric Storage Module
//!
//! Persists per-run metric points. Two backends share the [`MetricStore`]
//! contract:
//!
//! - [`JsonlStore`]: one append-only JSON lines file, fsynced per save
//! - [`ArchiveStore`]: a JSON lines WAL compacted into date-partitioned
//!   Parquet files once it exceeds a size threshold
//!
//! [`RunStore`] picks the backend once per run and dispatches to it. Every
//! read path returns a wide [`MetricFrame`].

mod archive;
mod backend;
mod frame;
mod jsonl;
pub(crate) mod parquet;
mod traits;

pub use archive::{ArchiveStore, CompactionStats};
pub use backend::{detect_backend, BackendKind, RunStore};
pub use frame::{point_to_long, FrameRow, LongRow, MetricFrame, BASE_COLUMNS, METRIC_COLUMN_PREFIX};
pub use jsonl::JsonlStore;
pub use traits::MetricStore;
