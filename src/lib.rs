//! Entrenar Live: local-first metric storage for training runs
//!
//! Three pieces share one on-disk layout ([`DataLayout`]):
//!
//! - [`store`]: durable per-run metric storage, either an append-only JSON
//!   lines file or a write-ahead log compacted into a date-partitioned
//!   Parquet archive. Reads always return a wide [`store::MetricFrame`].
//! - [`live`]: any number of viewers subscribe to projects/runs and get
//!   history followed by live updates, all backed by one filesystem watch
//!   per data root.
//! - [`delivery`]: shipping metrics to a remote collector through a bounded
//!   durable queue with backoff retry, so outages neither block the
//!   producer nor lose points.
//!
//! # Example
//!
//! ```no_run
//! use entrenar_live::store::{MetricStore, RunStore};
//! use entrenar_live::{DataLayout, LiveConfig, MetricPoint};
//!
//! # fn main() -> entrenar_live::Result<()> {
//! let config = LiveConfig::default().with_env_overrides()?;
//! let layout = DataLayout::new(&config.data_dir);
//! let mut store = RunStore::open(&layout, "mnist", "run-1", &config.store)?;
//! store.save(&MetricPoint::new(0).with_metric("loss", 0.9))?;
//! store.finish()?;
//!
//! let frame = store.load(Some(&["loss"]))?;
//! assert_eq!(frame.columns(), vec!["timestamp", "step", "_loss"]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod layout;
pub mod live;
pub mod record;
pub mod sidecar;
pub mod store;

pub use config::LiveConfig;
pub use error::{Error, Result};
pub use layout::DataLayout;
pub use record::{LiveRecord, MetricPoint, MetricUpdate, RunStatus, StatusEvent};
pub use sidecar::RunMeta;
