//! Live metric subscriptions
//!
//! Viewers subscribe to a set of projects/runs and receive a
//! [`LiveRecord`](crate::LiveRecord) stream: first the existing history
//! newer than `since` (large files are read from their tail only), then
//! every point appended afterwards and every status transition written to
//! a run sidecar.
//!
//! All subscriptions on a data root share one filesystem watch owned by
//! the [`ChangeMultiplexer`].
//!
//! ```no_run
//! use entrenar_live::live::{ChangeMultiplexer, Targets};
//!
//! # async fn demo() -> entrenar_live::Result<()> {
//! let mux = ChangeMultiplexer::instance("./runs")?;
//! let mut sub = mux.subscribe(Targets::new().run("mnist", "run-1"), None)?;
//! while let Some(record) = sub.recv().await {
//!     println!("{record:?}");
//! }
//! # Ok(())
//! # }
//! ```

mod multiplexer;
mod subscription;
mod tail;
mod targets;

pub use multiplexer::ChangeMultiplexer;
pub use subscription::{RecvOutcome, Subscription};
pub use targets::Targets;

#[cfg(test)]
mod tests;
