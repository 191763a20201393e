//! Reliable remote delivery
//!
//! When metrics are shipped to a remote collector, a failed write must
//! neither block the producer nor lose the point. Failed writes land in a
//! bounded, durable per-run [`DeliveryQueue`]; a [`DeliveryWorker`] thread
//! retries them with exponential [`Backoff`], in step order, once the
//! collector's cached health check says it is reachable again.
//!
//! Delivery is at-least-once: a collector must treat repeated
//! `(project, run, step)` writes as idempotent.

mod backoff;
mod client;
mod queue;
mod sender;
mod worker;

pub use backoff::Backoff;
pub use client::{Client, ClientError, HealthCache};
pub use queue::{DeliveryQueue, QueueItem, QueueStats};
pub use sender::{Delivery, ReliableSender};
pub use worker::{DeliveryWorker, WorkerState};

#[cfg(test)]
mod tests;
