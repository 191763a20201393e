//! Consumer side of a live subscription

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_core::Stream;
use tokio::sync::{mpsc, watch};

use crate::record::LiveRecord;

use super::multiplexer::ChangeMultiplexer;

/// Result of [`Subscription::recv_timeout`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecvOutcome {
    Record(LiveRecord),
    /// Nothing arrived in time; the subscription is still open
    TimedOut,
    /// The subscription was closed
    Closed,
}

/// Stream of catch-up records followed by live records
///
/// Dropping the subscription unsubscribes it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    backlog: VecDeque<LiveRecord>,
    rx: mpsc::UnboundedReceiver<LiveRecord>,
    shutdown: watch::Receiver<bool>,
    mux: Arc<ChangeMultiplexer>,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        backlog: VecDeque<LiveRecord>,
        rx: mpsc::UnboundedReceiver<LiveRecord>,
        shutdown: watch::Receiver<bool>,
        mux: Arc<ChangeMultiplexer>,
    ) -> Self {
        Self {
            id,
            backlog,
            rx,
            shutdown,
            mux,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Catch-up records not consumed yet
    pub fn pending_catch_up(&self) -> usize {
        self.backlog.len()
    }

    /// Next record, or `None` once the subscription is closed
    pub async fn recv(&mut self) -> Option<LiveRecord> {
        if let Some(record) = self.backlog.pop_front() {
            return Some(record);
        }
        self.recv_live().await
    }

    async fn recv_live(&mut self) -> Option<LiveRecord> {
        // records already queued win over the shutdown signal
        tokio::select! {
            biased;
            record = self.rx.recv() => record,
            _ = self.shutdown.wait_for(|closed| *closed) => None,
        }
    }

    /// Wait at most `timeout` for the next record
    ///
    /// Only the freshly created timer is dropped when it fires. The pending
    /// receive is cancel-safe, so a timeout never closes the subscription
    /// or loses a record; callers polling with a timeout should use this
    /// rather than wrapping the stream in their own cancellation.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> RecvOutcome {
        if let Some(record) = self.backlog.pop_front() {
            return RecvOutcome::Record(record);
        }
        let timer = tokio::time::sleep(timeout);
        tokio::select! {
            biased;
            record = self.recv_live() => match record {
                Some(record) => RecvOutcome::Record(record),
                None => RecvOutcome::Closed,
            },
            () = timer => RecvOutcome::TimedOut,
        }
    }

    /// Unsubscribe now; later calls and the eventual drop are no-ops
    pub fn close(&self) {
        self.mux.unsubscribe(self.id);
    }
}

impl Stream for Subscription {
    type Item = LiveRecord;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(record) = this.backlog.pop_front() {
            return Poll::Ready(Some(record));
        }
        // the sender is dropped on unsubscribe, which ends the stream
        this.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.mux.unsubscribe(self.id);
    }
}
