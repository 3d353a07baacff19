//! Typed event stream of a running fetch
//!
//! A spawned run reports every resolved outcome, every cache hit, and
//! coalesced progress through an unbounded channel. The stream is finite:
//! it closes when the run ends and cannot be restarted.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{FetchError, FetchReport};
use crate::model::{FetchOutcome, ItemId};

/// Messages sent from a running fetch to its consumer
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    /// An item was resolved
    Outcome(FetchOutcome),
    /// An item was served from cache
    CacheHit { item_id: ItemId },
    /// Coalesced progress, sent every few outcomes and once at the end
    Progress { completed: usize, total: usize },
}

/// Sending side of the event stream; a closed receiver is ignored
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink {
    sender: Option<mpsc::UnboundedSender<FetchEvent>>,
}

impl EventSink {
    pub(crate) fn new(sender: mpsc::UnboundedSender<FetchEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub(crate) fn send(&self, event: FetchEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}

/// Handle for a fetch running in the background
pub struct FetchHandle {
    /// Channel for receiving fetch events
    pub events: mpsc::UnboundedReceiver<FetchEvent>,
    cancel: CancellationToken,
    task: JoinHandle<FetchReport>,
}

impl FetchHandle {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<FetchEvent>,
        cancel: CancellationToken,
        task: JoinHandle<FetchReport>,
    ) -> Self {
        Self {
            events,
            cancel,
            task,
        }
    }

    /// Asks the run to stop dispatching work
    ///
    /// Calls already in flight finish; their outcomes are still reported.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this run, e.g. for a signal handler
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the next event; `None` once the run has ended
    pub async fn next_event(&mut self) -> Option<FetchEvent> {
        self.events.recv().await
    }

    /// Returns a pending event without waiting
    pub fn try_recv(&mut self) -> Option<FetchEvent> {
        self.events.try_recv().ok()
    }

    /// Waits for the run to end and returns its report
    pub async fn wait(self) -> Result<FetchReport, FetchError> {
        self.task
            .await
            .map_err(|e| FetchError::Aborted(e.to_string()))
    }
}
