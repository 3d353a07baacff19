//! Batch fetch orchestration
//!
//! The `Orchestrator` resolves every item of a `FetchRequest` through the
//! cache first and the quote client second. Cache misses become work units
//! (one item, or one chunk for batch-capable kinds) drained by a bounded pool
//! of workers that share a request pacer. Transient failures are retried with
//! backoff and every resolved value, including `None`, is written back to the
//! cache.

mod events;
mod orchestrator;
mod pacing;
mod retry;

pub use events::{FetchEvent, FetchHandle};
pub use orchestrator::Orchestrator;
pub use pacing::RequestPacer;
pub use retry::{Attempt, RetryPolicy};

use std::collections::BTreeMap;
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::config::Settings;
use crate::metrics::Metrics;
use crate::model::{FetchOutcome, InvalidInputError, ItemId, Origin};

/// Run-level failures
///
/// Individual item and chunk failures never surface here; they resolve to
/// `Origin::ApiFailure` outcomes instead.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request was rejected before any work was dispatched
    #[error("Invalid request: {0}")]
    InvalidInput(#[from] InvalidInputError),

    /// The background task running the fetch died
    #[error("Fetch task aborted: {0}")]
    Aborted(String),
}

/// Per-run tunables that are not part of the request itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// TTL for prices and confirmed missing prices
    pub ttl: Duration,
    /// TTL for lookups that failed after retries
    pub negative_ttl: Duration,
    pub retry_base_delay: Duration,
    /// Emit a progress event every N resolved outcomes; 0 only reports the end
    pub progress_every: usize,
    /// Continuation pages followed per chunk before giving up
    pub max_pages: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl RunOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            ttl: settings.ttl(),
            negative_ttl: settings.negative_ttl(),
            retry_base_delay: settings.retry_base_delay(),
            progress_every: settings.progress_every,
            max_pages: settings.max_pages,
        }
    }
}

/// Everything a run resolved, plus its frozen metrics
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub outcomes: BTreeMap<ItemId, FetchOutcome>,
    pub metrics: Metrics,
    /// The run was cancelled before every item resolved
    pub cancelled: bool,
}

impl FetchReport {
    /// Resolved price of an item, if any
    pub fn value(&self, item_id: &str) -> Option<Decimal> {
        self.outcomes.get(item_id).and_then(|outcome| outcome.value)
    }

    pub fn origin(&self, item_id: &str) -> Option<Origin> {
        self.outcomes.get(item_id).map(|outcome| outcome.origin)
    }

    /// Items whose lookup failed; candidates for a re-fetch
    pub fn failed_items(&self) -> Vec<&str> {
        self.outcomes
            .values()
            .filter(|outcome| outcome.origin == Origin::ApiFailure)
            .map(|outcome| outcome.item_id.as_str())
            .collect()
    }

    /// Items with an outcome but no price
    pub fn unavailable_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|outcome| outcome.value.is_none())
            .count()
    }
}
