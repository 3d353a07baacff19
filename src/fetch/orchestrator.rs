//! Cache-then-client resolution of a fetch request

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{EventSink, FetchEvent, FetchHandle};
use super::pacing::RequestPacer;
use super::retry::{call_with_retry, Attempt, RetryPolicy};
use super::{FetchError, FetchReport, RunOptions};
use crate::cache::{CacheLookup, PricingCache};
use crate::client::{BatchQuote, QuoteClient};
use crate::metrics::Metrics;
use crate::model::{CacheKey, FetchOutcome, FetchRequest, ItemId, Origin, PriceKind};

/// Resolves one `FetchRequest` per instance
///
/// The quote client is released when the run ends, whether it completed,
/// was cancelled, or its future was dropped.
pub struct Orchestrator {
    client: Arc<dyn QuoteClient>,
    cache: Arc<PricingCache>,
    options: RunOptions,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(client: Arc<dyn QuoteClient>, cache: Arc<PricingCache>, options: RunOptions) -> Self {
        Self {
            client,
            cache,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses an external token to cancel the run
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves the request and returns once every item has an outcome
    ///
    /// # Errors
    /// Only malformed requests fail; nothing is dispatched in that case.
    pub async fn run(self, request: FetchRequest) -> Result<FetchReport, FetchError> {
        request.validate()?;
        Ok(self.execute(request, EventSink::default()).await)
    }

    /// Starts the run in the background and streams its events
    ///
    /// # Errors
    /// Malformed requests are rejected before the task is spawned.
    pub fn spawn(self, request: FetchRequest) -> Result<FetchHandle, FetchError> {
        request.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.execute(request, EventSink::new(tx)));
        Ok(FetchHandle::new(rx, cancel, task))
    }

    async fn execute(self, request: FetchRequest, events: EventSink) -> FetchReport {
        let _release = ReleaseOnDrop(Arc::clone(&self.client));
        let total = request.item_ids.len();

        info!(
            region = %request.region,
            kind = %request.price_kind,
            items = total,
            concurrency = request.concurrency_limit,
            "starting fetch run"
        );

        let run = RunContext {
            client: self.client,
            cache: self.cache,
            ttl: self.options.ttl,
            negative_ttl: self.options.negative_ttl,
            progress_every: self.options.progress_every,
            max_pages: self.options.max_pages.max(1),
            retry: RetryPolicy::new(request.retry_limit, self.options.retry_base_delay),
            pacer: RequestPacer::new(request.request_spacing),
            cancel: self.cancel,
            events,
            region: request.region.clone(),
            price_kind: request.price_kind,
            total,
            state: Mutex::new(RunState {
                outcomes: BTreeMap::new(),
                metrics: Metrics::start(total),
                last_progress: 0,
            }),
        };

        let misses = run.resolve_cache_hits(&request);
        let units = plan_units(misses, request.price_kind, request.batch_size_limit);
        let workers = request.concurrency_limit.min(units.len());
        debug!(units = units.len(), workers, "dispatching cache misses");

        let queue = Mutex::new(units);
        join_all((0..workers).map(|_| run.worker(&queue))).await;

        let report = run.finish();
        info!(
            cancelled = report.cancelled,
            resolved = report.outcomes.len(),
            summary = %report.metrics.summary(),
            "fetch run finished"
        );
        report
    }
}

/// Releases the client's connections when the run goes out of scope
struct ReleaseOnDrop(Arc<dyn QuoteClient>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if self.0.release() {
            debug!("released quote client connections");
        }
    }
}

/// One dispatchable piece of work
#[derive(Debug, Clone, PartialEq, Eq)]
enum WorkUnit {
    Single(ItemId),
    Chunk(Vec<ItemId>),
}

/// Splits misses into batch chunks or single-item units
fn plan_units(misses: Vec<ItemId>, price_kind: PriceKind, batch_size_limit: usize) -> VecDeque<WorkUnit> {
    if price_kind.supports_batch() {
        misses
            .chunks(batch_size_limit.max(1))
            .map(|chunk| WorkUnit::Chunk(chunk.to_vec()))
            .collect()
    } else {
        misses.into_iter().map(WorkUnit::Single).collect()
    }
}

/// How pagination of one chunk ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkEnd {
    /// The last page was reached; missing items have no price
    Complete,
    /// A page failed after retries or the page limit was hit
    Failed,
    Cancelled,
}

struct RunState {
    outcomes: BTreeMap<ItemId, FetchOutcome>,
    metrics: Metrics,
    last_progress: usize,
}

/// Shared state of one run, borrowed by every worker
struct RunContext {
    client: Arc<dyn QuoteClient>,
    cache: Arc<PricingCache>,
    ttl: Duration,
    negative_ttl: Duration,
    progress_every: usize,
    max_pages: usize,
    retry: RetryPolicy,
    pacer: RequestPacer,
    cancel: CancellationToken,
    events: EventSink,
    region: String,
    price_kind: PriceKind,
    total: usize,
    state: Mutex<RunState>,
}

impl RunContext {
    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Emits outcomes for fresh cache records and returns the misses in order
    fn resolve_cache_hits(&self, request: &FetchRequest) -> Vec<ItemId> {
        let mut misses = Vec::new();
        for item_id in &request.item_ids {
            match self.cache.get(&request.cache_key(item_id)) {
                CacheLookup::Fresh(value) => {
                    self.events.send(FetchEvent::CacheHit {
                        item_id: item_id.clone(),
                    });
                    self.record(FetchOutcome::new(item_id.clone(), value, Origin::CacheHit));
                }
                CacheLookup::Absent | CacheLookup::Expired { .. } => misses.push(item_id.clone()),
            }
        }
        misses
    }

    /// Drains the shared queue until it is empty or the run is cancelled
    async fn worker(&self, queue: &Mutex<VecDeque<WorkUnit>>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let next = queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front();
            match next {
                Some(WorkUnit::Single(item_id)) => self.fetch_single(item_id).await,
                Some(WorkUnit::Chunk(items)) => self.fetch_chunk(items).await,
                None => break,
            }
        }
    }

    fn record_call(&self, success: bool) {
        self.state().metrics.record_api_call(success);
    }

    async fn fetch_single(&self, item_id: ItemId) {
        let client = &*self.client;
        let region = self.region.as_str();
        let price_kind = self.price_kind;
        let item = item_id.as_str();

        let attempt = call_with_retry(
            &self.retry,
            &self.pacer,
            &self.cancel,
            item,
            |success| self.record_call(success),
            move || client.fetch_one(item, region, price_kind),
        )
        .await;

        match attempt {
            Attempt::Done(quote) => {
                self.resolve(FetchOutcome::new(item_id, quote.value(), Origin::ApiSuccess))
            }
            Attempt::Failed(_) => self.resolve(FetchOutcome::new(item_id, None, Origin::ApiFailure)),
            Attempt::Cancelled => debug!(item = %item_id, "left unresolved by cancellation"),
        }
    }

    /// Follows continuation tokens for one chunk, retrying failed pages only
    async fn fetch_chunk(&self, items: Vec<ItemId>) {
        let client = &*self.client;
        let region = self.region.as_str();
        let price_kind = self.price_kind;
        let unit = format!("chunk of {} starting at {}", items.len(), items.first().map_or("", String::as_str));
        let wanted: HashSet<&str> = items.iter().map(String::as_str).collect();

        let mut found: HashMap<ItemId, BatchQuote> = HashMap::new();
        let mut token: Option<String> = None;
        let mut pages = 0;

        let end = loop {
            if pages >= self.max_pages {
                warn!(unit = %unit, pages, "page limit reached; keeping results so far");
                break ChunkEnd::Failed;
            }

            let chunk = items.as_slice();
            let next_token = token.as_deref();
            let attempt = call_with_retry(
                &self.retry,
                &self.pacer,
                &self.cancel,
                &unit,
                |success| self.record_call(success),
                move || client.fetch_batch(chunk, region, price_kind, next_token),
            )
            .await;

            let page = match attempt {
                Attempt::Done(page) => page,
                Attempt::Failed(_) => break ChunkEnd::Failed,
                Attempt::Cancelled => break ChunkEnd::Cancelled,
            };
            pages += 1;

            for quote in page.quotes {
                if !wanted.contains(quote.item_id.as_str()) {
                    continue;
                }
                let newer = found
                    .get(&quote.item_id)
                    .map_or(true, |existing| quote.observed_at > existing.observed_at);
                if newer {
                    found.insert(quote.item_id.clone(), quote);
                }
            }

            match page.next_token {
                Some(next) => token = Some(next),
                None => break ChunkEnd::Complete,
            }
        };

        debug!(unit = %unit, pages, found = found.len(), end = ?end, "chunk finished");

        for item_id in items {
            match (found.remove(&item_id), end) {
                (Some(quote), _) => {
                    self.resolve(FetchOutcome::new(item_id, Some(quote.price), Origin::ApiSuccess))
                }
                (None, ChunkEnd::Complete) => {
                    self.resolve(FetchOutcome::new(item_id, None, Origin::ApiSuccess))
                }
                (None, ChunkEnd::Failed) => {
                    self.resolve(FetchOutcome::new(item_id, None, Origin::ApiFailure))
                }
                (None, ChunkEnd::Cancelled) => {}
            }
        }
    }

    /// Caches and records an outcome that came from the client
    fn resolve(&self, outcome: FetchOutcome) {
        let ttl = match outcome.origin {
            Origin::ApiFailure => self.negative_ttl,
            _ => self.ttl,
        };
        let key = CacheKey::new(self.region.clone(), outcome.item_id.clone(), self.price_kind);
        if let Err(e) = self.cache.put(&key, outcome.value, ttl) {
            warn!(key = %key, error = %e, "failed to cache outcome");
        }
        self.record(outcome);
    }

    /// Stores the outcome, emits it, and emits progress when due
    fn record(&self, outcome: FetchOutcome) {
        let mut state = self.state();
        if outcome.origin == Origin::CacheHit {
            state.metrics.record_cache_hit();
        }
        if state.outcomes.contains_key(&outcome.item_id) {
            warn!(item = %outcome.item_id, "duplicate outcome ignored");
            return;
        }
        state.outcomes.insert(outcome.item_id.clone(), outcome.clone());
        self.events.send(FetchEvent::Outcome(outcome));

        let completed = state.outcomes.len();
        if self.progress_every > 0 && completed % self.progress_every == 0 {
            state.last_progress = completed;
            self.events.send(FetchEvent::Progress {
                completed,
                total: self.total,
            });
        }
    }

    /// Freezes metrics and emits the final progress event
    fn finish(self) -> FetchReport {
        let RunState {
            outcomes,
            mut metrics,
            last_progress,
        } = self
            .state
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        metrics.finish();
        let completed = outcomes.len();
        if completed != last_progress || completed == 0 {
            self.events.send(FetchEvent::Progress {
                completed,
                total: self.total,
            });
        }

        FetchReport {
            cancelled: completed < self.total,
            outcomes,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: usize) -> Vec<ItemId> {
        (0..n).map(|i| format!("item-{:03}", i)).collect()
    }

    #[test]
    fn test_batch_kinds_are_chunked() {
        let units = plan_units(items(75), PriceKind::Spot, 50);
        let sizes: Vec<usize> = units
            .iter()
            .map(|unit| match unit {
                WorkUnit::Chunk(items) => items.len(),
                WorkUnit::Single(_) => 1,
            })
            .collect();
        assert_eq!(sizes, vec![50, 25]);
    }

    #[test]
    fn test_other_kinds_are_single_units() {
        let units = plan_units(items(3), PriceKind::OnDemand, 50);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0], WorkUnit::Single("item-000".to_string()));
    }

    #[test]
    fn test_no_misses_means_no_units() {
        assert!(plan_units(Vec::new(), PriceKind::Spot, 50).is_empty());
    }
}
