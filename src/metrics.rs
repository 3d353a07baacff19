//! Per-run counters and derived rates
//!
//! One `Metrics` value belongs to one orchestrator run. Workers report into it
//! through the run's mutex, and `finish` freezes it once every item resolved.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::time::Instant;

/// Counters for one fetch run
#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub total_requested: usize,
    pub cache_hits: usize,
    /// Calls issued to the quote client, every page and retry included
    pub api_calls: usize,
    pub api_successes: usize,
    pub api_failures: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    clock_start: Instant,
    elapsed: Option<Duration>,
}

impl Metrics {
    /// Starts the clock for a run over `total_requested` items
    pub fn start(total_requested: usize) -> Self {
        Self {
            total_requested,
            cache_hits: 0,
            api_calls: 0,
            api_successes: 0,
            api_failures: 0,
            started_at: Utc::now(),
            finished_at: None,
            clock_start: Instant::now(),
            elapsed: None,
        }
    }

    pub fn record_cache_hit(&mut self) {
        if self.is_finished() {
            return;
        }
        self.cache_hits += 1;
    }

    /// Records one client call; a `NotFound` answer counts as a success
    pub fn record_api_call(&mut self, success: bool) {
        if self.is_finished() {
            return;
        }
        self.api_calls += 1;
        if success {
            self.api_successes += 1;
        } else {
            self.api_failures += 1;
        }
    }

    /// Freezes the run; later calls are ignored
    pub fn finish(&mut self) {
        if self.is_finished() {
            return;
        }
        self.finished_at = Some(Utc::now());
        self.elapsed = Some(self.clock_start.elapsed());
    }

    pub fn is_finished(&self) -> bool {
        self.elapsed.is_some()
    }

    /// Time from start to finish, or to now while the run is still going
    pub fn elapsed(&self) -> Duration {
        self.elapsed.unwrap_or_else(|| self.clock_start.elapsed())
    }

    /// Fraction of requested items served from cache
    pub fn cache_hit_rate(&self) -> f64 {
        ratio(self.cache_hits, self.total_requested)
    }

    /// Fraction of client calls that succeeded
    pub fn success_rate(&self) -> f64 {
        ratio(self.api_successes, self.api_calls)
    }

    /// Items resolved per second
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.total_requested as f64 / secs
        } else {
            0.0
        }
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        format!(
            "{} items in {:.2}s: {} cache hits ({:.0}%), {} API calls ({} ok, {} failed, {:.0}% success), {:.1} items/s",
            self.total_requested,
            self.elapsed().as_secs_f64(),
            self.cache_hits,
            self.cache_hit_rate() * 100.0,
            self.api_calls,
            self.api_successes,
            self.api_failures,
            self.success_rate() * 100.0,
            self.throughput()
        )
    }

    /// Structured record of counters and derived rates
    pub fn to_map(&self) -> Map<String, Value> {
        let record = json!({
            "total_requested": self.total_requested,
            "cache_hits": self.cache_hits,
            "api_calls": self.api_calls,
            "api_successes": self.api_successes,
            "api_failures": self.api_failures,
            "cache_hit_rate": self.cache_hit_rate(),
            "success_rate": self.success_rate(),
            "throughput": self.throughput(),
            "elapsed_secs": self.elapsed().as_secs_f64(),
            "started_at": self.started_at.to_rfc3339(),
            "finished_at": self.finished_at.map(|at| at.to_rfc3339()),
        });
        match record {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
