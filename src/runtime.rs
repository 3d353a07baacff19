//! Process-wide pricing service object
//!
//! `PricingRuntime` is built once per process. It owns the shared cache and
//! the registry of connection pools, and hands out one `Orchestrator` per run.
//! `shutdown` sweeps any pool a run failed to release.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::cache::PricingCache;
use crate::client::{HttpQuoteClient, QuoteClient};
use crate::config::{RunMode, Settings};
use crate::fetch::{FetchError, FetchReport, Orchestrator, RunOptions};
use crate::lifecycle::ResourceRegistry;
use crate::model::{FetchRequest, ItemId, PriceKind};

/// Errors from starting the runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No platform cache directory and none configured
    #[error("No cache directory available; set cache_dir or PRICEFETCH_CACHE_DIR")]
    NoCacheDir,
}

/// Owner of the cache and of every connection pool created for runs
pub struct PricingRuntime {
    settings: Settings,
    cache: Arc<PricingCache>,
    registry: ResourceRegistry,
    shut_down: AtomicBool,
}

impl PricingRuntime {
    /// Opens the cache at the configured or platform location
    pub fn init(settings: Settings) -> Result<Self, RuntimeError> {
        let cache = match &settings.cache_dir {
            Some(dir) => PricingCache::with_dir(dir.clone()),
            None => PricingCache::new().ok_or(RuntimeError::NoCacheDir)?,
        };
        debug!(cache_dir = %cache.dir().display(), "pricing runtime initialized");

        Ok(Self {
            settings,
            cache: Arc::new(cache),
            registry: ResourceRegistry::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<PricingCache> {
        &self.cache
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Builds a request with the configured limits for `mode`
    pub fn request<I, S>(
        &self,
        item_ids: I,
        region: impl Into<String>,
        price_kind: PriceKind,
        mode: RunMode,
    ) -> FetchRequest
    where
        I: IntoIterator<Item = S>,
        S: Into<ItemId>,
    {
        self.settings.fetch_request(item_ids, region, price_kind, mode)
    }

    /// Orchestrator for one run over a fresh HTTP connection pool
    pub fn orchestrator(&self) -> Orchestrator {
        let client = HttpQuoteClient::new(&self.settings);
        self.registry.register(client.connections());
        self.orchestrator_with(Arc::new(client))
    }

    /// Orchestrator for one run over a caller-supplied client
    pub fn orchestrator_with(&self, client: Arc<dyn QuoteClient>) -> Orchestrator {
        Orchestrator::new(
            client,
            Arc::clone(&self.cache),
            RunOptions::from_settings(&self.settings),
        )
    }

    /// Runs a request to completion over HTTP
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchReport, FetchError> {
        self.orchestrator().run(request).await
    }

    /// Releases every pool still alive; returns how many needed it
    ///
    /// Only the first call does any work.
    pub fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let swept = self.registry.sweep();
        info!(swept, "pricing runtime shut down");
        swept
    }
}

impl Drop for PricingRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLookup;
    use crate::model::Origin;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    /// Endpoint on a port nothing listens on
    fn closed_endpoint() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind should succeed");
        let addr = listener.local_addr().expect("addr should exist");
        drop(listener);
        format!("http://{}", addr)
    }

    fn create_test_runtime() -> (PricingRuntime, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let settings = Settings {
            cache_dir: Some(temp_dir.path().to_path_buf()),
            endpoint: closed_endpoint(),
            ..Settings::default()
        };
        let runtime = PricingRuntime::init(settings).expect("Runtime init should succeed");
        (runtime, temp_dir)
    }

    #[test]
    fn test_init_uses_configured_cache_dir() {
        let (runtime, temp_dir) = create_test_runtime();
        assert_eq!(runtime.cache().dir(), temp_dir.path());
    }

    #[test]
    fn test_request_uses_mode_limits() {
        let (runtime, _temp_dir) = create_test_runtime();
        let request = runtime.request(["a", "b"], "us-east-1", PriceKind::OnDemand, RunMode::Interactive);
        assert_eq!(request.concurrency_limit, 10);
        assert_eq!(request.item_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_cached_run_needs_no_network() {
        let (runtime, _temp_dir) = create_test_runtime();
        let request = runtime.request(["t3.micro"], "us-east-1", PriceKind::OnDemand, RunMode::Script);
        runtime
            .cache()
            .put(&request.cache_key("t3.micro"), Some(dec!(0.0104)), runtime.settings().ttl())
            .expect("put should succeed");

        let report = runtime.fetch(request).await.expect("fetch should succeed");

        assert_eq!(report.value("t3.micro"), Some(dec!(0.0104)));
        assert_eq!(report.origin("t3.micro"), Some(Origin::CacheHit));
        assert_eq!(report.metrics.api_calls, 0);
        assert_eq!(runtime.registry().live_count(), 0, "Run should not leave a live pool");
    }

    #[tokio::test]
    async fn test_shutdown_sweeps_unreleased_pools_once() {
        let (runtime, _temp_dir) = create_test_runtime();
        let pending = runtime.orchestrator();
        assert_eq!(runtime.registry().live_count(), 1);

        assert_eq!(runtime.shutdown(), 1);
        assert_eq!(runtime.shutdown(), 0);
        drop(pending);
        assert_eq!(runtime.registry().live_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_lookup_is_negatively_cached() {
        let (runtime, _temp_dir) = create_test_runtime();
        let request = runtime
            .request(["t3.micro"], "us-east-1", PriceKind::OnDemand, RunMode::Script)
            .with_retry_limit(1);
        let key = request.cache_key("t3.micro");

        let report = runtime.fetch(request).await.expect("fetch should succeed");

        assert_eq!(report.origin("t3.micro"), Some(Origin::ApiFailure));
        assert_eq!(runtime.cache().get(&key), CacheLookup::Fresh(None));
        let entry = runtime.cache().entry(&key).expect("entry should exist");
        assert_eq!(entry.ttl, runtime.settings().negative_ttl());
    }
}
