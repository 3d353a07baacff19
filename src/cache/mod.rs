//! Cache module for storing pricing lookups on disk
//!
//! This module provides a thread-safe pricing cache that persists one record per
//! `(region, item, price kind)` with a per-record TTL. Both prices and failed
//! lookups are stored, so callers can tell "never fetched" apart from
//! "fetched and nothing was there".

mod manager;

pub use manager::{CacheEntry, CacheError, CacheLookup, CacheStats, ClearFilter, PricingCache};
