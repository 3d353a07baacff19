//! Core data types shared by the cache, the quote client and the orchestrator
//!
//! Price kinds double as cache partitions, so every kind has a stable label
//! that never changes between releases.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::region;

/// Identifier of a catalog item (e.g. an instance type such as `t3.micro`)
pub type ItemId = String;

/// Default number of concurrent calls for scripted runs
pub const DEFAULT_SCRIPT_CONCURRENCY: usize = 5;

/// Default number of concurrent calls for interactive runs
pub const DEFAULT_INTERACTIVE_CONCURRENCY: usize = 10;

/// Default maximum number of items per batch call
pub const DEFAULT_BATCH_SIZE_LIMIT: usize = 50;

/// Default number of attempts per call unit
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Default minimum spacing between the start of two calls
pub const DEFAULT_REQUEST_SPACING: Duration = Duration::from_millis(50);

/// Errors for requests that are malformed before any work is dispatched
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidInputError {
    /// The request contained no items
    #[error("Request contains no items")]
    EmptyRequest,

    /// The region is not known to the pricing service
    #[error("Unknown region: '{0}'")]
    UnknownRegion(String),

    /// A limit that must be positive was zero
    #[error("Invalid limit: {name} must be greater than zero")]
    InvalidLimit { name: &'static str },
}

/// Length of a reserved or savings plan commitment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseTerm {
    OneYear,
    ThreeYear,
}

impl LeaseTerm {
    /// Label used both on the wire and in cache keys
    pub fn label(&self) -> &'static str {
        match self {
            LeaseTerm::OneYear => "1yr",
            LeaseTerm::ThreeYear => "3yr",
        }
    }

    /// Parses a lease term, accepting a few common spellings
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "1yr" | "1y" | "1" | "one_year" => Some(LeaseTerm::OneYear),
            "3yr" | "3y" | "3" | "three_year" => Some(LeaseTerm::ThreeYear),
            _ => None,
        }
    }
}

/// Upfront payment choice for a reserved instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentOption {
    NoUpfront,
    PartialUpfront,
    AllUpfront,
}

impl PaymentOption {
    /// Label used in cache keys
    pub fn label(&self) -> &'static str {
        match self {
            PaymentOption::NoUpfront => "no_upfront",
            PaymentOption::PartialUpfront => "partial_upfront",
            PaymentOption::AllUpfront => "all_upfront",
        }
    }

    /// Name the pricing service uses for this option
    pub fn api_name(&self) -> &'static str {
        match self {
            PaymentOption::NoUpfront => "No Upfront",
            PaymentOption::PartialUpfront => "Partial Upfront",
            PaymentOption::AllUpfront => "All Upfront",
        }
    }

    /// Parses a payment option; dashes and underscores are interchangeable
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "no_upfront" | "none" => Some(PaymentOption::NoUpfront),
            "partial_upfront" | "partial" => Some(PaymentOption::PartialUpfront),
            "all_upfront" | "all" => Some(PaymentOption::AllUpfront),
            _ => None,
        }
    }
}

/// The pricing dimension being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriceKind {
    OnDemand,
    Spot,
    ReservedInstance {
        lease_term: LeaseTerm,
        payment_option: PaymentOption,
    },
    SavingsPlan {
        lease_term: LeaseTerm,
    },
}

impl PriceKind {
    /// Stable label identifying the cache partition and the remote query shape
    pub fn label(&self) -> String {
        match self {
            PriceKind::OnDemand => "on_demand".to_string(),
            PriceKind::Spot => "spot".to_string(),
            PriceKind::ReservedInstance {
                lease_term,
                payment_option,
            } => format!("ri_{}_{}", lease_term.label(), payment_option.label()),
            PriceKind::SavingsPlan { lease_term } => format!("savings_{}", lease_term.label()),
        }
    }

    /// Whether the pricing service answers this kind for many items per call
    pub fn supports_batch(&self) -> bool {
        matches!(self, PriceKind::Spot)
    }
}

impl fmt::Display for PriceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Replaces characters that are unsafe in storage keys
fn normalize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Identity of a cached price
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub region: String,
    pub item_id: ItemId,
    pub price_kind: PriceKind,
}

impl CacheKey {
    pub fn new(region: impl Into<String>, item_id: impl Into<ItemId>, price_kind: PriceKind) -> Self {
        Self {
            region: region.into(),
            item_id: item_id.into(),
            price_kind,
        }
    }

    /// Normalized `{region}_{item}_{kind}` string addressing the stored record
    pub fn storage_key(&self) -> String {
        format!(
            "{}_{}_{}",
            normalize_component(&self.region),
            normalize_component(&self.item_id),
            self.price_kind.label()
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// A batch of items to resolve for one region and price kind
///
/// Built by the caller and consumed by exactly one orchestrator run.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub item_ids: BTreeSet<ItemId>,
    pub region: String,
    pub price_kind: PriceKind,
    pub concurrency_limit: usize,
    pub batch_size_limit: usize,
    pub retry_limit: u32,
    pub request_spacing: Duration,
}

impl FetchRequest {
    /// Creates a request with the scripted-run defaults
    pub fn new<I, S>(item_ids: I, region: impl Into<String>, price_kind: PriceKind) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ItemId>,
    {
        Self {
            item_ids: item_ids.into_iter().map(Into::into).collect(),
            region: region.into(),
            price_kind,
            concurrency_limit: DEFAULT_SCRIPT_CONCURRENCY,
            batch_size_limit: DEFAULT_BATCH_SIZE_LIMIT,
            retry_limit: DEFAULT_RETRY_LIMIT,
            request_spacing: DEFAULT_REQUEST_SPACING,
        }
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_batch_size_limit(mut self, limit: usize) -> Self {
        self.batch_size_limit = limit;
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn with_request_spacing(mut self, spacing: Duration) -> Self {
        self.request_spacing = spacing;
        self
    }

    /// Checks the request can be dispatched at all
    pub fn validate(&self) -> Result<(), InvalidInputError> {
        if self.item_ids.is_empty() {
            return Err(InvalidInputError::EmptyRequest);
        }
        if region::pricing_location(&self.region).is_none() {
            return Err(InvalidInputError::UnknownRegion(self.region.clone()));
        }
        if self.concurrency_limit == 0 {
            return Err(InvalidInputError::InvalidLimit {
                name: "concurrency_limit",
            });
        }
        if self.batch_size_limit == 0 {
            return Err(InvalidInputError::InvalidLimit {
                name: "batch_size_limit",
            });
        }
        if self.retry_limit == 0 {
            return Err(InvalidInputError::InvalidLimit { name: "retry_limit" });
        }
        Ok(())
    }

    /// Cache key of one of this request's items
    pub fn cache_key(&self, item_id: &str) -> CacheKey {
        CacheKey::new(self.region.clone(), item_id, self.price_kind)
    }
}

/// Where a resolved value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    CacheHit,
    ApiSuccess,
    ApiFailure,
}

/// Final result for one item in one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub item_id: ItemId,
    /// `None` when no price exists or the lookup failed
    pub value: Option<Decimal>,
    pub origin: Origin,
}

impl FetchOutcome {
    pub fn new(item_id: impl Into<ItemId>, value: Option<Decimal>, origin: Origin) -> Self {
        Self {
            item_id: item_id.into(),
            value,
            origin,
        }
    }
}
