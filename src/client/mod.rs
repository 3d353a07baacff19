//! Quote client for the remote pricing service
//!
//! `QuoteClient` is the seam between the orchestrator and the network. The
//! HTTP implementation lives in [`http`]; tests plug in scripted stubs.

mod http;

pub use http::HttpQuoteClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::lifecycle::LifecycleError;
use crate::model::{ItemId, PriceKind};

/// Successful answer to a single-item query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quote {
    Price(Decimal),
    /// The service has no quote for this item, region and kind
    NotFound,
}

impl Quote {
    pub fn value(&self) -> Option<Decimal> {
        match self {
            Quote::Price(price) => Some(*price),
            Quote::NotFound => None,
        }
    }
}

/// One quote inside a batch page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchQuote {
    pub item_id: ItemId,
    pub price: Decimal,
    /// When the service observed the price; later observations win
    pub observed_at: Option<DateTime<Utc>>,
}

impl BatchQuote {
    pub fn new(item_id: impl Into<ItemId>, price: Decimal) -> Self {
        Self {
            item_id: item_id.into(),
            price,
            observed_at: None,
        }
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = Some(at);
        self
    }
}

/// One page of a batch query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPage {
    pub quotes: Vec<BatchQuote>,
    /// Continuation token; `None` on the last page
    pub next_token: Option<String>,
}

/// Errors from a single client call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuoteError {
    /// The service throttled the request
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The request timed out
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Connection or server-side failure
    #[error("Transport failure: {0}")]
    Transport(String),

    /// A failure that fits no known category
    #[error("Unexpected error: {0}")]
    Unexpected(String),

    /// The service rejected the request; retrying will not help
    #[error("Request rejected (status {status:?}): {message}")]
    Fatal { status: Option<u16>, message: String },

    /// The client's connections were released
    #[error("Client released: {0}")]
    Released(String),
}

impl QuoteError {
    /// Whether the call should be retried
    ///
    /// Unexpected errors are retried like transient ones.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QuoteError::RateLimited(_)
                | QuoteError::Timeout(_)
                | QuoteError::Transport(_)
                | QuoteError::Unexpected(_)
        )
    }

    pub fn is_unexpected(&self) -> bool {
        matches!(self, QuoteError::Unexpected(_))
    }
}

impl From<LifecycleError> for QuoteError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::Released(name) => QuoteError::Released(name),
            LifecycleError::Create(message) => QuoteError::Transport(message),
        }
    }
}

/// Access to the remote pricing service
#[async_trait]
pub trait QuoteClient: Send + Sync {
    /// Fetches the price of one item
    async fn fetch_one(
        &self,
        item_id: &str,
        region: &str,
        price_kind: PriceKind,
    ) -> Result<Quote, QuoteError>;

    /// Fetches one page of prices for several items
    ///
    /// Only called for kinds where `PriceKind::supports_batch` holds. Items
    /// without a quote are simply missing from the page.
    async fn fetch_batch(
        &self,
        item_ids: &[ItemId],
        region: &str,
        price_kind: PriceKind,
        next_token: Option<&str>,
    ) -> Result<BatchPage, QuoteError>;

    /// Releases pooled connections; returns `true` for the call that did the work
    fn release(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(QuoteError::RateLimited("429".into()).is_transient());
        assert!(QuoteError::Timeout("read".into()).is_transient());
        assert!(QuoteError::Transport("reset".into()).is_transient());
        assert!(QuoteError::Unexpected("?".into()).is_transient());
        assert!(!QuoteError::Fatal {
            status: Some(403),
            message: "denied".into()
        }
        .is_transient());
        assert!(!QuoteError::Released("pool".into()).is_transient());
    }

    #[test]
    fn test_lifecycle_errors_map_to_quote_errors() {
        assert_eq!(
            QuoteError::from(LifecycleError::Released("http".into())),
            QuoteError::Released("http".into())
        );
        assert!(QuoteError::from(LifecycleError::Create("tls".into())).is_transient());
    }

    #[test]
    fn test_quote_value() {
        assert_eq!(Quote::Price(Decimal::ONE).value(), Some(Decimal::ONE));
        assert_eq!(Quote::NotFound.value(), None);
    }
}
