//! HTTP quote client for the pricing service
//!
//! Single-item queries return a list of offers; the lowest positive hourly USD
//! offer at the requested location wins. Batch queries return pages of
//! timestamped quotes chained by continuation tokens.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{BatchPage, BatchQuote, Quote, QuoteClient, QuoteError};
use crate::config::Settings;
use crate::lifecycle::{LifecycleError, Release, ResourceManager};
use crate::model::{ItemId, PriceKind};
use crate::region;

/// Path of the single-item quote endpoint
const QUOTES_PATH: &str = "/v1/quotes";

/// Path of the batch quote endpoint
const BATCH_PATH: &str = "/v1/quotes/batch";

/// Results requested per batch page; several zones may quote the same item
const BATCH_MAX_RESULTS: u32 = 1000;

/// Error codes the service uses for throttling, whatever the HTTP status
const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
];

/// Client for the pricing service over pooled HTTP connections
///
/// Each pooled connection is its own `reqwest::Client`. A connection that saw
/// a failed call is discarded and replaced on next use.
pub struct HttpQuoteClient {
    endpoint: String,
    connections: Arc<ResourceManager<Client>>,
}

/// Timeouts applied to every pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Timeouts {
    connect: Duration,
    /// Longest gap between two reads of one response
    read: Duration,
    /// Whole-request limit for the slow pricing endpoint
    total: Duration,
}

impl Timeouts {
    fn from_settings(settings: &Settings) -> Self {
        Self {
            connect: settings.connect_timeout(),
            read: settings.read_timeout(),
            total: settings.pricing_read_timeout(),
        }
    }
}

impl HttpQuoteClient {
    /// Creates a client with timeouts and pool size from settings
    pub fn new(settings: &Settings) -> Self {
        let timeouts = Timeouts::from_settings(settings);
        let connections = ResourceManager::new(
            "pricing-http",
            settings.connection_pool_size,
            move |_| {
                Client::builder()
                    .connect_timeout(timeouts.connect)
                    .read_timeout(timeouts.read)
                    .timeout(timeouts.total)
                    .pool_max_idle_per_host(1)
                    .build()
                    .map_err(|e| LifecycleError::Create(e.to_string()))
            },
        );
        Self::with_connections(settings.endpoint.clone(), connections)
    }

    /// Creates a client over an existing connection pool
    pub fn with_connections(
        endpoint: impl Into<String>,
        connections: Arc<ResourceManager<Client>>,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            connections,
        }
    }

    /// The connection pool backing this client
    pub fn connections(&self) -> &Arc<ResourceManager<Client>> {
        &self.connections
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    /// Runs one request on a pooled connection
    ///
    /// Returns `Ok(None)` for 404. The connection is discarded on any error.
    async fn execute<F>(&self, build: F) -> Result<Option<String>, QuoteError>
    where
        F: FnOnce(&Client) -> RequestBuilder,
    {
        let mut connection = self.connections.acquire().await?;
        let request = build(&*connection);
        let result = send(request).await;
        if let Err(ref e) = result {
            debug!(connection = connection.id(), error = %e, "discarding connection after failed call");
            connection.discard();
        }
        result
    }
}

async fn send(request: RequestBuilder) -> Result<Option<String>, QuoteError> {
    let response = request.send().await.map_err(classify_transport)?;
    let status = response.status();
    let body = response.text().await.map_err(classify_transport)?;
    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    classify_status(status.as_u16(), &body)?;
    Ok(Some(body))
}

#[async_trait]
impl QuoteClient for HttpQuoteClient {
    async fn fetch_one(
        &self,
        item_id: &str,
        region: &str,
        price_kind: PriceKind,
    ) -> Result<Quote, QuoteError> {
        let location = region::pricing_location(region).ok_or_else(|| QuoteError::Fatal {
            status: None,
            message: format!("unknown region '{}'", region),
        })?;
        let url = self.url(QUOTES_PATH);
        let kind = price_kind.label();

        let body = self
            .execute(|client| {
                client.get(&url).query(&[
                    ("region", region),
                    ("location", location),
                    ("item", item_id),
                    ("kind", kind.as_str()),
                ])
            })
            .await?;

        let Some(body) = body else {
            return Ok(Quote::NotFound);
        };
        let response: ProductsResponse = serde_json::from_str(&body)
            .map_err(|e| QuoteError::Unexpected(format!("invalid quote response: {}", e)))?;

        Ok(best_offer(&response.offers, location, price_kind).map_or(Quote::NotFound, Quote::Price))
    }

    async fn fetch_batch(
        &self,
        item_ids: &[ItemId],
        region: &str,
        price_kind: PriceKind,
        next_token: Option<&str>,
    ) -> Result<BatchPage, QuoteError> {
        let url = self.url(BATCH_PATH);
        let payload = BatchRequest {
            region,
            kind: price_kind.label(),
            items: item_ids,
            max_results: BATCH_MAX_RESULTS,
            next_token,
        };

        let body = self.execute(|client| client.post(&url).json(&payload)).await?;

        let Some(body) = body else {
            return Ok(BatchPage::default());
        };
        let response: BatchResponse = serde_json::from_str(&body)
            .map_err(|e| QuoteError::Unexpected(format!("invalid batch response: {}", e)))?;

        Ok(parse_batch_page(response))
    }

    fn release(&self) -> bool {
        self.connections.release_all()
    }
}

/// Maps a non-success HTTP status to the error taxonomy
fn classify_status(status: u16, body: &str) -> Result<(), QuoteError> {
    if (200..300).contains(&status) {
        return Ok(());
    }

    let error: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = error
        .message
        .clone()
        .unwrap_or_else(|| format!("HTTP {}", status));
    let throttled = error
        .code
        .as_deref()
        .is_some_and(|code| THROTTLING_CODES.contains(&code));

    if status == 429 || throttled {
        return Err(QuoteError::RateLimited(message));
    }
    match status {
        408 | 504 => Err(QuoteError::Timeout(message)),
        500..=599 => Err(QuoteError::Transport(message)),
        _ => Err(QuoteError::Fatal {
            status: Some(status),
            message,
        }),
    }
}

/// Maps a reqwest failure to the error taxonomy
fn classify_transport(err: reqwest::Error) -> QuoteError {
    if err.is_timeout() {
        QuoteError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() || err.is_body() {
        QuoteError::Transport(err.to_string())
    } else {
        QuoteError::Unexpected(err.to_string())
    }
}

/// Picks the cheapest positive hourly USD offer that matches location and kind
fn best_offer(offers: &[Offer], location: &str, price_kind: PriceKind) -> Option<Decimal> {
    let wanted = location.to_lowercase();

    offers
        .iter()
        .filter(|offer| {
            let found = offer.location.to_lowercase();
            found.contains(&wanted) || (!found.is_empty() && wanted.contains(&found))
        })
        .filter(|offer| offer.matches_kind(price_kind))
        .filter(|offer| offer.is_hourly(price_kind))
        .filter_map(|offer| {
            let raw = offer.price_per_unit.get("USD")?;
            match Decimal::from_str(raw.trim()) {
                Ok(price) if price > Decimal::ZERO => Some(price),
                Ok(_) => None,
                Err(e) => {
                    warn!(price = %raw, error = %e, "skipping unparseable offer price");
                    None
                }
            }
        })
        .min()
}

/// Keeps the most recent quote per item within a page
fn parse_batch_page(response: BatchResponse) -> BatchPage {
    let mut latest: HashMap<String, BatchQuote> = HashMap::new();

    for quote in response.quotes {
        let price = match Decimal::from_str(quote.price.trim()) {
            Ok(price) if price > Decimal::ZERO => price,
            _ => {
                warn!(item = %quote.item_id, price = %quote.price, "skipping invalid batch price");
                continue;
            }
        };
        let candidate = BatchQuote {
            item_id: quote.item_id,
            price,
            observed_at: quote.timestamp,
        };
        let newer = latest
            .get(&candidate.item_id)
            .map_or(true, |existing| candidate.observed_at > existing.observed_at);
        if newer {
            latest.insert(candidate.item_id.clone(), candidate);
        }
    }

    let mut quotes: Vec<BatchQuote> = latest.into_values().collect();
    quotes.sort_by(|a, b| a.item_id.cmp(&b.item_id));

    BatchPage {
        quotes,
        next_token: response.next_token.filter(|token| !token.is_empty()),
    }
}

/// Single-item quote response
#[derive(Debug, Deserialize)]
struct ProductsResponse {
    #[serde(default)]
    offers: Vec<Offer>,
}

/// One priced offer for an item
#[derive(Debug, Deserialize)]
struct Offer {
    #[serde(default)]
    location: String,
    #[serde(default)]
    unit: String,
    #[serde(default)]
    term: Option<OfferTerm>,
    #[serde(default)]
    price_per_unit: HashMap<String, String>,
}

impl Offer {
    fn matches_kind(&self, price_kind: PriceKind) -> bool {
        match price_kind {
            PriceKind::OnDemand | PriceKind::Spot => self.term.is_none(),
            PriceKind::ReservedInstance {
                lease_term,
                payment_option,
            } => self.term.as_ref().is_some_and(|term| {
                term.lease_contract_length.as_deref() == Some(lease_term.label())
                    && term.purchase_option.as_deref() == Some(payment_option.api_name())
                    && term.offering_class.as_deref() == Some("standard")
            }),
            PriceKind::SavingsPlan { lease_term } => self.term.as_ref().is_some_and(|term| {
                term.lease_contract_length.as_deref() == Some(lease_term.label())
                    && term.purchase_option.as_deref() == Some("No Upfront")
            }),
        }
    }

    /// Hourly units; on-demand offers may leave the unit empty
    fn is_hourly(&self, price_kind: PriceKind) -> bool {
        if self.unit.contains("Hr") {
            return true;
        }
        self.unit.is_empty() && matches!(price_kind, PriceKind::OnDemand | PriceKind::Spot)
    }
}

/// Commitment terms attached to reserved and savings plan offers
#[derive(Debug, Deserialize)]
struct OfferTerm {
    lease_contract_length: Option<String>,
    purchase_option: Option<String>,
    offering_class: Option<String>,
}

/// Batch query body
#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    region: &'a str,
    kind: String,
    items: &'a [ItemId],
    max_results: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
}

/// Batch query response page
#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    quotes: Vec<WireBatchQuote>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireBatchQuote {
    item_id: String,
    price: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Error body returned alongside non-success statuses
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}
