//! Read-only skin price oracle
//!
//! The liquidation engine compares live collateral value against the loan
//! principal; this adapter is the only place that talks to the pricing feed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::loan::CollateralItem;

/// Price feed errors
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("Price feed unavailable: {0}")]
    Unavailable(String),
}

/// Narrow read-only contract to the pricing feed
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Current combined market value of the given items, in cents.
    async fn current_value(&self, items: &[CollateralItem]) -> Result<i64, OracleError>;
}

#[derive(Debug, Serialize)]
struct QuoteRequest<'a> {
    market_hash_names: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    total_value: i64,
}

/// reqwest-backed pricing feed client
pub struct PriceFeedClient {
    http: reqwest::Client,
    base_url: String,
}

impl PriceFeedClient {
    pub fn new(base_url: String, call_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .expect("failed to build HTTP client");

        Self { http, base_url }
    }
}

#[async_trait]
impl PriceSource for PriceFeedClient {
    async fn current_value(&self, items: &[CollateralItem]) -> Result<i64, OracleError> {
        let request = QuoteRequest {
            market_hash_names: items.iter().map(|i| i.market_hash_name.as_str()).collect(),
        };

        let response = self
            .http
            .post(format!("{}/v1/quotes", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(OracleError::Unavailable(format!(
                "quote request returned {}",
                response.status()
            )));
        }

        let quote = response
            .json::<QuoteResponse>()
            .await
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;

        Ok(quote.total_value)
    }
}
