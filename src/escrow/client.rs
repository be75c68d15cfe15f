//! Trading-network adapter
//!
//! Thin client over the external trading network's offer API. All side
//! effects are external; the only state held here is a short-lived debounce
//! cache so a duplicate send for the same loan inside the window returns the
//! already-open offer instead of creating a second one.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::escrow::model::{
    CancelOfferResponse, CreateOfferPayload, CreateOfferResponse, OfferStateResponse, TradeOffer,
    TradeOfferStatus,
};
use crate::escrow::rate_limit::PollRateLimiter;
use crate::loan::CollateralItem;
use crate::retry::RetryPolicy;

/// Escrow adapter errors
#[derive(Debug, thiserror::Error)]
pub enum EscrowError {
    /// Transient network or auth failure; the caller's state is untouched and
    /// the operation can be retried.
    #[error("Trading network unavailable: {0}")]
    Unavailable(String),

    #[error("Offer {0} is already terminal and cannot be canceled")]
    NotCancelable(String),

    #[error("Unrecognized offer state from trading network: {0}")]
    UnrecognizedState(String),
}

/// Narrow contract to the trading network
#[async_trait]
pub trait EscrowGateway: Send + Sync {
    /// Open a trade offer locking `items` against `loan_id`. Retried
    /// internally with bounded exponential backoff.
    async fn open_offer(
        &self,
        loan_id: Uuid,
        partner_id: &str,
        items: &[CollateralItem],
        message: &str,
    ) -> Result<TradeOffer, EscrowError>;

    /// Read the offer's current state. Safe to call repeatedly; throttled
    /// under the configured poll-rate ceiling.
    async fn get_status(&self, offer_id: &str) -> Result<TradeOfferStatus, EscrowError>;

    /// Cancel an open offer. Fails closed with `NotCancelable` when the offer
    /// already reached a terminal state.
    async fn cancel_offer(&self, offer_id: &str) -> Result<(), EscrowError>;
}

/// reqwest-backed trading network client
pub struct TradeNetworkClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
    poll_limiter: PollRateLimiter,
    debounce_window: Duration,
    recent_offers: RwLock<HashMap<Uuid, (TradeOffer, Instant)>>,
}

impl TradeNetworkClient {
    pub fn new(
        base_url: String,
        api_key: String,
        call_timeout: Duration,
        retry: RetryPolicy,
        poll_rate_per_minute: u32,
        debounce_window: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            base_url,
            api_key,
            retry,
            poll_limiter: PollRateLimiter::new(poll_rate_per_minute),
            debounce_window,
            recent_offers: RwLock::new(HashMap::new()),
        }
    }

    async fn cached_offer(&self, loan_id: Uuid) -> Option<TradeOffer> {
        let cache = self.recent_offers.read().await;
        cache.get(&loan_id).and_then(|(offer, sent_at)| {
            (sent_at.elapsed() < self.debounce_window).then(|| offer.clone())
        })
    }

    async fn remember_offer(&self, loan_id: Uuid, offer: &TradeOffer) {
        let mut cache = self.recent_offers.write().await;
        cache.retain(|_, (_, sent_at)| sent_at.elapsed() < self.debounce_window);
        cache.insert(loan_id, (offer.clone(), Instant::now()));
    }

    async fn submit_offer(
        &self,
        payload: &CreateOfferPayload,
    ) -> Result<CreateOfferResponse, EscrowError> {
        let response = self
            .http
            .post(format!("{}/v1/offers", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| EscrowError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EscrowError::Unavailable(format!(
                "offer creation returned {}",
                response.status()
            )));
        }

        response
            .json::<CreateOfferResponse>()
            .await
            .map_err(|e| EscrowError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl EscrowGateway for TradeNetworkClient {
    async fn open_offer(
        &self,
        loan_id: Uuid,
        partner_id: &str,
        items: &[CollateralItem],
        message: &str,
    ) -> Result<TradeOffer, EscrowError> {
        if let Some(offer) = self.cached_offer(loan_id).await {
            tracing::debug!(%loan_id, offer_id = %offer.offer_id, "Returning debounced trade offer");
            return Ok(offer);
        }

        let payload = CreateOfferPayload {
            partner_id: partner_id.to_string(),
            asset_ids: items.iter().map(|i| i.asset_id.clone()).collect(),
            message: message.to_string(),
        };

        let mut last_error = None;
        for attempt in 0..self.retry.max_attempts {
            match self.submit_offer(&payload).await {
                Ok(created) => {
                    let now = Utc::now();
                    let offer = TradeOffer {
                        trade_id: Uuid::new_v4(),
                        loan_id,
                        offer_id: created.offer_id,
                        url: created.url,
                        status: TradeOfferStatus::Sent,
                        items: Json(items.to_vec()),
                        total_value: items.iter().map(|i| i.value_at_lock).sum(),
                        created_at: now,
                        updated_at: now,
                    };
                    self.remember_offer(loan_id, &offer).await;
                    return Ok(offer);
                }
                Err(e) => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        %loan_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Trade offer submission failed: {}",
                        e
                    );
                    last_error = Some(e);
                    if attempt + 1 < self.retry.max_attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| EscrowError::Unavailable("offer submission failed".to_string())))
    }

    async fn get_status(&self, offer_id: &str) -> Result<TradeOfferStatus, EscrowError> {
        if !self.poll_limiter.check(offer_id).await {
            return Err(EscrowError::Unavailable(
                "status poll rate ceiling reached".to_string(),
            ));
        }

        let response = self
            .http
            .get(format!("{}/v1/offers/{}", self.base_url, offer_id))
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| EscrowError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EscrowError::Unavailable(format!(
                "offer state query returned {}",
                response.status()
            )));
        }

        let state = response
            .json::<OfferStateResponse>()
            .await
            .map_err(|e| EscrowError::Unavailable(e.to_string()))?;

        TradeOfferStatus::from_network_state(&state.state)
            .ok_or(EscrowError::UnrecognizedState(state.state))
    }

    async fn cancel_offer(&self, offer_id: &str) -> Result<(), EscrowError> {
        let response = self
            .http
            .post(format!("{}/v1/offers/{}/cancel", self.base_url, offer_id))
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| EscrowError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EscrowError::Unavailable(format!(
                "offer cancel returned {}",
                response.status()
            )));
        }

        let result = response
            .json::<CancelOfferResponse>()
            .await
            .map_err(|e| EscrowError::Unavailable(e.to_string()))?;

        if result.cancelled {
            Ok(())
        } else {
            Err(EscrowError::NotCancelable(offer_id.to_string()))
        }
    }
}

