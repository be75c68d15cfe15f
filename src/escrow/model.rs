//! Trade offer models and the trading-network wire types

use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use crate::loan::CollateralItem;

/// Trade offer status. Terminal states (everything but Sent) are immutable
/// once reached; only Accepted may cause a loan transition.
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "trade_offer_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TradeOfferStatus {
    Sent,
    Accepted,
    Declined,
    Canceled,
    Expired,
}

impl TradeOfferStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TradeOfferStatus::Sent)
    }

    /// Single normalization boundary for the trading network's raw state
    /// strings. The network reports states in mixed case and with a couple of
    /// aliases; nothing outside the escrow adapter compares raw strings.
    pub fn from_network_state(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sent" | "active" | "pending" => Some(TradeOfferStatus::Sent),
            "accepted" => Some(TradeOfferStatus::Accepted),
            "declined" => Some(TradeOfferStatus::Declined),
            "canceled" | "cancelled" => Some(TradeOfferStatus::Canceled),
            "expired" | "timedout" => Some(TradeOfferStatus::Expired),
            _ => None,
        }
    }
}

/// Trade offer record. Owned by the escrow side of the system; loans hold
/// only a weak reference (offer id + cached URL).
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct TradeOffer {
    pub trade_id: Uuid,
    pub loan_id: Uuid,
    /// Offer id assigned by the trading network.
    pub offer_id: String,
    pub url: String,
    pub status: TradeOfferStatus,
    pub items: Json<Vec<CollateralItem>>,
    pub total_value: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ===== Trading-network wire types =====

/// Body sent to the trading network when opening an offer.
#[derive(Debug, Serialize)]
pub struct CreateOfferPayload {
    pub partner_id: String,
    pub asset_ids: Vec<String>,
    pub message: String,
}

/// Response from the trading network for offer creation.
#[derive(Debug, Deserialize)]
pub struct CreateOfferResponse {
    pub offer_id: String,
    pub url: String,
}

/// Response from the trading network for an offer state query. The state is
/// a raw string here and nowhere past the adapter.
#[derive(Debug, Deserialize)]
pub struct OfferStateResponse {
    pub state: String,
}

/// Response from the trading network for an offer cancellation.
#[derive(Debug, Deserialize)]
pub struct CancelOfferResponse {
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_state_normalization() {
        assert_eq!(
            TradeOfferStatus::from_network_state("Accepted"),
            Some(TradeOfferStatus::Accepted)
        );
        assert_eq!(
            TradeOfferStatus::from_network_state("  ACTIVE "),
            Some(TradeOfferStatus::Sent)
        );
        assert_eq!(
            TradeOfferStatus::from_network_state("cancelled"),
            Some(TradeOfferStatus::Canceled)
        );
        assert_eq!(
            TradeOfferStatus::from_network_state("TimedOut"),
            Some(TradeOfferStatus::Expired)
        );
        assert_eq!(TradeOfferStatus::from_network_state("garbage"), None);
    }

    #[test]
    fn terminal_offer_states() {
        assert!(!TradeOfferStatus::Sent.is_terminal());
        assert!(TradeOfferStatus::Accepted.is_terminal());
        assert!(TradeOfferStatus::Declined.is_terminal());
        assert!(TradeOfferStatus::Canceled.is_terminal());
        assert!(TradeOfferStatus::Expired.is_terminal());
    }
}
