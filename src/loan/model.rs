//! Loan models for the escrow and liquidation coordinator

use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;
use validator::Validate;

/// Loan status enum. Exactly one holder of truth for a loan's lifecycle
/// position; every mutation goes through the state machine.
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "loan_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Created,
    EscrowPending,
    EscrowHeld,
    Active,
    Repaid,
    Liquidated,
    Expired,
    Canceled,
}

impl LoanStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoanStatus::Repaid | LoanStatus::Liquidated | LoanStatus::Expired | LoanStatus::Canceled
        )
    }
}

/// A single collateral item locked behind a trade offer. Immutable once the
/// loan reaches escrow_pending; value_at_lock is the appraisal at lock time,
/// not the live market price.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CollateralItem {
    pub asset_id: String,
    pub market_hash_name: String,
    pub value_at_lock: i64,
}

/// Loan aggregate.
///
/// start_time and end_time stay NULL until the escrow_held -> active
/// transition confirms the vault borrow; end_time = start_time + duration_days
/// and is written exactly once.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct Loan {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Trading-network account the collateral trade is sent to.
    pub external_identity_id: String,
    pub collateral_items: Json<Vec<CollateralItem>>,
    /// Principal in cents.
    pub principal: i64,
    pub duration_days: i32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: LoanStatus,
    /// Weak reference to the associated trade offer; the offer record itself
    /// lives in trade_offers.
    pub trade_offer_id: Option<String>,
    pub trade_url: Option<String>,
    /// Confirmed vault borrow transaction signature.
    pub vault_tx: Option<String>,
    /// Set when a failed borrow cancels the loan and the locked items still
    /// have to be traded back to the user.
    pub collateral_return_pending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loan {
    pub fn collateral(&self) -> &[CollateralItem] {
        &self.collateral_items.0
    }

    /// Total appraised value at lock time.
    pub fn locked_value(&self) -> i64 {
        self.collateral().iter().map(|i| i.value_at_lock).sum()
    }
}

/// What a trade-offer resolution means for the loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowOutcome {
    Accepted,
    Rejected,
}

/// What triggered a liquidation attempt.
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "liquidation_trigger", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LiquidationTrigger {
    Overdue,
    PriceDrop,
    Manual,
}

/// Append-only audit record for a liquidation attempt. resulting_status is
/// the loan status after the attempt, so a failed chain call is recorded with
/// the loan still active.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct LiquidationEvent {
    pub id: Uuid,
    pub loan_id: Uuid,
    pub triggered_by: LiquidationTrigger,
    pub resulting_status: LoanStatus,
    pub created_at: DateTime<Utc>,
}

/// Request to create a new loan
#[derive(Debug, Deserialize, Validate)]
pub struct CreateLoanRequest {
    pub user_id: Uuid,
    #[validate(length(min = 1))]
    pub external_identity_id: String,
    #[validate(length(min = 1))]
    pub collateral_items: Vec<CollateralItem>,
    #[validate(range(min = 1))]
    pub principal: i64,
    #[validate(range(min = 1))]
    pub duration_days: i32,
}

/// Query for listing loans
#[derive(Debug, Deserialize)]
pub struct ListLoansQuery {
    pub user_id: Option<Uuid>,
    pub status: Option<LoanStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(LoanStatus::Repaid.is_terminal());
        assert!(LoanStatus::Liquidated.is_terminal());
        assert!(LoanStatus::Expired.is_terminal());
        assert!(LoanStatus::Canceled.is_terminal());

        assert!(!LoanStatus::Created.is_terminal());
        assert!(!LoanStatus::EscrowPending.is_terminal());
        assert!(!LoanStatus::EscrowHeld.is_terminal());
        assert!(!LoanStatus::Active.is_terminal());
    }

    #[test]
    fn locked_value_sums_items() {
        let loan = Loan {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            external_identity_id: "76561198000000000".to_string(),
            collateral_items: Json(vec![
                CollateralItem {
                    asset_id: "a1".to_string(),
                    market_hash_name: "AK-47 | Redline (Field-Tested)".to_string(),
                    value_at_lock: 1500,
                },
                CollateralItem {
                    asset_id: "a2".to_string(),
                    market_hash_name: "AWP | Asiimov (Well-Worn)".to_string(),
                    value_at_lock: 6200,
                },
            ]),
            principal: 5000,
            duration_days: 14,
            start_time: None,
            end_time: None,
            status: LoanStatus::Created,
            trade_offer_id: None,
            trade_url: None,
            vault_tx: None,
            collateral_return_pending: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(loan.locked_value(), 7700);
    }

    #[test]
    fn create_request_validation() {
        let mut request = CreateLoanRequest {
            user_id: Uuid::new_v4(),
            external_identity_id: "76561198000000000".to_string(),
            collateral_items: vec![CollateralItem {
                asset_id: "a1".to_string(),
                market_hash_name: "Glock-18 | Fade (Factory New)".to_string(),
                value_at_lock: 30000,
            }],
            principal: 10000,
            duration_days: 14,
        };
        assert!(request.validate().is_ok());

        request.principal = 0;
        assert!(request.validate().is_err());

        request.principal = 10000;
        request.collateral_items.clear();
        assert!(request.validate().is_err());
    }
}
