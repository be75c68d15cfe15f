//! Loan state machine
//!
//! The only component allowed to mutate loan state. Every transition is
//! guarded against the loan's current status, applied under a per-loan lock,
//! and persisted through the store's conditional write, so a poller resolving
//! an offer and a liquidation scan evaluating the same loan cannot race into
//! an inconsistent state.
//!
//! Duplicate deliveries are absorbed rather than re-applied: a transition
//! whose target state the loan already occupies returns the stored loan
//! unchanged, while any other wrong-source attempt is rejected with
//! `InvalidTransition`.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;
use validator::Validate;

use crate::escrow::{EscrowError, EscrowGateway, TradeOffer};
use crate::loan::store::{LoanStore, LoanUpdate, StoreError};
use crate::loan::{CreateLoanRequest, EscrowOutcome, LiquidationTrigger, Loan, LoanStatus};
use crate::vault::TxSignature;

/// State machine errors
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    /// The loan was not in the required source state. Logged and rejected;
    /// nothing was mutated.
    #[error("Invalid transition for loan {loan_id}: {from:?} -> {attempted}")]
    InvalidTransition {
        loan_id: Uuid,
        from: LoanStatus,
        attempted: &'static str,
    },

    #[error("Loan {0} not found")]
    NotFound(Uuid),

    #[error("Invalid loan request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error("Storage error: {0}")]
    Storage(StoreError),
}

/// Outcome of a transition attempt. `changed` is false when the call was a
/// duplicate absorbed by the idempotence rule.
#[derive(Debug, Clone)]
pub struct Transitioned {
    pub loan: Loan,
    pub changed: bool,
}

/// Per-loan mutual exclusion domain. One async mutex per loan id, created on
/// first use; never a global lock across loans.
#[derive(Default)]
struct LoanLocks {
    inner: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl LoanLocks {
    async fn acquire(&self, loan_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            locks
                .entry(loan_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Canonical owner of loan lifecycle state
pub struct LoanStateMachine {
    store: Arc<dyn LoanStore>,
    escrow: Arc<dyn EscrowGateway>,
    locks: LoanLocks,
}

impl LoanStateMachine {
    pub fn new(store: Arc<dyn LoanStore>, escrow: Arc<dyn EscrowGateway>) -> Self {
        Self {
            store,
            escrow,
            locks: LoanLocks::default(),
        }
    }

    /// Create a new loan in `Created`. Collateral and principal are fixed
    /// here, before any escrow activity.
    pub async fn create(&self, request: CreateLoanRequest) -> Result<Loan, TransitionError> {
        request
            .validate()
            .map_err(|e| TransitionError::InvalidRequest(e.to_string()))?;

        let now = Utc::now();
        let loan = Loan {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            external_identity_id: request.external_identity_id,
            collateral_items: sqlx::types::Json(request.collateral_items),
            principal: request.principal,
            duration_days: request.duration_days,
            start_time: None,
            end_time: None,
            status: LoanStatus::Created,
            trade_offer_id: None,
            trade_url: None,
            vault_tx: None,
            collateral_return_pending: false,
            created_at: now,
            updated_at: now,
        };

        self.store
            .insert(&loan)
            .await
            .map_err(TransitionError::Storage)?;

        tracing::info!(loan_id = %loan.id, principal = loan.principal, "Loan created");

        Ok(loan)
    }

    /// Open the collateral trade offer and move `Created -> EscrowPending`.
    /// A repeat call while the offer is still open returns the existing
    /// offer instead of sending a second one.
    pub async fn request_escrow(&self, loan_id: Uuid) -> Result<TradeOffer, TransitionError> {
        let loan = self.load(loan_id).await?;

        if loan.status == LoanStatus::EscrowPending {
            if let Some(offer) = self
                .store
                .trade_offer_for_loan(loan_id)
                .await
                .map_err(TransitionError::Storage)?
            {
                return Ok(offer);
            }
        }

        if loan.status != LoanStatus::Created {
            return Err(TransitionError::InvalidTransition {
                loan_id,
                from: loan.status,
                attempted: "request_escrow",
            });
        }

        // The network call happens before the lock is taken; only the state
        // update runs under it.
        let message = format!(
            "Collateral lock for loan {} ({} cents over {} days)",
            loan.id, loan.principal, loan.duration_days
        );
        let offer = self
            .escrow
            .open_offer(
                loan_id,
                &loan.external_identity_id,
                loan.collateral(),
                &message,
            )
            .await?;

        self.store
            .insert_trade_offer(&offer)
            .await
            .map_err(TransitionError::Storage)?;

        let result = self
            .apply(
                loan_id,
                LoanStatus::Created,
                LoanStatus::EscrowPending,
                "request_escrow",
                LoanUpdate {
                    trade_offer_id: Some(offer.offer_id.clone()),
                    trade_url: Some(offer.url.clone()),
                    ..Default::default()
                },
            )
            .await;

        match result {
            Ok(_) => Ok(offer),
            Err(e) => {
                // Lost the race; withdraw the freshly opened offer so the
                // loan never holds two.
                if let Err(cancel_err) = self.escrow.cancel_offer(&offer.offer_id).await {
                    tracing::warn!(
                        %loan_id,
                        offer_id = %offer.offer_id,
                        "Failed to withdraw orphaned offer: {}",
                        cancel_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Apply a trade-offer resolution observed by the poller.
    pub async fn on_escrow_resolved(
        &self,
        loan_id: Uuid,
        outcome: EscrowOutcome,
    ) -> Result<Transitioned, TransitionError> {
        match outcome {
            EscrowOutcome::Accepted => {
                self.apply(
                    loan_id,
                    LoanStatus::EscrowPending,
                    LoanStatus::EscrowHeld,
                    "on_escrow_resolved(accepted)",
                    LoanUpdate::default(),
                )
                .await
            }
            EscrowOutcome::Rejected => {
                self.apply(
                    loan_id,
                    LoanStatus::EscrowPending,
                    LoanStatus::Canceled,
                    "on_escrow_resolved(rejected)",
                    LoanUpdate::default(),
                )
                .await
            }
        }
    }

    /// Move `EscrowHeld -> Active` on a confirmed vault borrow. Sets
    /// start_time to the activation instant and end_time exactly once; a
    /// duplicate call on an already-active loan changes nothing.
    pub async fn activate(
        &self,
        loan_id: Uuid,
        vault_tx: TxSignature,
    ) -> Result<Transitioned, TransitionError> {
        let start_time = Utc::now();
        let end_time = start_time
            + Duration::days(i64::from(self.load(loan_id).await?.duration_days));

        self.apply(
            loan_id,
            LoanStatus::EscrowHeld,
            LoanStatus::Active,
            "activate",
            LoanUpdate {
                start_time: Some(start_time),
                end_time: Some(end_time),
                vault_tx: Some(vault_tx.0),
                ..Default::default()
            },
        )
        .await
    }

    /// Move `EscrowHeld -> Canceled` after the vault borrow exhausted its
    /// retries. The collateral-return flag marks the items for send-back.
    pub async fn on_borrow_failed(&self, loan_id: Uuid) -> Result<Transitioned, TransitionError> {
        self.apply(
            loan_id,
            LoanStatus::EscrowHeld,
            LoanStatus::Canceled,
            "on_borrow_failed",
            LoanUpdate {
                collateral_return_pending: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    /// Move `Active -> Repaid`.
    pub async fn repay(&self, loan_id: Uuid) -> Result<Transitioned, TransitionError> {
        self.apply(
            loan_id,
            LoanStatus::Active,
            LoanStatus::Repaid,
            "repay",
            LoanUpdate::default(),
        )
        .await
    }

    /// Move `Active -> Liquidated`. Called by the liquidation engine after
    /// the on-chain liquidation confirmed.
    pub async fn liquidate(
        &self,
        loan_id: Uuid,
        reason: LiquidationTrigger,
    ) -> Result<Transitioned, TransitionError> {
        let result = self
            .apply(
                loan_id,
                LoanStatus::Active,
                LoanStatus::Liquidated,
                "liquidate",
                LoanUpdate::default(),
            )
            .await?;

        if result.changed {
            tracing::info!(%loan_id, ?reason, "Loan liquidated");
        }

        Ok(result)
    }

    /// Move `Active -> Expired`: the loan ran past its end time and there is
    /// no liquidation action to take.
    pub async fn mark_expired(&self, loan_id: Uuid) -> Result<Transitioned, TransitionError> {
        self.apply(
            loan_id,
            LoanStatus::Active,
            LoanStatus::Expired,
            "mark_expired",
            LoanUpdate::default(),
        )
        .await
    }

    /// User-initiated cancel. Honored only in `EscrowPending`; once the
    /// collateral is held, exit goes through repay or liquidate.
    pub async fn cancel(&self, loan_id: Uuid) -> Result<Transitioned, TransitionError> {
        let result = self
            .apply(
                loan_id,
                LoanStatus::EscrowPending,
                LoanStatus::Canceled,
                "cancel",
                LoanUpdate::default(),
            )
            .await?;

        if result.changed {
            if let Some(offer_id) = result.loan.trade_offer_id.clone() {
                match self.escrow.cancel_offer(&offer_id).await {
                    Ok(()) => {}
                    Err(EscrowError::NotCancelable(_)) => {
                        tracing::debug!(%loan_id, %offer_id, "Offer already terminal, nothing to cancel");
                    }
                    Err(e) => {
                        tracing::warn!(%loan_id, %offer_id, "Offer cancel failed: {}", e);
                    }
                }
            }
        }

        Ok(result)
    }

    async fn load(&self, loan_id: Uuid) -> Result<Loan, TransitionError> {
        self.store
            .get(loan_id)
            .await
            .map_err(TransitionError::Storage)?
            .ok_or(TransitionError::NotFound(loan_id))
    }

    /// Guarded transition core. Runs entirely under the loan's lock, with no
    /// network calls in between, and resolves CAS conflicts by re-reading:
    /// a concurrent writer that already landed the same target state turns
    /// this call into a no-op.
    async fn apply(
        &self,
        loan_id: Uuid,
        expected: LoanStatus,
        next: LoanStatus,
        attempted: &'static str,
        update: LoanUpdate,
    ) -> Result<Transitioned, TransitionError> {
        let _guard = self.locks.acquire(loan_id).await;

        let loan = self.load(loan_id).await?;

        if loan.status == next {
            tracing::debug!(%loan_id, status = ?loan.status, attempted, "Duplicate transition absorbed");
            return Ok(Transitioned {
                loan,
                changed: false,
            });
        }

        if loan.status != expected {
            tracing::warn!(%loan_id, from = ?loan.status, attempted, "Transition rejected");
            return Err(TransitionError::InvalidTransition {
                loan_id,
                from: loan.status,
                attempted,
            });
        }

        match self.store.transition(loan_id, expected, next, update).await {
            Ok(loan) => {
                tracing::info!(%loan_id, from = ?expected, to = ?next, "Loan transitioned");
                Ok(Transitioned {
                    loan,
                    changed: true,
                })
            }
            // Another process won the write between our read and the CAS.
            // Stale reads are not fatal: re-read and judge the new state.
            Err(StoreError::Conflict(_)) => {
                let current = self.load(loan_id).await?;
                if current.status == next {
                    Ok(Transitioned {
                        loan: current,
                        changed: false,
                    })
                } else {
                    Err(TransitionError::InvalidTransition {
                        loan_id,
                        from: current.status,
                        attempted,
                    })
                }
            }
            Err(StoreError::NotFound(id)) => Err(TransitionError::NotFound(id)),
            Err(e) => Err(TransitionError::Storage(e)),
        }
    }
}
