//! Trade status poller
//!
//! Reconciles trading-network truth into the loan state machine. One
//! recurring task per in-flight loan, with a stop condition tied to loan
//! state instead of an open-ended timer: the task exits as soon as the loan
//! leaves the escrow phase.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::escrow::{EscrowError, EscrowGateway, TradeOfferStatus};
use crate::loan::{
    EscrowOutcome, Loan, LoanStateMachine, LoanStatus, LoanStore, TransitionError,
};
use crate::vault::VaultGateway;

/// Per-loan escrow reconciliation task
pub struct TradeStatusPoller {
    store: Arc<dyn LoanStore>,
    escrow: Arc<dyn EscrowGateway>,
    vault: Arc<dyn VaultGateway>,
    state_machine: Arc<LoanStateMachine>,
    interval: Duration,
}

impl TradeStatusPoller {
    pub fn new(
        store: Arc<dyn LoanStore>,
        escrow: Arc<dyn EscrowGateway>,
        vault: Arc<dyn VaultGateway>,
        state_machine: Arc<LoanStateMachine>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            escrow,
            vault,
            state_machine,
            interval,
        }
    }

    /// Re-spawn watchers for every loan that was mid-escrow when the process
    /// last stopped. In-flight status lives in storage, not in any client, so
    /// a restart picks up exactly where the previous process left off.
    pub async fn resume_pending(self: &Arc<Self>) -> Result<usize> {
        let mut resumed = 0;

        for status in [LoanStatus::EscrowPending, LoanStatus::EscrowHeld] {
            let loans = self
                .store
                .list(None, Some(status))
                .await
                .context("Failed to list in-flight loans")?;

            for loan in loans {
                self.spawn(loan.id);
                resumed += 1;
            }
        }

        if resumed > 0 {
            tracing::info!(count = resumed, "Resumed escrow watchers from storage");
        }

        Ok(resumed)
    }

    /// Start the watcher task for one loan.
    pub fn spawn(self: &Arc<Self>, loan_id: Uuid) {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            poller.watch_loan(loan_id).await;
        });
    }

    async fn watch_loan(&self, loan_id: Uuid) {
        tracing::debug!(%loan_id, "Escrow watcher started");

        loop {
            let loan = match self.store.get(loan_id).await {
                Ok(Some(loan)) => loan,
                Ok(None) => {
                    tracing::error!(%loan_id, "Watched loan disappeared from storage");
                    break;
                }
                Err(e) => {
                    tracing::error!(%loan_id, "Failed to read loan: {}", e);
                    tokio::time::sleep(self.interval).await;
                    continue;
                }
            };

            match loan.status {
                LoanStatus::EscrowPending => {
                    if self.poll_offer(&loan).await {
                        // Offer accepted; run the borrow step without waiting
                        // for the next tick.
                        continue;
                    }
                }
                LoanStatus::EscrowHeld => {
                    // Safe to re-run on a later tick: the borrow is keyed by
                    // loan id, so a duplicate submission confirms instead of
                    // double-disbursing.
                    self.complete_activation(&loan).await;
                }
                // Active or terminal: nothing left to reconcile.
                _ => break,
            }

            tokio::time::sleep(self.interval).await;
        }

        tracing::debug!(%loan_id, "Escrow watcher stopped");
    }

    /// One poll tick. Returns true when the offer resolved to Accepted and
    /// the loan moved on to the borrow step.
    async fn poll_offer(&self, loan: &Loan) -> bool {
        let Some(offer_id) = loan.trade_offer_id.as_deref() else {
            tracing::error!(loan_id = %loan.id, "Loan in escrow_pending without an offer reference");
            return false;
        };

        let status = match self.escrow.get_status(offer_id).await {
            Ok(status) => status,
            Err(EscrowError::Unavailable(reason)) => {
                tracing::debug!(loan_id = %loan.id, "Offer status poll deferred: {}", reason);
                return false;
            }
            Err(e) => {
                tracing::error!(loan_id = %loan.id, "Offer status poll failed: {}", e);
                return false;
            }
        };

        let outcome = match status {
            TradeOfferStatus::Sent => return false,
            TradeOfferStatus::Accepted => EscrowOutcome::Accepted,
            TradeOfferStatus::Declined
            | TradeOfferStatus::Canceled
            | TradeOfferStatus::Expired => EscrowOutcome::Rejected,
        };

        if let Ok(Some(offer)) = self.store.trade_offer_for_loan(loan.id).await {
            if let Err(e) = self
                .store
                .update_trade_offer_status(offer.trade_id, status)
                .await
            {
                tracing::warn!(loan_id = %loan.id, "Failed to record offer status: {}", e);
            }
        }

        match self.state_machine.on_escrow_resolved(loan.id, outcome).await {
            Ok(_) => outcome == EscrowOutcome::Accepted,
            // The loan moved on under us; the next loop iteration re-reads it.
            Err(TransitionError::InvalidTransition { from, .. }) => {
                tracing::debug!(loan_id = %loan.id, current = ?from, "Offer resolution arrived late");
                false
            }
            Err(e) => {
                tracing::error!(loan_id = %loan.id, "Failed to apply offer resolution: {}", e);
                false
            }
        }
    }

    /// Borrow against the held collateral and activate the loan. The vault
    /// client retries internally; exhausting those retries cancels the loan
    /// and flags the collateral for return.
    async fn complete_activation(&self, loan: &Loan) {
        let duration_seconds = i64::from(loan.duration_days) * 86_400;

        match self
            .vault
            .borrow(loan.principal, duration_seconds, loan.id)
            .await
        {
            Ok(tx) => match self.state_machine.activate(loan.id, tx).await {
                Ok(result) if result.changed => {
                    tracing::info!(loan_id = %loan.id, "Loan activated");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(loan_id = %loan.id, "Activation failed after confirmed borrow: {}", e);
                }
            },
            Err(e) => {
                tracing::error!(loan_id = %loan.id, "Vault borrow failed, canceling loan: {}", e);
                match self.state_machine.on_borrow_failed(loan.id).await {
                    Ok(result) if result.changed => {
                        tracing::warn!(
                            loan_id = %loan.id,
                            "Loan canceled, collateral flagged for return"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(%e, loan_id = %loan.id, "Failed to cancel loan after borrow failure");
                    }
                }
            }
        }
    }
}
