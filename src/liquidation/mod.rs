//! Liquidation engine
//!
//! Scans the active loan set, decides which loans must be liquidated
//! (overdue or undercollateralized against the configured threshold), drives
//! the on-chain liquidation, and owns the append-only audit trail. Loans are
//! evaluated independently; a failure on one never aborts the rest of the
//! scan.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::loan::{
    expiration, LiquidationEvent, LiquidationTrigger, Loan, LoanStateMachine, LoanStatus,
    LoanStore, StoreError, TransitionError,
};
use crate::oracle::PriceSource;
use crate::vault::VaultGateway;

/// Engine errors, surfaced by the manual trigger path. The periodic scan
/// logs and continues instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Liquidation decision engine
pub struct LiquidationEngine {
    store: Arc<dyn LoanStore>,
    state_machine: Arc<LoanStateMachine>,
    vault: Arc<dyn VaultGateway>,
    oracle: Arc<dyn PriceSource>,
    /// Collateral-to-principal ratio below which an active loan is
    /// liquidated. Policy input from configuration.
    threshold: f64,
}

impl LiquidationEngine {
    pub fn new(
        store: Arc<dyn LoanStore>,
        state_machine: Arc<LoanStateMachine>,
        vault: Arc<dyn VaultGateway>,
        oracle: Arc<dyn PriceSource>,
        threshold: f64,
    ) -> Self {
        Self {
            store,
            state_machine,
            vault,
            oracle,
            threshold,
        }
    }

    /// Evaluate every active loan at `now`. Returns the audit events
    /// appended during this scan, one per liquidation attempt, including
    /// attempts whose chain call failed (those loans stay active and are
    /// retried on the next scan).
    pub async fn scan(&self, now: DateTime<Utc>) -> Vec<LiquidationEvent> {
        let active = match self.store.list(None, Some(LoanStatus::Active)).await {
            Ok(loans) => loans,
            Err(e) => {
                tracing::error!("Liquidation scan could not list active loans: {}", e);
                return Vec::new();
            }
        };

        let mut events = Vec::new();

        for loan in active {
            match self.evaluate(&loan, now).await {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(loan_id = %loan.id, "Liquidation evaluation failed: {}", e);
                }
            }
        }

        events
    }

    /// Manually force liquidation of one loan, bypassing the trigger
    /// computation but following the same chain-confirm-then-transition path.
    pub async fn liquidate_manually(
        &self,
        loan_id: Uuid,
    ) -> Result<LiquidationEvent, EngineError> {
        let loan = self
            .store
            .get(loan_id)
            .await?
            .ok_or(TransitionError::NotFound(loan_id))?;

        if loan.status != LoanStatus::Active {
            return Err(EngineError::Transition(TransitionError::InvalidTransition {
                loan_id,
                from: loan.status,
                attempted: "liquidate",
            }));
        }

        let event = self
            .execute_liquidation(&loan, LiquidationTrigger::Manual)
            .await?;

        event.ok_or_else(|| {
            // Raced with another liquidation; report the loan's final state.
            EngineError::Transition(TransitionError::InvalidTransition {
                loan_id,
                from: LoanStatus::Liquidated,
                attempted: "liquidate",
            })
        })
    }

    /// Decide and act for a single loan. `Ok(None)` means no trigger held or
    /// a concurrent writer already settled the loan.
    async fn evaluate(
        &self,
        loan: &Loan,
        now: DateTime<Utc>,
    ) -> Result<Option<LiquidationEvent>, EngineError> {
        // Malformed timestamps are fatal for this loan's evaluation only.
        let expiration = match expiration::compute(loan, now) {
            Ok(expiration) => expiration,
            Err(e) => {
                tracing::error!(loan_id = %loan.id, "Skipping loan with bad timestamps: {}", e);
                return Ok(None);
            }
        };

        // The price check is independent of the overdue check; an oracle
        // outage leaves overdue liquidation working.
        let current_value = match self.oracle.current_value(loan.collateral()).await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(loan_id = %loan.id, "Collateral value unavailable: {}", e);
                None
            }
        };

        let undercollateralized = current_value
            .map(|value| (value as f64) < (loan.principal as f64) * self.threshold)
            .unwrap_or(false);

        let trigger = if expiration.is_overdue {
            LiquidationTrigger::Overdue
        } else if undercollateralized {
            LiquidationTrigger::PriceDrop
        } else {
            return Ok(None);
        };

        // An overdue loan with worthless collateral has nothing left to
        // liquidate: close it out as expired, no chain call.
        if expiration.is_overdue && current_value == Some(0) {
            let result = self.state_machine.mark_expired(loan.id).await?;
            if !result.changed {
                return Ok(None);
            }
            let event = self
                .append_event(loan.id, trigger, LoanStatus::Expired)
                .await?;
            return Ok(Some(event));
        }

        self.execute_liquidation(loan, trigger).await
    }

    /// Chain call first, state transition only on confirmation. A failed
    /// chain call still appends the attempt to the audit trail and leaves the
    /// loan active for the next scan; nothing is rolled back.
    async fn execute_liquidation(
        &self,
        loan: &Loan,
        trigger: LiquidationTrigger,
    ) -> Result<Option<LiquidationEvent>, EngineError> {
        match self.vault.liquidate(loan.id).await {
            Ok(tx) => {
                let result = match self.state_machine.liquidate(loan.id, trigger).await {
                    Ok(result) => result,
                    // The loan left Active under us (repaid or canceled); the
                    // chain program treated our call as a duplicate, so there
                    // is nothing to record.
                    Err(TransitionError::InvalidTransition { from, .. }) => {
                        tracing::debug!(loan_id = %loan.id, current = ?from, "Loan settled before liquidation landed");
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                };
                if !result.changed {
                    // A concurrent call already liquidated this loan and
                    // recorded its event.
                    tracing::debug!(loan_id = %loan.id, "Loan already liquidated");
                    return Ok(None);
                }
                tracing::info!(loan_id = %loan.id, %tx, ?trigger, "On-chain liquidation confirmed");
                let event = self
                    .append_event(loan.id, trigger, result.loan.status)
                    .await?;
                Ok(Some(event))
            }
            Err(e) => {
                tracing::warn!(loan_id = %loan.id, ?trigger, "On-chain liquidation failed, will retry: {}", e);
                let event = self
                    .append_event(loan.id, trigger, loan.status)
                    .await?;
                Ok(Some(event))
            }
        }
    }

    async fn append_event(
        &self,
        loan_id: Uuid,
        triggered_by: LiquidationTrigger,
        resulting_status: LoanStatus,
    ) -> Result<LiquidationEvent, StoreError> {
        let event = LiquidationEvent {
            id: Uuid::new_v4(),
            loan_id,
            triggered_by,
            resulting_status,
            created_at: Utc::now(),
        };

        self.store.append_liquidation_event(&event).await?;

        Ok(event)
    }
}

/// Background scan loop. Runs until the process stops; each pass evaluates
/// the full active set at its own `now`.
pub async fn scan_loop(engine: Arc<LiquidationEngine>, interval: Duration) {
    tracing::info!(interval_secs = interval.as_secs(), "Liquidation scan loop started");

    loop {
        tokio::time::sleep(interval).await;

        let events = engine.scan(Utc::now()).await;
        if !events.is_empty() {
            tracing::info!(count = events.len(), "Liquidation scan recorded events");
        }
    }
}
