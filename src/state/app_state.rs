//! Application state shared across handlers

use std::sync::Arc;

use crate::escrow::TradeStatusPoller;
use crate::liquidation::LiquidationEngine;
use crate::loan::{LoanStateMachine, LoanStore};
use crate::vault::VaultGateway;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LoanStore>,
    pub state_machine: Arc<LoanStateMachine>,
    pub poller: Arc<TradeStatusPoller>,
    pub engine: Arc<LiquidationEngine>,
    pub vault: Arc<dyn VaultGateway>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn LoanStore>,
        state_machine: Arc<LoanStateMachine>,
        poller: Arc<TradeStatusPoller>,
        engine: Arc<LiquidationEngine>,
        vault: Arc<dyn VaultGateway>,
    ) -> Self {
        Self {
            store,
            state_machine,
            poller,
            engine,
            vault,
        }
    }
}
