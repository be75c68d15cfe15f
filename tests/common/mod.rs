//! Shared test harness: in-memory store plus mock gateways

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use skinvault_coordinator::escrow::{
    EscrowError, EscrowGateway, TradeOffer, TradeOfferStatus,
};
use skinvault_coordinator::liquidation::LiquidationEngine;
use skinvault_coordinator::loan::{
    CollateralItem, CreateLoanRequest, LoanStateMachine, LoanStore, MemoryLoanStore,
};
use skinvault_coordinator::oracle::{OracleError, PriceSource};
use skinvault_coordinator::vault::{TxSignature, VaultError, VaultGateway};

/// Scripted trading-network gateway
pub struct MockEscrow {
    /// Status returned by get_status.
    pub status: Mutex<TradeOfferStatus>,
    pub open_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
}

impl MockEscrow {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(TradeOfferStatus::Sent),
            open_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
        }
    }

    pub async fn set_status(&self, status: TradeOfferStatus) {
        *self.status.lock().await = status;
    }
}

#[async_trait]
impl EscrowGateway for MockEscrow {
    async fn open_offer(
        &self,
        loan_id: Uuid,
        _partner_id: &str,
        items: &[CollateralItem],
        _message: &str,
    ) -> Result<TradeOffer, EscrowError> {
        let n = self.open_calls.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        Ok(TradeOffer {
            trade_id: Uuid::new_v4(),
            loan_id,
            offer_id: format!("offer-{}", n),
            url: format!("https://trade.example/offer-{}", n),
            status: TradeOfferStatus::Sent,
            items: Json(items.to_vec()),
            total_value: items.iter().map(|i| i.value_at_lock).sum(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_status(&self, _offer_id: &str) -> Result<TradeOfferStatus, EscrowError> {
        Ok(*self.status.lock().await)
    }

    async fn cancel_offer(&self, _offer_id: &str) -> Result<(), EscrowError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Scripted vault gateway
pub struct MockVault {
    pub borrow_calls: AtomicUsize,
    pub liquidate_calls: AtomicUsize,
    pub fail_borrow: AtomicBool,
    pub fail_liquidate: AtomicBool,
}

impl MockVault {
    pub fn new() -> Self {
        Self {
            borrow_calls: AtomicUsize::new(0),
            liquidate_calls: AtomicUsize::new(0),
            fail_borrow: AtomicBool::new(false),
            fail_liquidate: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl VaultGateway for MockVault {
    async fn initialize_vault(&self) -> Result<TxSignature, VaultError> {
        Ok(TxSignature("init".to_string()))
    }

    async fn deposit(&self, _amount: i64, _source_account: &str) -> Result<TxSignature, VaultError> {
        Ok(TxSignature("deposit".to_string()))
    }

    async fn borrow(
        &self,
        _amount: i64,
        _duration_seconds: i64,
        loan_id: Uuid,
    ) -> Result<TxSignature, VaultError> {
        self.borrow_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_borrow.load(Ordering::SeqCst) {
            return Err(VaultError::ChainCallFailed("rpc unreachable".to_string()));
        }
        Ok(TxSignature(format!("borrow-{}", loan_id)))
    }

    async fn repay(&self, loan_id: Uuid, _amount: i64) -> Result<TxSignature, VaultError> {
        Ok(TxSignature(format!("repay-{}", loan_id)))
    }

    async fn liquidate(&self, loan_id: Uuid) -> Result<TxSignature, VaultError> {
        self.liquidate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_liquidate.load(Ordering::SeqCst) {
            return Err(VaultError::ChainCallFailed("rpc unreachable".to_string()));
        }
        Ok(TxSignature(format!("liquidate-{}", loan_id)))
    }
}

/// Scripted price feed
pub struct MockOracle {
    pub value: AtomicI64,
    pub fail: AtomicBool,
}

impl MockOracle {
    pub fn new(value: i64) -> Self {
        Self {
            value: AtomicI64::new(value),
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PriceSource for MockOracle {
    async fn current_value(&self, _items: &[CollateralItem]) -> Result<i64, OracleError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("feed down".to_string()));
        }
        Ok(self.value.load(Ordering::SeqCst))
    }
}

/// Full coordinator wired over the in-memory store
pub struct TestCoordinator {
    pub store: Arc<dyn LoanStore>,
    pub escrow: Arc<MockEscrow>,
    pub vault: Arc<MockVault>,
    pub oracle: Arc<MockOracle>,
    pub state_machine: Arc<LoanStateMachine>,
    pub engine: Arc<LiquidationEngine>,
}

pub fn setup(liquidation_threshold: f64) -> TestCoordinator {
    let store: Arc<dyn LoanStore> = Arc::new(MemoryLoanStore::new());
    let escrow = Arc::new(MockEscrow::new());
    let vault = Arc::new(MockVault::new());
    let oracle = Arc::new(MockOracle::new(1_000_000));

    let state_machine = Arc::new(LoanStateMachine::new(store.clone(), escrow.clone()));

    let engine = Arc::new(LiquidationEngine::new(
        store.clone(),
        state_machine.clone(),
        vault.clone(),
        oracle.clone(),
        liquidation_threshold,
    ));

    TestCoordinator {
        store,
        escrow,
        vault,
        oracle,
        state_machine,
        engine,
    }
}

pub fn loan_request(principal: i64, duration_days: i32) -> CreateLoanRequest {
    CreateLoanRequest {
        user_id: Uuid::new_v4(),
        external_identity_id: "76561198000000000".to_string(),
        collateral_items: vec![
            CollateralItem {
                asset_id: "asset-1".to_string(),
                market_hash_name: "AK-47 | Redline (Field-Tested)".to_string(),
                value_at_lock: principal,
            },
            CollateralItem {
                asset_id: "asset-2".to_string(),
                market_hash_name: "Desert Eagle | Blaze (Factory New)".to_string(),
                value_at_lock: principal / 2,
            },
        ],
        principal,
        duration_days,
    }
}
