//! Durable loan storage
//!
//! The coordinator's single shared mutable resource is the loan record, so
//! every status write goes through a conditional update (compare-and-swap on
//! the current status). That is what makes per-loan mutual exclusion hold
//! across process restarts, not just within one process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::escrow::{TradeOffer, TradeOfferStatus};
use crate::loan::{LiquidationEvent, Loan, LoanStatus};

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Loan {0} not found")]
    NotFound(Uuid),

    /// The conditional write lost: the loan was not in the expected status.
    #[error("Concurrent modification of loan {0}")]
    Conflict(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Field changes applied together with a status transition. Only `Some`
/// fields are written; everything else keeps its stored value.
#[derive(Debug, Default, Clone)]
pub struct LoanUpdate {
    pub trade_offer_id: Option<String>,
    pub trade_url: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub vault_tx: Option<String>,
    pub collateral_return_pending: Option<bool>,
}

/// Durable store keyed by loan id: read, conditional-write on status, and
/// append for liquidation events.
#[async_trait]
pub trait LoanStore: Send + Sync {
    async fn insert(&self, loan: &Loan) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Loan>, StoreError>;

    async fn list(
        &self,
        user_id: Option<Uuid>,
        status: Option<LoanStatus>,
    ) -> Result<Vec<Loan>, StoreError>;

    /// Conditionally move a loan from `expected` to `next`, applying `update`
    /// in the same write. Fails with `Conflict` if the stored status is no
    /// longer `expected`.
    async fn transition(
        &self,
        id: Uuid,
        expected: LoanStatus,
        next: LoanStatus,
        update: LoanUpdate,
    ) -> Result<Loan, StoreError>;

    async fn insert_trade_offer(&self, offer: &TradeOffer) -> Result<(), StoreError>;

    async fn update_trade_offer_status(
        &self,
        trade_id: Uuid,
        status: TradeOfferStatus,
    ) -> Result<(), StoreError>;

    async fn trade_offer_for_loan(&self, loan_id: Uuid) -> Result<Option<TradeOffer>, StoreError>;

    async fn append_liquidation_event(&self, event: &LiquidationEvent) -> Result<(), StoreError>;

    async fn liquidation_events(&self, loan_id: Uuid) -> Result<Vec<LiquidationEvent>, StoreError>;
}

/// PostgreSQL-backed store
pub struct PgLoanStore {
    db_pool: PgPool,
}

impl PgLoanStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl LoanStore for PgLoanStore {
    async fn insert(&self, loan: &Loan) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO loans (
                id, user_id, external_identity_id, collateral_items, principal,
                duration_days, start_time, end_time, status, trade_offer_id,
                trade_url, vault_tx, collateral_return_pending, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(loan.id)
        .bind(loan.user_id)
        .bind(&loan.external_identity_id)
        .bind(&loan.collateral_items)
        .bind(loan.principal)
        .bind(loan.duration_days)
        .bind(loan.start_time)
        .bind(loan.end_time)
        .bind(loan.status)
        .bind(&loan.trade_offer_id)
        .bind(&loan.trade_url)
        .bind(&loan.vault_tx)
        .bind(loan.collateral_return_pending)
        .bind(loan.created_at)
        .bind(loan.updated_at)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Loan>, StoreError> {
        let loan = sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db_pool)
            .await?;

        Ok(loan)
    }

    async fn list(
        &self,
        user_id: Option<Uuid>,
        status: Option<LoanStatus>,
    ) -> Result<Vec<Loan>, StoreError> {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> =
            sqlx::QueryBuilder::new("SELECT * FROM loans WHERE 1=1");

        if let Some(user_id) = user_id {
            query_builder.push(" AND user_id = ");
            query_builder.push_bind(user_id);
        }
        if let Some(status) = status {
            query_builder.push(" AND status = ");
            query_builder.push_bind(status);
        }

        query_builder.push(" ORDER BY created_at DESC");

        let loans = query_builder
            .build_query_as::<Loan>()
            .fetch_all(&self.db_pool)
            .await?;

        Ok(loans)
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: LoanStatus,
        next: LoanStatus,
        update: LoanUpdate,
    ) -> Result<Loan, StoreError> {
        let loan = sqlx::query_as::<_, Loan>(
            r#"
            UPDATE loans SET
                status = $3,
                trade_offer_id = COALESCE($4, trade_offer_id),
                trade_url = COALESCE($5, trade_url),
                start_time = COALESCE($6, start_time),
                end_time = COALESCE($7, end_time),
                vault_tx = COALESCE($8, vault_tx),
                collateral_return_pending = COALESCE($9, collateral_return_pending),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(next)
        .bind(&update.trade_offer_id)
        .bind(&update.trade_url)
        .bind(update.start_time)
        .bind(update.end_time)
        .bind(&update.vault_tx)
        .bind(update.collateral_return_pending)
        .fetch_optional(&self.db_pool)
        .await?;

        match loan {
            Some(loan) => Ok(loan),
            // Distinguish a lost race from a missing loan.
            None => match self.get(id).await? {
                Some(_) => Err(StoreError::Conflict(id)),
                None => Err(StoreError::NotFound(id)),
            },
        }
    }

    async fn insert_trade_offer(&self, offer: &TradeOffer) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trade_offers (
                trade_id, loan_id, offer_id, url, status, items, total_value,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(offer.trade_id)
        .bind(offer.loan_id)
        .bind(&offer.offer_id)
        .bind(&offer.url)
        .bind(offer.status)
        .bind(&offer.items)
        .bind(offer.total_value)
        .bind(offer.created_at)
        .bind(offer.updated_at)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn update_trade_offer_status(
        &self,
        trade_id: Uuid,
        status: TradeOfferStatus,
    ) -> Result<(), StoreError> {
        // Terminal offer states are immutable once reached.
        sqlx::query(
            r#"
            UPDATE trade_offers
            SET status = $2, updated_at = NOW()
            WHERE trade_id = $1 AND status = 'sent'
            "#,
        )
        .bind(trade_id)
        .bind(status)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn trade_offer_for_loan(&self, loan_id: Uuid) -> Result<Option<TradeOffer>, StoreError> {
        let offer = sqlx::query_as::<_, TradeOffer>(
            r#"
            SELECT * FROM trade_offers
            WHERE loan_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(loan_id)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(offer)
    }

    async fn append_liquidation_event(&self, event: &LiquidationEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO liquidation_events (id, loan_id, triggered_by, resulting_status, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.id)
        .bind(event.loan_id)
        .bind(event.triggered_by)
        .bind(event.resulting_status)
        .bind(event.created_at)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn liquidation_events(&self, loan_id: Uuid) -> Result<Vec<LiquidationEvent>, StoreError> {
        let events = sqlx::query_as::<_, LiquidationEvent>(
            "SELECT * FROM liquidation_events WHERE loan_id = $1 ORDER BY created_at ASC",
        )
        .bind(loan_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(events)
    }
}

/// In-memory store with the same conditional-write semantics. Backs the test
/// suite and local runs without a database.
#[derive(Default)]
pub struct MemoryLoanStore {
    loans: RwLock<HashMap<Uuid, Loan>>,
    offers: RwLock<HashMap<Uuid, TradeOffer>>,
    events: RwLock<Vec<LiquidationEvent>>,
}

impl MemoryLoanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoanStore for MemoryLoanStore {
    async fn insert(&self, loan: &Loan) -> Result<(), StoreError> {
        self.loans.write().await.insert(loan.id, loan.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Loan>, StoreError> {
        Ok(self.loans.read().await.get(&id).cloned())
    }

    async fn list(
        &self,
        user_id: Option<Uuid>,
        status: Option<LoanStatus>,
    ) -> Result<Vec<Loan>, StoreError> {
        let loans = self.loans.read().await;
        let mut result: Vec<Loan> = loans
            .values()
            .filter(|l| user_id.map_or(true, |u| l.user_id == u))
            .filter(|l| status.map_or(true, |s| l.status == s))
            .cloned()
            .collect();
        result.sort_by_key(|l| std::cmp::Reverse(l.created_at));
        Ok(result)
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: LoanStatus,
        next: LoanStatus,
        update: LoanUpdate,
    ) -> Result<Loan, StoreError> {
        let mut loans = self.loans.write().await;
        let loan = loans.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if loan.status != expected {
            return Err(StoreError::Conflict(id));
        }

        loan.status = next;
        if update.trade_offer_id.is_some() {
            loan.trade_offer_id = update.trade_offer_id;
        }
        if update.trade_url.is_some() {
            loan.trade_url = update.trade_url;
        }
        if update.start_time.is_some() {
            loan.start_time = update.start_time;
        }
        if update.end_time.is_some() {
            loan.end_time = update.end_time;
        }
        if update.vault_tx.is_some() {
            loan.vault_tx = update.vault_tx;
        }
        if let Some(flag) = update.collateral_return_pending {
            loan.collateral_return_pending = flag;
        }
        loan.updated_at = Utc::now();

        Ok(loan.clone())
    }

    async fn insert_trade_offer(&self, offer: &TradeOffer) -> Result<(), StoreError> {
        self.offers
            .write()
            .await
            .insert(offer.trade_id, offer.clone());
        Ok(())
    }

    async fn update_trade_offer_status(
        &self,
        trade_id: Uuid,
        status: TradeOfferStatus,
    ) -> Result<(), StoreError> {
        if let Some(offer) = self.offers.write().await.get_mut(&trade_id) {
            if !offer.status.is_terminal() {
                offer.status = status;
                offer.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn trade_offer_for_loan(&self, loan_id: Uuid) -> Result<Option<TradeOffer>, StoreError> {
        let offers = self.offers.read().await;
        Ok(offers
            .values()
            .filter(|o| o.loan_id == loan_id)
            .max_by_key(|o| o.created_at)
            .cloned())
    }

    async fn append_liquidation_event(&self, event: &LiquidationEvent) -> Result<(), StoreError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn liquidation_events(&self, loan_id: Uuid) -> Result<Vec<LiquidationEvent>, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.loan_id == loan_id)
            .cloned()
            .collect())
    }
}
