//! Loan-related API handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::loan::expiration::{self, ExpirationStatus};
use crate::loan::{CreateLoanRequest, ListLoansQuery, Loan};
use crate::state::AppState;

/// Response for loan creation: the loan plus the trade offer the user has to
/// accept to lock their collateral.
#[derive(Debug, Serialize)]
pub struct CreateLoanResponse {
    pub loan: Loan,
    pub trade_offer_id: String,
    pub trade_url: String,
}

/// Create a loan and open its collateral trade offer
pub async fn create_loan(
    State(app_state): State<AppState>,
    Json(request): Json<CreateLoanRequest>,
) -> ApiResult<Json<CreateLoanResponse>> {
    let loan = app_state.state_machine.create(request).await?;
    let offer = app_state.state_machine.request_escrow(loan.id).await?;

    // Watch the offer until it resolves.
    app_state.poller.spawn(loan.id);

    let loan = app_state
        .store
        .get(loan.id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Loan {}", loan.id)))?;

    Ok(Json(CreateLoanResponse {
        loan,
        trade_offer_id: offer.offer_id,
        trade_url: offer.url,
    }))
}

/// List loans with optional filters
pub async fn list_loans(
    State(app_state): State<AppState>,
    Query(query): Query<ListLoansQuery>,
) -> ApiResult<Json<Vec<Loan>>> {
    let loans = app_state.store.list(query.user_id, query.status).await?;
    Ok(Json(loans))
}

/// Get a single loan by ID
pub async fn get_loan(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Loan>> {
    let loan = app_state
        .store
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Loan {}", id)))?;

    Ok(Json(loan))
}

/// Time remaining and overdue state for a loan
pub async fn get_expiration(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ExpirationStatus>> {
    let loan = app_state
        .store
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Loan {}", id)))?;

    let status = expiration::compute(&loan, Utc::now())?;
    Ok(Json(status))
}

/// User-initiated cancel; honored only while the offer is pending
pub async fn cancel_loan(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Loan>> {
    let result = app_state.state_machine.cancel(id).await?;
    Ok(Json(result.loan))
}

/// Repay a loan: settle on-chain, then close it out
pub async fn repay_loan(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Loan>> {
    let loan = app_state
        .store
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Loan {}", id)))?;

    let tx = app_state.vault.repay(loan.id, loan.principal).await?;
    tracing::info!(loan_id = %loan.id, %tx, "Repayment confirmed on-chain");

    let result = app_state.state_machine.repay(id).await?;
    Ok(Json(result.loan))
}
