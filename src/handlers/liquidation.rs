//! Liquidation-related API handlers

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::loan::LiquidationEvent;
use crate::state::AppState;

/// Manually liquidate one active loan
pub async fn liquidate_loan(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<LiquidationEvent>> {
    let event = app_state.engine.liquidate_manually(id).await?;
    Ok(Json(event))
}

/// Trigger a liquidation scan over the active loan set
pub async fn trigger_scan(State(app_state): State<AppState>) -> ApiResult<Json<Vec<LiquidationEvent>>> {
    let events = app_state.engine.scan(Utc::now()).await;
    Ok(Json(events))
}

/// Liquidation audit trail for one loan
pub async fn loan_events(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<LiquidationEvent>>> {
    let events = app_state.store.liquidation_events(id).await?;
    Ok(Json(events))
}
