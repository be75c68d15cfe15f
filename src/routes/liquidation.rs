//! Liquidation route definitions

use axum::Router;

use crate::handlers::*;
use crate::state::AppState;

pub fn liquidation_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/loans/:id/liquidate",
            axum::routing::post(liquidate_loan),
        )
        .route("/api/loans/:id/events", axum::routing::get(loan_events))
        .route("/api/liquidations/scan", axum::routing::post(trigger_scan))
}
