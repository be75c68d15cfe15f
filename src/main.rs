//! SkinVault Loan Coordinator Server
//!
//! Wires the escrow, vault, and pricing adapters to the loan state machine,
//! resumes in-flight escrow watchers from storage, starts the liquidation
//! scan loop, and serves the coordinator API.

use axum::http::{HeaderValue, Method};
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use skinvault_coordinator::config::Config;
use skinvault_coordinator::db;
use skinvault_coordinator::escrow::{TradeNetworkClient, TradeStatusPoller};
use skinvault_coordinator::liquidation::{self, LiquidationEngine};
use skinvault_coordinator::loan::{LoanStateMachine, LoanStore, PgLoanStore};
use skinvault_coordinator::oracle::PriceFeedClient;
use skinvault_coordinator::retry::RetryPolicy;
use skinvault_coordinator::routes;
use skinvault_coordinator::state::AppState;
use skinvault_coordinator::vault::VaultRpcClient;

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(true)
        .init();

    tracing::info!(environment = config.environment.as_str(), "Starting coordinator");

    // Database pool and migrations
    let db_pool = match db::create_pool(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Database setup failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = db::run_migrations(&db_pool).await {
        tracing::error!("Migration failed: {}", e);
        std::process::exit(1);
    }

    let call_timeout = Duration::from_secs(config.external_call_timeout_secs);
    let retry = RetryPolicy::new(
        config.retry_max_attempts,
        Duration::from_millis(config.retry_base_delay_ms),
    );

    // External adapters
    let escrow_client = Arc::new(TradeNetworkClient::new(
        config.trade_api_url.clone(),
        config.trade_api_key.clone(),
        call_timeout,
        retry.clone(),
        config.status_poll_rate_per_minute,
        Duration::from_secs(config.offer_debounce_secs),
    ));

    let vault_client = Arc::new(VaultRpcClient::new(
        config.vault_rpc_url.clone(),
        call_timeout,
        retry,
    ));

    let price_feed = Arc::new(PriceFeedClient::new(
        config.price_feed_url.clone(),
        call_timeout,
    ));

    // Coordinator core
    let store: Arc<dyn LoanStore> = Arc::new(PgLoanStore::new(db_pool.clone()));

    let state_machine = Arc::new(LoanStateMachine::new(
        store.clone(),
        escrow_client.clone(),
    ));

    let poller = Arc::new(TradeStatusPoller::new(
        store.clone(),
        escrow_client.clone(),
        vault_client.clone(),
        state_machine.clone(),
        Duration::from_secs(config.poll_interval_secs),
    ));

    let engine = Arc::new(LiquidationEngine::new(
        store.clone(),
        state_machine.clone(),
        vault_client.clone(),
        price_feed,
        config.liquidation_threshold,
    ));

    // Pick up loans that were mid-escrow when the last process stopped.
    if let Err(e) = poller.resume_pending().await {
        tracing::error!("Failed to resume escrow watchers: {}", e);
    }

    // Start liquidation scan loop in background
    let scan_engine = engine.clone();
    let scan_interval = Duration::from_secs(config.scan_interval_secs);
    tokio::spawn(async move {
        liquidation::scan_loop(scan_engine, scan_interval).await;
        tracing::error!("Liquidation scan loop exited unexpectedly");
    });

    // Create shared app state
    let app_state = AppState::new(
        store,
        state_machine,
        poller,
        engine,
        vault_client,
    );

    // Clone db_pool for health check
    let health_db_pool = db_pool.clone();

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(move || health_check(health_db_pool.clone())))
        .merge(routes::loan_routes())
        .merge(routes::liquidation_routes())
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(configure_cors(&config));

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));

    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind server address");

    // Serve with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Server shutdown complete");
}

async fn root() -> &'static str {
    "SkinVault Loan Coordinator"
}

/// Health check response
#[derive(serde::Serialize)]
struct HealthResponse {
    status: String,
    database: String,
    version: String,
}

/// Health check endpoint
async fn health_check(pool: sqlx::PgPool) -> axum::Json<HealthResponse> {
    let db_status = match db::check_health(&pool).await {
        Ok(()) => "connected".to_string(),
        Err(e) => format!("error: {}", e),
    };

    let status = if db_status == "connected" {
        "healthy"
    } else {
        "unhealthy"
    };

    axum::Json(HealthResponse {
        status: status.to_string(),
        database: db_status,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn configure_cors(config: &Config) -> CorsLayer {
    let allowed_origins_str = config.cors_allowed_origins.clone().unwrap_or_default();

    if allowed_origins_str.is_empty() {
        tracing::warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (permissive)");
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins_str
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
