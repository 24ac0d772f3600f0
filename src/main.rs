// =============================================================================
// Orion — order-block trading engine, main entry point
// =============================================================================
//
// One background worker owns all mutable state; the HTTP API is a read
// observer. Persisted state under data/ is reloaded and reconciled against
// the exchange on every start, so a crash or restart never loses track of
// resting orders or open positions.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod config;
mod exchange;
mod execution;
mod order_utils;
mod planner;
mod reconcile;
mod signal;
mod store;
mod types;
mod worker;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::rest::{router, ApiState};
use crate::config::Config;
use crate::exchange::binance::BinanceFuturesClient;
use crate::store::BotStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Orion engine starting up");

    let config = Arc::new(Config::from_env());
    if config.api_key.is_empty() || config.api_secret.is_empty() {
        warn!("exchange credentials missing; signed requests will be rejected");
    }

    // ── 2. Persistent state ──────────────────────────────────────────────
    let store = Arc::new(BotStore::open("data"));

    // ── 3. Exchange client ───────────────────────────────────────────────
    let client = Arc::new(BinanceFuturesClient::new(
        config.api_key.clone(),
        config.api_secret.clone(),
        config.testnet,
        &config.trading_pairs,
    ));

    // ── 4. HTTP API ──────────────────────────────────────────────────────
    let api_state = ApiState {
        store: store.clone(),
        config: config.clone(),
    };
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let app = router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    // ── 5. Worker loop ───────────────────────────────────────────────────
    let worker_client = client.clone();
    let worker_store = store.clone();
    let worker_config = config.clone();
    tokio::spawn(async move {
        worker::run_worker(worker_client, worker_store, worker_config).await;
    });

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 6. Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received; persisted state will be reconciled on next start");
    Ok(())
}
