// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Every endpoint is a read-only view over store snapshots; the frontend polls
// these while the worker writes. CORS is configured permissively for
// development; tighten `allowed_origins` in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::order_utils::normalize_symbol;
use crate::signal::OrderBlock;
use crate::store::BotStore;

/// Shared read handle for all endpoints.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<BotStore>,
    pub config: Arc<Config>,
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status))
        .route("/api/balance", get(balance))
        .route("/api/positions", get(positions))
        .route("/api/trades", get(trades))
        .route("/api/market-data/:symbol", get(market_data))
        .route("/api/all-market-data", get(all_market_data))
        .route("/api/metrics", get(metrics))
        .route("/api/pending-orders", get(pending_orders))
        .route("/api/balance-history", get(balance_history))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Helpers
// =============================================================================

/// Resolve a URL symbol parameter ("BTC-USDC", "btc_usdc") to the configured
/// trading-pair spelling.
fn resolve_symbol_param(config: &Config, raw: &str) -> Option<String> {
    let decoded = raw.replace(['-', '_'], "/");
    let wanted = normalize_symbol(&decoded);
    config
        .trading_pairs
        .iter()
        .find(|pair| normalize_symbol(pair) == wanted)
        .cloned()
}

/// Settlement currency taken from the first configured pair's suffix.
fn settlement_currency(config: &Config) -> String {
    config
        .trading_pairs
        .first()
        .and_then(|pair| pair.split(':').nth(1))
        .unwrap_or("USDC")
        .to_string()
}

/// A block serialized with its distance to the current price, in percent.
fn block_with_distance(block: &OrderBlock, current_price: f64) -> serde_json::Value {
    let mut value = serde_json::to_value(block).unwrap_or_default();
    if current_price > 0.0 {
        let distance_pct = (current_price - block.entry_edge()).abs() / current_price * 100.0;
        if let Some(map) = value.as_object_mut() {
            map.insert("distance_pct".to_string(), json!(distance_pct));
        }
    }
    value
}

// =============================================================================
// Handlers
// =============================================================================

async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    let balance = state.store.balance();
    let positions = state.store.positions_snapshot();

    Json(json!({
        "balance": balance.total,
        "total_pnl": state.store.total_pnl(),
        "last_update": state.store.last_update(),
        "trading_pairs": state.config.trading_pairs,
        "active_positions": positions.len(),
        "positions": positions,
    }))
}

async fn balance(State(state): State<ApiState>) -> impl IntoResponse {
    let balance = state.store.balance();
    Json(json!({
        "total": balance.total,
        "free": balance.free,
        "in_positions": balance.used,
        "currency": settlement_currency(&state.config),
    }))
}

async fn positions(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({ "positions": state.store.positions_snapshot() }))
}

async fn trades(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({ "trades": state.store.trade_history_snapshot() }))
}

async fn market_data(
    State(state): State<ApiState>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let Some(resolved) = resolve_symbol_param(&state.config, &symbol) else {
        return Json(json!({ "symbol": symbol, "ohlcv": [], "order_blocks": [], "position": null }));
    };

    Json(json!({
        "symbol": resolved,
        "ohlcv": state.store.ohlcv_snapshot(&resolved),
        "order_blocks": state.store.order_blocks_snapshot(&resolved),
        "position": state.store.get_position(&resolved),
    }))
}

async fn all_market_data(State(state): State<ApiState>) -> impl IntoResponse {
    let mut per_symbol = serde_json::Map::new();

    for symbol in &state.config.trading_pairs {
        let current_price = state.store.last_price(symbol).unwrap_or(0.0);
        let blocks: Vec<serde_json::Value> = state
            .store
            .order_blocks_snapshot(symbol)
            .iter()
            .map(|b| block_with_distance(b, current_price))
            .collect();

        per_symbol.insert(
            symbol.clone(),
            json!({
                "ohlcv": state.store.ohlcv_snapshot(symbol),
                "order_blocks": blocks,
                "position": state.store.get_position(symbol),
                "current_price": current_price,
                "pending_order": state.store.get_pending_order(symbol),
            }),
        );
    }

    Json(serde_json::Value::Object(per_symbol))
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let pending = state.store.pending_orders_snapshot();
    Json(json!({
        "metrics": state.store.metrics_snapshot(),
        "reconciliation_log": state.store.reconciliation_log_snapshot(),
        "pending_orders": pending.len(),
    }))
}

async fn pending_orders(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({ "pending_orders": state.store.pending_orders_snapshot() }))
}

async fn balance_history(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({ "points": state.store.balance_history_snapshot() }))
}
