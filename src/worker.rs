// =============================================================================
// Worker Loop — the single writer driving the whole engine
// =============================================================================
//
// One cooperative cycle: periodic reconciliation, pending-order progression,
// exchange-state refresh, breach monitoring, then instrument scanning for new
// entries. Errors are contained per symbol; a failed cycle logs and the loop
// sleeps its normal period. The loop never exits.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::exchange::ExchangePort;
use crate::execution::{place_entry_order, safe_place_tp_sl};
use crate::order_utils::resolve_position_side;
use crate::planner::compute_trade_plan;
use crate::reconcile::{
    expire_stale_pending, monitor_and_close_positions, reconcile_positions_tp_sl,
    reconcile_startup_orders, sync_positions_with_history,
};
use crate::signal::{detect_order_blocks, nearest_tradable_block, PIVOT_LENGTH};
use crate::store::{BotStore, PendingOrder, Position, Trade};
use crate::types::{PositionSide, TradeSide, TradeStatus};

/// Candle window requested per scan; comfortably above the detector's
/// minimum of `10·L + L`.
const CANDLE_FETCH_LIMIT: u32 = 100;

/// Run the worker forever. Spawned once at startup.
pub async fn run_worker<E: ExchangePort>(client: Arc<E>, store: Arc<BotStore>, config: Arc<Config>) {
    info!(cycle_seconds = config.cycle_seconds, "worker starting");

    // Converge persisted intent with the exchange before trading resumes.
    if let Err(e) = reconcile_startup_orders(client.as_ref(), &store, &config).await {
        error!(error = %e, "startup order reconciliation failed");
    }
    if let Err(e) = reconcile_positions_tp_sl(client.as_ref(), &store, &config).await {
        error!(error = %e, "startup position reconciliation failed");
    }
    sync_positions_with_history(client.as_ref(), &store).await;

    let mut last_reconcile = Instant::now();
    loop {
        if let Err(e) = run_cycle(client.as_ref(), &store, &config, &mut last_reconcile).await {
            error!(error = %e, "worker cycle failed");
        }
        tokio::time::sleep(Duration::from_secs(config.cycle_seconds)).await;
    }
}

/// One worker iteration.
async fn run_cycle<E: ExchangePort>(
    client: &E,
    store: &BotStore,
    config: &Config,
    last_reconcile: &mut Instant,
) -> Result<()> {
    // ── 1. Periodic reconciliation ──────────────────────────────────────
    if last_reconcile.elapsed().as_secs() >= config.position_reconciliation_interval {
        *last_reconcile = Instant::now();
        if let Err(e) = reconcile_positions_tp_sl(client, store, config).await {
            warn!(error = %e, "periodic position reconciliation failed");
        }
        expire_stale_pending(client, store, config).await;
    }

    // ── 2. Progress pending orders ──────────────────────────────────────
    progress_pending_orders(client, store, config).await;

    // ── 3. Refresh exchange state ───────────────────────────────────────
    refresh_exchange_state(client, store).await?;

    // ── 4. Breach safety net ────────────────────────────────────────────
    monitor_and_close_positions(client, store, config).await;

    // ── 5. Scan instruments for entries ─────────────────────────────────
    for symbol in &config.trading_pairs {
        if let Err(e) = scan_symbol(client, store, config, symbol).await {
            warn!(symbol, error = %e, "symbol scan failed");
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Pending-order progression
// ---------------------------------------------------------------------------

async fn progress_pending_orders<E: ExchangePort>(client: &E, store: &BotStore, config: &Config) {
    for (symbol, pending) in store.pending_orders_snapshot() {
        let status = match client.get_order_status(&symbol, &pending.order_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(symbol, order_id = %pending.order_id, error = %e, "status query failed");
                continue;
            }
        };

        match status {
            None => {
                info!(symbol, order_id = %pending.order_id, "pending order vanished, dropping");
                store.remove_pending_order(&symbol);
                store.add_reconciliation_log(
                    "pending_order_not_found",
                    Some(&symbol),
                    json!({ "order_id": pending.order_id }),
                );
            }
            Some(order) if order.is_filled() => {
                handle_filled_entry(client, store, config, &symbol, &pending, order.filled).await;
            }
            Some(order) if order.is_dead() => {
                info!(symbol, order_id = %pending.order_id, status = %order.status, "pending order terminal, dropping");
                store.remove_pending_order(&symbol);
            }
            Some(order) => {
                let age_secs = (Utc::now() - pending.created_at).num_seconds();
                if age_secs > config.pending_order_stale_seconds as i64 {
                    warn!(symbol, order_id = %pending.order_id, age_secs, "pending order stale, canceling");
                    match client.cancel_order(&symbol, &pending.order_id).await {
                        Ok(true) => store.update_metrics(|m| m.cancelled_orders_count += 1),
                        Ok(false) => {}
                        Err(e) => warn!(symbol, error = %e, "stale cancel failed, dropping anyway"),
                    }
                    store.remove_pending_order(&symbol);
                    store.update_metrics(|m| m.pending_order_stale_count += 1);
                    store.add_reconciliation_log(
                        "stale_pending_cancelled",
                        Some(&symbol),
                        json!({ "order_id": pending.order_id, "age_secs": age_secs }),
                    );
                } else if order.filled > 0.0 {
                    handle_partial_fill(client, store, config, &symbol, &pending, order.filled)
                        .await;
                } else {
                    let (should_log, suppressed) = store.should_log("pending_active", &symbol);
                    if should_log {
                        debug!(symbol, order_id = %pending.order_id, suppressed, "pending order still resting");
                    }
                }
            }
        }
    }
}

/// A fully filled entry: protect it, journal it, clear the pending row.
async fn handle_filled_entry<E: ExchangePort>(
    client: &E,
    store: &BotStore,
    config: &Config,
    symbol: &str,
    pending: &PendingOrder,
    filled: f64,
) {
    let plan = &pending.params;
    let size = if filled > 0.0 { filled } else { plan.quantity };
    let is_long = plan.side == TradeSide::Buy;

    info!(symbol, order_id = %pending.order_id, size, "limit entry filled");

    // Adopted orders carry no targets until the position pass derives them.
    if plan.stop_loss > 0.0 && plan.take_profit > 0.0 {
        safe_place_tp_sl(
            client,
            store,
            config,
            symbol,
            is_long,
            size,
            plan.take_profit,
            plan.stop_loss,
        )
        .await;
    }

    store.add_trade(Trade {
        symbol: symbol.to_string(),
        side: if is_long { PositionSide::Long } else { PositionSide::Short },
        entry_price: plan.entry_price,
        exit_price: None,
        size,
        pnl: None,
        status: TradeStatus::Open,
        take_profit: (plan.take_profit > 0.0).then_some(plan.take_profit),
        stop_loss: (plan.stop_loss > 0.0).then_some(plan.stop_loss),
        entry_time: Some(Utc::now()),
        exit_time: None,
        timestamp: Utc::now(),
    });

    store.update_metrics(|m| m.filled_orders_count += 1);
    store.remove_pending_order(symbol);
    store.add_reconciliation_log(
        "entry_filled",
        Some(symbol),
        json!({ "order_id": pending.order_id, "size": size }),
    );
}

/// A partially filled entry: protect the filled portion, keep waiting on the
/// remainder.
async fn handle_partial_fill<E: ExchangePort>(
    client: &E,
    store: &BotStore,
    config: &Config,
    symbol: &str,
    pending: &PendingOrder,
    filled: f64,
) {
    let plan = &pending.params;
    let is_long = plan.side == TradeSide::Buy;

    let (should_log, suppressed) = store.should_log("partial_fill", symbol);
    if should_log {
        info!(symbol, order_id = %pending.order_id, filled, suppressed, "entry partially filled");
    }

    if plan.stop_loss > 0.0 && plan.take_profit > 0.0 {
        safe_place_tp_sl(
            client,
            store,
            config,
            symbol,
            is_long,
            filled,
            plan.take_profit,
            plan.stop_loss,
        )
        .await;
    }

    store.update_pending_order(symbol, |p| {
        p.partial_fill = true;
        p.filled_amount = filled;
    });
}

// ---------------------------------------------------------------------------
// Exchange-state refresh
// ---------------------------------------------------------------------------

async fn refresh_exchange_state<E: ExchangePort>(client: &E, store: &BotStore) -> Result<()> {
    let balance = client
        .get_full_balance()
        .await
        .context("balance refresh failed")?;
    store.update_full_balance(balance.total, balance.free, balance.used);

    let positions = client
        .get_all_positions()
        .await
        .context("position refresh failed")?;

    let mut live_symbols: Vec<String> = Vec::with_capacity(positions.len());
    for info in &positions {
        if info.contracts == 0.0 {
            continue;
        }
        live_symbols.push(info.symbol.clone());
        store.upsert_position(Position {
            symbol: info.symbol.clone(),
            side: resolve_position_side(info.side.as_deref(), info.contracts),
            size: info.contracts.abs(),
            entry_price: info.entry_price,
            mark_price: info.mark_price,
            unrealized_pnl: info.unrealized_pnl,
            leverage: info.leverage,
            entry_time: None,
            take_profit: None,
            stop_loss: None,
        });
    }

    // Positions the exchange stopped reporting are closed.
    for symbol in store.position_symbols() {
        if !live_symbols.contains(&symbol) {
            info!(symbol, "position no longer on exchange, closing");
            store.remove_position(&symbol);
        }
    }

    match client.get_open_orders(None).await {
        Ok(orders) => store.update_exchange_open_orders(orders),
        Err(e) => warn!(error = %e, "open-order refresh failed, keeping cached mirror"),
    }

    // Derive each position's protective prices from its reduce-only orders.
    for symbol in store.position_symbols() {
        let orders = store.cached_orders_for_symbol(&symbol);
        let sl = orders
            .iter()
            .filter(|o| o.reduce_only || o.is_tp_sl_type())
            .find(|o| o.is_stop_loss_like())
            .map(|o| o.effective_price());
        let tp = orders
            .iter()
            .filter(|o| o.reduce_only || o.is_tp_sl_type())
            .find(|o| o.is_take_profit_like())
            .map(|o| o.effective_price());
        store.set_position_protection(&symbol, tp, sl);
    }

    store.record_balance_point();
    Ok(())
}

// ---------------------------------------------------------------------------
// Instrument scanning
// ---------------------------------------------------------------------------

async fn scan_symbol<E: ExchangePort>(
    client: &E,
    store: &BotStore,
    config: &Config,
    symbol: &str,
) -> Result<()> {
    let candles = client
        .fetch_candles(symbol, &config.timeframe, CANDLE_FETCH_LIMIT)
        .await
        .context("candle fetch failed")?;
    if candles.is_empty() {
        return Ok(());
    }

    store.update_ohlcv(symbol, &candles);
    let current_price = candles[candles.len() - 1].close;
    store.update_last_price(symbol, current_price);

    let blocks = detect_order_blocks(&candles, PIVOT_LENGTH);
    store.update_order_blocks(symbol, blocks.clone());

    // Entries only for flat, idle symbols.
    if store.get_position(symbol).is_some() || store.get_pending_order(symbol).is_some() {
        return Ok(());
    }

    let Some(block) = nearest_tradable_block(&blocks, current_price) else {
        return Ok(());
    };

    let balance = client
        .get_free_balance()
        .await
        .context("balance fetch failed before entry")?;
    let Some(mut plan) = compute_trade_plan(block, balance, config) else {
        return Ok(());
    };
    plan.symbol = symbol.to_string();

    debug!(
        symbol,
        side = %plan.side,
        entry = plan.entry_price,
        sl = plan.stop_loss,
        tp = plan.take_profit,
        qty = plan.quantity,
        "entry candidate selected"
    );

    // Clear anything else resting on the symbol before committing the entry.
    if let Err(e) = client.cancel_all_orders(symbol).await {
        warn!(symbol, error = %e, "pre-entry cancel failed");
    }

    let Some(order) = place_entry_order(client, store, &plan).await else {
        return Ok(());
    };

    store.add_pending_order(symbol, &order.order_id, plan);
    info!(symbol, order_id = %order.order_id, "entry order placed and tracked");
    Ok(())
}
