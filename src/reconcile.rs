// =============================================================================
// Reconciliation Engine — keep bot-intended and exchange-observed state
// convergent
// =============================================================================
//
// Four passes:
//   1. Startup order reconciliation — match persisted pending orders against
//      live open orders, adopt recognizable strays, cancel true orphans.
//   2. Position / TP-SL reconciliation — every position gets protective legs
//      matching the intended plan; matches are reused, mismatches replaced.
//   3. Stale pending expiry — resting entries past their age limit are
//      canceled and dropped.
//   4. Breach safety net — positions whose mark price has already crossed a
//      recorded target are force-closed at market.
//
// Every error is contained within one symbol's processing; a pass never
// unwinds the cycle.
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::exchange::{ExchangeOrder, ExchangePort};
use crate::execution::{place_sl_tp_orders, safe_place_tp_sl, TpSlPlacement};
use crate::order_utils::{order_matches_target, resolve_position_side, DEFAULT_TICK_SIZE};
use crate::planner::TradePlan;
use crate::signal::{detect_order_blocks, PIVOT_LENGTH};
use crate::store::{BotStore, PendingOrder, Position, ProtectiveIds, Trade};
use crate::types::{BlockKind, PositionSide, TradeStatus};

/// Relative window for adopting a stray limit order against a block edge.
const ADOPTION_PRICE_TOLERANCE: f64 = 0.005;

/// Fallback protective distance when no plan exists (1 % of entry).
const FALLBACK_PROTECTION_PCT: f64 = 0.01;

// ---------------------------------------------------------------------------
// 1. Startup order reconciliation
// ---------------------------------------------------------------------------

/// Reconcile persisted pending orders against live exchange orders, once at
/// startup.
pub async fn reconcile_startup_orders<E: ExchangePort>(
    client: &E,
    store: &BotStore,
    config: &Config,
) -> Result<()> {
    info!("startup order reconciliation running");
    let mut matched_symbols: Vec<String> = Vec::new();

    for symbol in &config.trading_pairs {
        let orders = match client.get_open_orders(Some(symbol)).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(symbol, error = %e, "open-order fetch failed, skipping symbol");
                continue;
            }
        };

        let pending = store.get_pending_order(symbol);

        for order in &orders {
            if let Some(p) = &pending {
                if p.order_id == order.order_id {
                    debug!(symbol, order_id = %order.order_id, "pending order matched on exchange");
                    matched_symbols.push(symbol.clone());
                    continue;
                }
            }

            // Protective legs belong to a position, not to the entry flow.
            if order.reduce_only || order.is_tp_sl_type() {
                continue;
            }

            reconcile_stray_entry(client, store, config, symbol, order).await;
        }
    }

    // Pending orders the exchange no longer shows: resolve by status query.
    for (symbol, pending) in store.pending_orders_snapshot() {
        if matched_symbols.contains(&symbol) {
            continue;
        }
        resolve_unmatched_pending(client, store, &symbol, &pending).await;
    }

    info!("startup order reconciliation complete");
    Ok(())
}

/// A live limit order we did not place (or lost track of): adopt it when it
/// sits at a current block edge, cancel it otherwise.
async fn reconcile_stray_entry<E: ExchangePort>(
    client: &E,
    store: &BotStore,
    config: &Config,
    symbol: &str,
    order: &ExchangeOrder,
) {
    let candles = client
        .fetch_candles(symbol, &config.timeframe, 100)
        .await
        .unwrap_or_default();
    let blocks = detect_order_blocks(&candles, PIVOT_LENGTH);

    let adoptable = blocks.iter().any(|block| {
        let edge = block.entry_edge();
        if edge <= 0.0 {
            return false;
        }
        let within = (order.price - edge).abs() / edge <= ADOPTION_PRICE_TOLERANCE;
        within
            && match block.kind {
                BlockKind::Bullish => order.side == "BUY",
                BlockKind::Bearish => order.side == "SELL",
            }
    });

    if adoptable {
        info!(symbol, order_id = %order.order_id, price = order.price, "adopting stray entry order");
        let side = if order.side == "BUY" {
            crate::types::TradeSide::Buy
        } else {
            crate::types::TradeSide::Sell
        };
        store.adopt_pending_order(PendingOrder {
            symbol: symbol.to_string(),
            order_id: order.order_id.clone(),
            params: TradePlan {
                symbol: symbol.to_string(),
                side,
                entry_price: order.price,
                // Unknown until fill; the position pass derives protection.
                stop_loss: 0.0,
                take_profit: 0.0,
                quantity: order.amount,
            },
            created_at: Utc::now(),
            exchange_orders: ProtectiveIds::default(),
            last_tp_sl_placement: None,
            partial_fill: false,
            filled_amount: 0.0,
        });
        store.add_reconciliation_log(
            "adopted_orphan_order",
            Some(symbol),
            json!({ "order_id": order.order_id, "price": order.price }),
        );
    } else {
        warn!(symbol, order_id = %order.order_id, price = order.price, "canceling orphan order");
        if client.cancel_order(symbol, &order.order_id).await.unwrap_or(false) {
            store.update_metrics(|m| m.cancelled_orders_count += 1);
        }
        store.add_reconciliation_log(
            "cancelled_orphan_order",
            Some(symbol),
            json!({ "order_id": order.order_id, "price": order.price }),
        );
    }
}

/// A persisted pending order with no live counterpart: query its terminal
/// status and drop it when the exchange is done with it.
async fn resolve_unmatched_pending<E: ExchangePort>(
    client: &E,
    store: &BotStore,
    symbol: &str,
    pending: &PendingOrder,
) {
    let status = match client.get_order_status(symbol, &pending.order_id).await {
        Ok(status) => status,
        Err(e) => {
            warn!(symbol, order_id = %pending.order_id, error = %e, "status query failed, keeping pending");
            return;
        }
    };

    match status {
        None => {
            info!(symbol, order_id = %pending.order_id, "pending order unknown to exchange, dropping");
            store.remove_pending_order(symbol);
            store.add_reconciliation_log(
                "pending_order_not_found",
                Some(symbol),
                json!({ "order_id": pending.order_id }),
            );
        }
        Some(order) if order.is_filled() => {
            info!(symbol, order_id = %pending.order_id, "pending order filled while offline");
            store.update_metrics(|m| m.filled_orders_count += 1);
            store.remove_pending_order(symbol);
            store.add_reconciliation_log(
                "pending_order_filled_offline",
                Some(symbol),
                json!({ "order_id": pending.order_id }),
            );
        }
        Some(order) if order.is_dead() => {
            info!(symbol, order_id = %pending.order_id, status = %order.status, "pending order terminal, dropping");
            store.remove_pending_order(symbol);
            store.add_reconciliation_log(
                "pending_order_terminal",
                Some(symbol),
                json!({ "order_id": pending.order_id, "status": order.status }),
            );
        }
        Some(_) => {
            // Still open; the symbol fetch likely failed earlier. Keep it.
            debug!(symbol, order_id = %pending.order_id, "pending order still open");
        }
    }
}

// ---------------------------------------------------------------------------
// 2. Position / TP-SL reconciliation
// ---------------------------------------------------------------------------

/// Protective targets for a position: from its pending plan when one exists,
/// else a fixed-percent envelope around entry scaled by the reward ratio.
fn protection_targets(
    pending: Option<&PendingOrder>,
    side: PositionSide,
    entry_price: f64,
    rr_ratio: f64,
) -> (f64, f64) {
    if let Some(p) = pending {
        if p.params.stop_loss > 0.0 && p.params.take_profit > 0.0 {
            return (p.params.stop_loss, p.params.take_profit);
        }
    }
    match side {
        PositionSide::Long => (
            entry_price * (1.0 - FALLBACK_PROTECTION_PCT),
            entry_price * (1.0 + FALLBACK_PROTECTION_PCT * rr_ratio),
        ),
        PositionSide::Short => (
            entry_price * (1.0 + FALLBACK_PROTECTION_PCT),
            entry_price * (1.0 - FALLBACK_PROTECTION_PCT * rr_ratio),
        ),
    }
}

/// Ensure every exchange position carries protective legs matching its plan.
///
/// Guarded by the store's reconciliation gate: overlapping sweeps skip and
/// count instead of queueing.
pub async fn reconcile_positions_tp_sl<E: ExchangePort>(
    client: &E,
    store: &BotStore,
    config: &Config,
) -> Result<()> {
    let Some(_guard) = store.try_begin_reconciliation() else {
        debug!("reconciliation already in progress, skipping");
        return Ok(());
    };
    store.update_metrics(|m| m.reconciliation_runs_count += 1);

    let positions = client
        .get_all_positions()
        .await
        .context("position fetch failed during reconciliation")?;

    for position in positions {
        if position.contracts == 0.0 {
            continue;
        }
        if let Err(e) = reconcile_one_position(client, store, config, &position).await {
            warn!(symbol = %position.symbol, error = %e, "position reconciliation failed");
        }
    }

    Ok(())
}

async fn reconcile_one_position<E: ExchangePort>(
    client: &E,
    store: &BotStore,
    config: &Config,
    info: &crate::exchange::PositionInfo,
) -> Result<()> {
    let symbol = info.symbol.clone();
    let side = resolve_position_side(info.side.as_deref(), info.contracts);
    let size = info.contracts.abs();

    store.upsert_position(Position {
        symbol: symbol.clone(),
        side,
        size,
        entry_price: info.entry_price,
        mark_price: info.mark_price,
        unrealized_pnl: info.unrealized_pnl,
        leverage: info.leverage,
        entry_time: None,
        take_profit: None,
        stop_loss: None,
    });

    let pending = store.get_pending_order(&symbol);
    let (sl_target, tp_target) =
        protection_targets(pending.as_ref(), side, info.entry_price, config.rr_ratio);
    store.set_position_protection(&symbol, Some(tp_target), Some(sl_target));

    // Pre-check: do matching legs already exist?
    let orders = client.get_open_orders(Some(&symbol)).await.unwrap_or_default();
    let tick = client
        .market_tick_size(&symbol)
        .await
        .unwrap_or(DEFAULT_TICK_SIZE);
    let qty_tol = config.tp_sl_quantity_tolerance;

    let sl_matches = orders.iter().any(|o| {
        (o.reduce_only || o.is_tp_sl_type())
            && o.is_stop_loss_like()
            && order_matches_target(o, sl_target, size, tick, qty_tol)
    });
    let tp_matches = orders.iter().any(|o| {
        (o.reduce_only || o.is_tp_sl_type())
            && o.is_take_profit_like()
            && order_matches_target(o, tp_target, size, tick, qty_tol)
    });

    if sl_matches && tp_matches {
        // Reuse path: no crossed-price risk, no new placements. This also
        // records the suppressed duplicates and hands back the leg ids.
        let outcome = place_sl_tp_orders(
            client,
            store,
            config,
            &symbol,
            match side {
                PositionSide::Long => crate::types::TradeSide::Buy,
                PositionSide::Short => crate::types::TradeSide::Sell,
            },
            size,
            sl_target,
            tp_target,
        )
        .await;
        store.update_pending_order(&symbol, |p| {
            p.exchange_orders = ProtectiveIds {
                sl: outcome.sl_order.as_ref().map(|o| o.order_id.clone()),
                tp: outcome.tp_order.as_ref().map(|o| o.order_id.clone()),
            };
        });
        return Ok(());
    }

    // Defer when a placement just happened: the venue may simply not be
    // reporting it yet.
    if let Some(p) = &pending {
        if let Some(last) = p.last_tp_sl_placement {
            let elapsed = (Utc::now() - last).num_seconds();
            if elapsed < config.tp_sl_placement_cooldown_seconds {
                debug!(symbol, elapsed, "TP/SL placement in cooldown, deferring");
                return Ok(());
            }
        }
    }

    let result = safe_place_tp_sl(
        client,
        store,
        config,
        &symbol,
        side.is_long(),
        size,
        tp_target,
        sl_target,
    )
    .await;

    if let TpSlPlacement::Placed(outcome) = result {
        let now = Utc::now();
        store.update_pending_order(&symbol, |p| {
            p.exchange_orders = ProtectiveIds {
                sl: outcome.sl_order.as_ref().map(|o| o.order_id.clone()),
                tp: outcome.tp_order.as_ref().map(|o| o.order_id.clone()),
            };
            p.last_tp_sl_placement = Some(now);
        });
        store.add_reconciliation_log(
            "tp_sl_reconciled",
            Some(&symbol),
            json!({ "sl": sl_target, "tp": tp_target, "size": size }),
        );
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// 3. Stale pending expiry
// ---------------------------------------------------------------------------

/// Cancel and drop pending entries older than the configured threshold.
/// The cancel attempt is best-effort: the pending row is removed either way.
pub async fn expire_stale_pending<E: ExchangePort>(
    client: &E,
    store: &BotStore,
    config: &Config,
) {
    let now = Utc::now();
    for (symbol, pending) in store.pending_orders_snapshot() {
        let age_secs = (now - pending.created_at).num_seconds();
        if age_secs <= config.pending_order_stale_seconds as i64 {
            continue;
        }

        warn!(
            symbol,
            order_id = %pending.order_id,
            age_secs,
            "pending order stale, force-canceling"
        );
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
    }
}

// ---------------------------------------------------------------------------
// 4. Breach safety net
// ---------------------------------------------------------------------------

/// Whether the recorded targets sit on the correct side of entry for the
/// position's direction. A wrong-sided target means the stored plan is
/// corrupt; acting on it would close healthy positions.
fn targets_consistent(position: &Position) -> bool {
    let entry = position.entry_price;
    let tp_ok = position
        .take_profit
        .map(|tp| if position.side.is_long() { tp > entry } else { tp < entry })
        .unwrap_or(true);
    let sl_ok = position
        .stop_loss
        .map(|sl| if position.side.is_long() { sl < entry } else { sl > entry })
        .unwrap_or(true);
    tp_ok && sl_ok
}

/// Force-close positions whose mark price has already crossed a recorded
/// protective level. Runs every worker cycle when enabled.
pub async fn monitor_and_close_positions<E: ExchangePort>(
    client: &E,
    store: &BotStore,
    config: &Config,
) {
    if !config.enable_active_tp_sl_monitoring {
        return;
    }

    for position in store.positions_snapshot() {
        let symbol = position.symbol.clone();

        if !targets_consistent(&position) {
            let (should_log, suppressed) = store.should_log("tp_sl_inconsistent", &symbol);
            if should_log {
                warn!(
                    symbol,
                    side = %position.side,
                    entry = position.entry_price,
                    tp = ?position.take_profit,
                    sl = ?position.stop_loss,
                    suppressed,
                    "TP/SL on wrong side of entry, skipping breach check"
                );
            }
            continue;
        }

        let mark = position.mark_price;
        let breach = if position.side.is_long() {
            match (position.take_profit, position.stop_loss) {
                (Some(tp), _) if mark >= tp => Some("tp_breach"),
                (_, Some(sl)) if mark <= sl => Some("sl_breach"),
                _ => None,
            }
        } else {
            match (position.take_profit, position.stop_loss) {
                (Some(tp), _) if mark <= tp => Some("tp_breach"),
                (_, Some(sl)) if mark >= sl => Some("sl_breach"),
                _ => None,
            }
        };

        let Some(reason) = breach else {
            continue;
        };

        info!(
            symbol,
            side = %position.side,
            mark,
            tp = ?position.take_profit,
            sl = ?position.stop_loss,
            reason,
            "protective level breached, forcing closure"
        );

        // Protective legs first: a resting conditional firing mid-close
        // would double the exit.
        match client.get_open_orders(Some(&symbol)).await {
            Ok(orders) => {
                for order in orders.iter().filter(|o| o.reduce_only || o.is_tp_sl_type()) {
                    match client.cancel_order(&symbol, &order.order_id).await {
                        Ok(true) => store.update_metrics(|m| m.cancelled_orders_count += 1),
                        Ok(false) => {}
                        Err(e) => {
                            warn!(symbol, order_id = %order.order_id, error = %e, "leg cancel failed")
                        }
                    }
                }
            }
            Err(e) => warn!(symbol, error = %e, "leg fetch failed before forced closure"),
        }

        let close_side = position.side.closing_side();
        let pnl = if position.side.is_long() {
            (mark - position.entry_price) * position.size
        } else {
            (position.entry_price - mark) * position.size
        };

        match client
            .close_position_market(&symbol, close_side, position.size, reason)
            .await
        {
            Ok(order) => {
                store.add_forced_closure_log(
                    &symbol,
                    reason,
                    json!({
                        "side": position.side,
                        "size": position.size,
                        "entry_price": position.entry_price,
                        "mark_price": mark,
                        "take_profit": position.take_profit,
                        "stop_loss": position.stop_loss,
                        "pnl": (pnl * 100.0).round() / 100.0,
                        "market_order_id": order.order_id,
                    }),
                );
            }
            Err(e) => {
                warn!(symbol, reason, error = %e, "forced closure failed");
            }
        }

        // Space consecutive closures to stay under venue rate limits.
        tokio::time::sleep(config.forced_closure_rate_limit_delay).await;
    }
}

// ---------------------------------------------------------------------------
// 5. Position ↔ trade-history reconciliation (startup)
// ---------------------------------------------------------------------------

/// Give every live exchange position an OPEN trade-history row, deriving
/// protective prices from its reduce-only orders. Runs once at startup;
/// position removal closes rows through the store.
pub async fn sync_positions_with_history<E: ExchangePort>(client: &E, store: &BotStore) {
    let positions = match client.get_all_positions().await {
        Ok(positions) => positions,
        Err(e) => {
            warn!(error = %e, "position fetch failed during history sync");
            return;
        }
    };

    for info in positions {
        if info.contracts == 0.0 || store.has_open_trade(&info.symbol) {
            continue;
        }

        let side = resolve_position_side(info.side.as_deref(), info.contracts);
        let orders = client
            .get_open_orders(Some(&info.symbol))
            .await
            .unwrap_or_default();
        let stop_loss = orders
            .iter()
            .filter(|o| o.reduce_only || o.is_tp_sl_type())
            .find(|o| o.is_stop_loss_like())
            .map(|o| o.effective_price());
        let take_profit = orders
            .iter()
            .filter(|o| o.reduce_only || o.is_tp_sl_type())
            .find(|o| o.is_take_profit_like())
            .map(|o| o.effective_price());

        info!(symbol = %info.symbol, side = %side, "synthesizing trade row for untracked position");
        store.add_trade(Trade {
            symbol: info.symbol.clone(),
            side,
            entry_price: info.entry_price,
            exit_price: None,
            size: info.contracts.abs(),
            pnl: None,
            status: TradeStatus::Open,
            take_profit,
            stop_loss,
            entry_time: None,
            exit_time: None,
            timestamp: Utc::now(),
        });
        store.add_reconciliation_log(
            "synthesized_trade_row",
            Some(&info.symbol),
            json!({ "entry_price": info.entry_price, "size": info.contracts.abs() }),
        );
    }
}
