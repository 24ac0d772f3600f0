// =============================================================================
// Execution layer — retrying placement with idempotent TP/SL handling
// =============================================================================
//
// Every placement returns a value, never an error: the exchange call is
// retried on transient failures, validated for response shape, and reduced to
// `Option`/enum outcomes so callers branch on data. Transience decisions live
// here and do not leak upward.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::exchange::{ExchangeOrder, ExchangePort};
use crate::order_utils::{
    mark_price_from_ticker, order_matches_target, round_to_tick, DEFAULT_TICK_SIZE,
};
use crate::planner::TradePlan;
use crate::store::BotStore;
use crate::types::{FallbackMode, TradeSide};

/// Delays between placement retries. One initial attempt plus one retry per
/// entry.
const RETRY_DELAYS: [f64; 3] = [0.5, 1.0, 2.0];

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Whether an exchange error is worth retrying: timeouts, connectivity, and
/// throttling. Anything else (auth, funds, parameter rejection) fails fast.
pub fn is_transient_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["timeout", "timed out", "network", "connection", "429", "503", "504", "rate limit"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Reject orders whose response carries no usable id; the venue may have
/// dropped them server-side.
fn validate_order_response(order: ExchangeOrder) -> Option<ExchangeOrder> {
    if order.order_id.trim().is_empty() || order.order_id == "0" {
        warn!(symbol = %order.symbol, "order response missing id, treating as failed");
        return None;
    }
    Some(order)
}

// ---------------------------------------------------------------------------
// Retry plumbing
// ---------------------------------------------------------------------------

/// Run a placement call with the standard retry schedule. Transient errors
/// are retried (counted in metrics); permanent errors and exhausted retries
/// surface as `None`.
async fn retry_placement<Fut>(
    store: &BotStore,
    label: &str,
    symbol: &str,
    mut op: impl FnMut() -> Fut,
) -> Option<ExchangeOrder>
where
    Fut: Future<Output = Result<ExchangeOrder>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(order) => return validate_order_response(order),
            Err(e) => {
                let message = e.to_string();
                if is_transient_error(&message) && attempt < RETRY_DELAYS.len() {
                    let delay = RETRY_DELAYS[attempt];
                    attempt += 1;
                    store.update_metrics(|m| m.order_create_retries_total += 1);
                    warn!(label, symbol, attempt, delay, error = %message, "transient placement error, retrying");
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    continue;
                }
                warn!(label, symbol, error = %message, "placement failed");
                return None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entry placement
// ---------------------------------------------------------------------------

/// Place the limit entry for a trade plan. Quantity and price are snapped to
/// market precision first. Returns the accepted order, or `None`.
pub async fn place_entry_order<E: ExchangePort>(
    client: &E,
    store: &BotStore,
    plan: &TradePlan,
) -> Option<ExchangeOrder> {
    let quantity = client
        .amount_to_precision(&plan.symbol, plan.quantity)
        .await
        .unwrap_or(plan.quantity);
    let price = client
        .price_to_precision(&plan.symbol, plan.entry_price)
        .await
        .unwrap_or(plan.entry_price);

    if quantity <= 0.0 {
        warn!(symbol = %plan.symbol, raw_quantity = plan.quantity, "entry quantity rounds to zero");
        return None;
    }

    info!(symbol = %plan.symbol, side = %plan.side, quantity, price, "placing limit entry");

    let order = retry_placement(store, "entry", &plan.symbol, || {
        client.place_limit(&plan.symbol, plan.side, quantity, price)
    })
    .await?;

    store.update_metrics(|m| m.placed_orders_count += 1);
    Some(order)
}

// ---------------------------------------------------------------------------
// Idempotent TP/SL placement
// ---------------------------------------------------------------------------

/// The protective legs in force after a `place_sl_tp_orders` call.
#[derive(Debug, Clone, Default)]
pub struct SlTpOutcome {
    pub sl_order: Option<ExchangeOrder>,
    pub tp_order: Option<ExchangeOrder>,
}

impl SlTpOutcome {
    pub fn complete(&self) -> bool {
        self.sl_order.is_some() && self.tp_order.is_some()
    }
}

/// Pick the order to compare against the target: the one already matching
/// price and quantity within tolerance, else the first of the group.
fn select_representative<'a>(
    orders: &'a [ExchangeOrder],
    target_price: f64,
    target_qty: f64,
    tick: f64,
    qty_tol: f64,
) -> Option<&'a ExchangeOrder> {
    orders
        .iter()
        .find(|o| order_matches_target(o, target_price, target_qty, tick, qty_tol))
        .or_else(|| orders.first())
}

/// Place (or adopt) the stop-loss and take-profit legs for a position.
///
/// Existing reduce-only orders that already match the targets are reused and
/// counted as suppressed duplicates; mismatching legs are canceled and
/// re-placed. When the live open-order fetch comes back empty, the cached
/// exchange mirror is cross-checked so an API that lags its own writes does
/// not cause double placement.
///
/// The stop-loss is handled first; if it cannot be placed the take-profit is
/// not attempted (a position with only a TP is worse than one with neither).
pub async fn place_sl_tp_orders<E: ExchangePort>(
    client: &E,
    store: &BotStore,
    config: &Config,
    symbol: &str,
    entry_side: TradeSide,
    amount: f64,
    sl_price: f64,
    tp_price: f64,
) -> SlTpOutcome {
    let close_side = match entry_side {
        TradeSide::Buy => TradeSide::Sell,
        TradeSide::Sell => TradeSide::Buy,
    };
    let tick = client
        .market_tick_size(symbol)
        .await
        .unwrap_or(DEFAULT_TICK_SIZE);
    let qty_tol = config.tp_sl_quantity_tolerance;

    let mut live = match client.get_open_orders(Some(symbol)).await {
        Ok(orders) => orders,
        Err(e) => {
            warn!(symbol, error = %e, "open-order fetch failed before TP/SL placement");
            Vec::new()
        }
    };
    // The venue may not yet report orders it just accepted; fall back to the
    // last cycle's mirror.
    if live.is_empty() {
        live = store.cached_orders_for_symbol(symbol);
    }

    let protective: Vec<ExchangeOrder> = live
        .into_iter()
        .filter(|o| o.reduce_only || o.is_tp_sl_type())
        .collect();
    let sl_group: Vec<ExchangeOrder> = protective
        .iter()
        .filter(|o| o.is_stop_loss_like())
        .cloned()
        .collect();
    let tp_group: Vec<ExchangeOrder> = protective
        .iter()
        .filter(|o| o.is_take_profit_like())
        .cloned()
        .collect();

    let mut outcome = SlTpOutcome::default();

    // ── Stop-loss leg ───────────────────────────────────────────────────
    match select_representative(&sl_group, sl_price, amount, tick, qty_tol) {
        Some(existing) if order_matches_target(existing, sl_price, amount, tick, qty_tol) => {
            debug!(symbol, order_id = %existing.order_id, "existing SL matches target, reusing");
            store.update_metrics(|m| m.duplicate_placement_attempts += 1);
            outcome.sl_order = Some(existing.clone());
        }
        mismatch => {
            if let Some(existing) = mismatch {
                info!(
                    symbol,
                    order_id = %existing.order_id,
                    have = existing.effective_price(),
                    want = sl_price,
                    "SL mismatch, canceling before re-placement"
                );
                for stale in &sl_group {
                    if client.cancel_order(symbol, &stale.order_id).await.unwrap_or(false) {
                        store.update_metrics(|m| m.cancelled_orders_count += 1);
                    }
                }
            }
            outcome.sl_order = retry_placement(store, "stop_loss", symbol, || {
                client.place_stop_loss(symbol, close_side, amount, sl_price)
            })
            .await;
            if outcome.sl_order.is_some() {
                store.update_metrics(|m| m.placed_orders_count += 1);
            }
        }
    }

    if outcome.sl_order.is_none() {
        warn!(symbol, "SL leg unavailable, skipping TP placement");
        return outcome;
    }

    // ── Take-profit leg ─────────────────────────────────────────────────
    match select_representative(&tp_group, tp_price, amount, tick, qty_tol) {
        Some(existing) if order_matches_target(existing, tp_price, amount, tick, qty_tol) => {
            debug!(symbol, order_id = %existing.order_id, "existing TP matches target, reusing");
            store.update_metrics(|m| m.duplicate_placement_attempts += 1);
            outcome.tp_order = Some(existing.clone());
        }
        mismatch => {
            if let Some(existing) = mismatch {
                info!(
                    symbol,
                    order_id = %existing.order_id,
                    have = existing.effective_price(),
                    want = tp_price,
                    "TP mismatch, canceling before re-placement"
                );
                for stale in &tp_group {
                    if client.cancel_order(symbol, &stale.order_id).await.unwrap_or(false) {
                        store.update_metrics(|m| m.cancelled_orders_count += 1);
                    }
                }
            }
            outcome.tp_order = retry_placement(store, "take_profit", symbol, || {
                client.place_take_profit(symbol, close_side, amount, tp_price)
            })
            .await;
            if outcome.tp_order.is_some() {
                store.update_metrics(|m| m.placed_orders_count += 1);
            }
        }
    }

    outcome
}

// ---------------------------------------------------------------------------
// Crossed-price safeguard
// ---------------------------------------------------------------------------

/// Outcome of a `safe_place_tp_sl` attempt.
#[derive(Debug, Clone)]
pub enum TpSlPlacement {
    /// Legs placed or adopted.
    Placed(SlTpOutcome),
    /// A target was already crossed; the position was market-closed.
    ClosedCrossed { reason: &'static str },
    /// A target was already crossed and fallback mode forbids closing.
    SkippedCrossed { reason: &'static str },
    /// Placement suppressed by an active backoff window.
    SkippedBackoff,
    /// Placement failed; backoff has been set.
    Failed,
}

/// Place TP/SL with pre-checks: backoff, mark-price availability, tick
/// rounding, and crossed-price detection with the configured fallback.
#[allow(clippy::too_many_arguments)]
pub async fn safe_place_tp_sl<E: ExchangePort>(
    client: &E,
    store: &BotStore,
    config: &Config,
    symbol: &str,
    is_long: bool,
    amount: f64,
    computed_tp: f64,
    computed_sl: f64,
) -> TpSlPlacement {
    if let Some(remaining) = store.backoff_remaining(symbol) {
        if store.backoff_should_log(symbol) {
            info!(symbol, remaining, "skipping TP/SL placement during backoff");
        }
        return TpSlPlacement::SkippedBackoff;
    }

    let current_price = match client.fetch_ticker(symbol).await {
        Ok(ticker) => mark_price_from_ticker(&ticker),
        Err(e) => {
            warn!(symbol, error = %e, "ticker fetch failed before TP/SL placement");
            None
        }
    };
    let Some(current_price) = current_price else {
        warn!(symbol, "cannot place TP/SL without a current price");
        store.set_backoff(symbol, config.tp_sl_pending_backoff_seconds);
        return TpSlPlacement::Failed;
    };

    let tick = client
        .market_tick_size(symbol)
        .await
        .unwrap_or(DEFAULT_TICK_SIZE);
    let buffer = tick * config.tp_sl_buffer_ticks;
    let rounded_tp = round_to_tick(computed_tp, tick);
    let rounded_sl = round_to_tick(computed_sl, tick);

    debug!(
        symbol,
        is_long,
        amount,
        current_price,
        tick,
        raw_tp = computed_tp,
        raw_sl = computed_sl,
        tp = rounded_tp,
        sl = rounded_sl,
        buffer,
        "TP/SL placement pre-check"
    );

    let (tp_crossed, sl_crossed) = if is_long {
        (
            rounded_tp <= current_price + buffer,
            rounded_sl >= current_price - buffer,
        )
    } else {
        (
            rounded_tp >= current_price - buffer,
            rounded_sl <= current_price + buffer,
        )
    };

    if tp_crossed || sl_crossed {
        let reason = if tp_crossed { "tp_already_crossed" } else { "sl_already_crossed" };
        let close_side = if is_long { TradeSide::Sell } else { TradeSide::Buy };

        match config.tp_sl_fallback_mode {
            FallbackMode::MarketReduce => {
                info!(symbol, reason, "target already crossed, closing at market");
                let order = client
                    .close_position_market(symbol, close_side, amount, reason)
                    .await;
                store.set_backoff(symbol, config.tp_sl_pending_backoff_seconds);
                match order {
                    Ok(_) => TpSlPlacement::ClosedCrossed { reason },
                    Err(e) => {
                        warn!(symbol, reason, error = %e, "fallback market close failed");
                        TpSlPlacement::Failed
                    }
                }
            }
            FallbackMode::None => {
                warn!(symbol, reason, "target already crossed but fallback mode forbids closing");
                store.add_reconciliation_log(
                    "tp_sl_crossed_skipped",
                    Some(symbol),
                    serde_json::json!({ "reason": reason, "current_price": current_price }),
                );
                store.set_backoff(symbol, config.tp_sl_pending_backoff_seconds);
                TpSlPlacement::SkippedCrossed { reason }
            }
        }
    } else {
        let entry_side = if is_long { TradeSide::Buy } else { TradeSide::Sell };
        let outcome = place_sl_tp_orders(
            client, store, config, symbol, entry_side, amount, rounded_sl, rounded_tp,
        )
        .await;

        store.set_backoff(symbol, config.tp_sl_pending_backoff_seconds);
        if outcome.sl_order.is_some() {
            TpSlPlacement::Placed(outcome)
        } else {
            TpSlPlacement::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use std::sync::atomic::{AtomicU64, Ordering};

    static DIR_SEQ: AtomicU64 = AtomicU64::new(0);

    fn temp_store() -> BotStore {
        let seq = DIR_SEQ.fetch_add(1, Ordering::SeqCst);
        BotStore::open(std::env::temp_dir().join(format!(
            "orion-exec-test-{}-{}",
            std::process::id(),
            seq
        )))
    }

    fn plan(symbol: &str) -> TradePlan {
        TradePlan {
            symbol: symbol.to_string(),
            side: TradeSide::Buy,
            entry_price: 45000.0,
            stop_loss: 43000.0,
            take_profit: 49000.0,
            quantity: 0.1,
        }
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient_error("request timed out"));
        assert!(is_transient_error("HTTP 429 Too Many Requests"));
        assert!(is_transient_error("network unreachable"));
        assert!(is_transient_error("503 service unavailable"));
        assert!(!is_transient_error("insufficient margin"));
        assert!(!is_transient_error("signature for this request is not valid"));
    }

    #[tokio::test]
    async fn entry_retries_transient_then_succeeds() {
        tokio::time::pause();
        let client = MockExchange::new();
        let store = temp_store();
        client.queue_place_failure("connection reset");
        client.queue_place_failure("HTTP 429");

        let order = place_entry_order(&client, &store, &plan("BTC/USDC:USDC")).await;

        assert!(order.is_some());
        assert_eq!(client.created_orders().len(), 1);
        assert_eq!(store.metrics_snapshot().order_create_retries_total, 2);
        assert_eq!(store.metrics_snapshot().placed_orders_count, 1);
    }

    #[tokio::test]
    async fn entry_fails_fast_on_permanent_error() {
        let client = MockExchange::new();
        let store = temp_store();
        client.queue_place_failure("insufficient margin");

        let order = place_entry_order(&client, &store, &plan("BTC/USDC:USDC")).await;

        assert!(order.is_none());
        assert!(client.created_orders().is_empty());
        assert_eq!(store.metrics_snapshot().order_create_retries_total, 0);
    }

    #[tokio::test]
    async fn blank_order_id_is_a_failure() {
        let client = MockExchange::new();
        let store = temp_store();
        client.set_blank_order_ids(true);

        let order = place_entry_order(&client, &store, &plan("BTC/USDC:USDC")).await;
        assert!(order.is_none());
    }

    #[tokio::test]
    async fn matching_legs_are_reused_without_new_orders() {
        // Scenario: both protective legs already exist at the targets.
        let client = MockExchange::new();
        let store = temp_store();
        let cfg = Config::default();

        client.add_open_order(MockExchange::protective_order(
            "existing_sl_123",
            "BTC/USDC",
            "STOP_MARKET",
            43000.0,
            0.1,
        ));
        client.add_open_order(MockExchange::protective_order(
            "existing_tp_456",
            "BTC/USDC",
            "TAKE_PROFIT_MARKET",
            49000.0,
            0.1,
        ));

        let outcome = place_sl_tp_orders(
            &client,
            &store,
            &cfg,
            "BTC/USDC",
            TradeSide::Buy,
            0.1,
            43000.0,
            49000.0,
        )
        .await;

        assert_eq!(outcome.sl_order.unwrap().order_id, "existing_sl_123");
        assert_eq!(outcome.tp_order.unwrap().order_id, "existing_tp_456");
        assert!(client.created_orders().is_empty());
        assert!(client.cancelled().is_empty());
        assert_eq!(store.metrics_snapshot().duplicate_placement_attempts, 2);
    }

    #[tokio::test]
    async fn cached_orders_prevent_duplicates_when_fetch_lags() {
        // The live fetch returns nothing but the state mirror still has both
        // legs: reuse them, create nothing.
        let client = MockExchange::new();
        let store = temp_store();
        let cfg = Config::default();

        store.update_exchange_open_orders(vec![
            MockExchange::protective_order("state_sl", "BTC/USDC", "STOP_MARKET", 43000.0, 0.1),
            MockExchange::protective_order(
                "state_tp",
                "BTC/USDC",
                "TAKE_PROFIT_MARKET",
                49000.0,
                0.1,
            ),
        ]);

        let outcome = place_sl_tp_orders(
            &client,
            &store,
            &cfg,
            "BTC/USDC",
            TradeSide::Buy,
            0.1,
            43000.0,
            49000.0,
        )
        .await;

        assert!(client.created_orders().is_empty());
        assert_eq!(outcome.sl_order.unwrap().order_id, "state_sl");
        assert_eq!(outcome.tp_order.unwrap().order_id, "state_tp");
        assert_eq!(store.metrics_snapshot().duplicate_placement_attempts, 2);
    }

    #[tokio::test]
    async fn mismatched_sl_is_replaced_tp_untouched() {
        // Existing SL at 42000 vs target 43000: cancel + re-place. The
        // matching TP stays.
        let client = MockExchange::new();
        let store = temp_store();
        let cfg = Config::default();

        client.add_open_order(MockExchange::protective_order(
            "old_sl_order",
            "BTC/USDC",
            "STOP_MARKET",
            42000.0,
            0.1,
        ));
        client.add_open_order(MockExchange::protective_order(
            "existing_tp",
            "BTC/USDC",
            "TAKE_PROFIT_MARKET",
            49000.0,
            0.1,
        ));

        let outcome = place_sl_tp_orders(
            &client,
            &store,
            &cfg,
            "BTC/USDC",
            TradeSide::Buy,
            0.1,
            43000.0,
            49000.0,
        )
        .await;

        assert!(client.cancelled().contains(&("BTC/USDC".to_string(), "old_sl_order".to_string())));
        let created = client.created_orders();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].order_type, "STOP_MARKET");
        assert_eq!(created[0].stop_price, Some(43000.0));
        assert_eq!(outcome.tp_order.unwrap().order_id, "existing_tp");
        assert_eq!(store.metrics_snapshot().duplicate_placement_attempts, 1);
    }

    #[tokio::test]
    async fn sl_failure_skips_tp() {
        let client = MockExchange::new();
        let store = temp_store();
        let cfg = Config::default();
        client.queue_place_failure("margin is insufficient");

        let outcome = place_sl_tp_orders(
            &client,
            &store,
            &cfg,
            "BTC/USDC",
            TradeSide::Buy,
            0.1,
            43000.0,
            49000.0,
        )
        .await;

        assert!(outcome.sl_order.is_none());
        assert!(outcome.tp_order.is_none());
        // Only the SL attempt reached the venue.
        assert!(client.created_orders().is_empty());
    }

    #[tokio::test]
    async fn crossed_tp_triggers_market_close() {
        let client = MockExchange::new();
        let store = temp_store();
        let cfg = Config::default();
        client.set_mark_price("BTC/USDC:USDC", 41500.0);
        client.set_tick_size("BTC/USDC:USDC", 0.1);

        // Long with TP 41000 while mark is 41500: already crossed.
        let result = safe_place_tp_sl(
            &client,
            &store,
            &cfg,
            "BTC/USDC:USDC",
            true,
            0.01,
            41000.0,
            39000.0,
        )
        .await;

        assert!(matches!(result, TpSlPlacement::ClosedCrossed { reason: "tp_already_crossed" }));
        let closes = client.market_closes();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].1, TradeSide::Sell);
        assert!((closes[0].2 - 0.01).abs() < 1e-12);
        // Backoff armed so the next cycle does not hammer the venue.
        assert!(store.backoff_remaining("BTC/USDC:USDC").is_some());
    }

    #[tokio::test]
    async fn crossed_price_with_none_mode_skips() {
        let client = MockExchange::new();
        let store = temp_store();
        let mut cfg = Config::default();
        cfg.tp_sl_fallback_mode = FallbackMode::None;
        client.set_mark_price("SOL/USDC:USDC", 98.0);

        // Short with SL 97 while mark is 98: SL already crossed.
        let result = safe_place_tp_sl(
            &client,
            &store,
            &cfg,
            "SOL/USDC:USDC",
            false,
            5.0,
            90.0,
            97.0,
        )
        .await;

        assert!(matches!(result, TpSlPlacement::SkippedCrossed { reason: "sl_already_crossed" }));
        assert!(client.market_closes().is_empty());
        assert!(client.created_orders().is_empty());
    }

    #[tokio::test]
    async fn backoff_suppresses_placement() {
        let client = MockExchange::new();
        let store = temp_store();
        let cfg = Config::default();
        store.set_backoff("ETH/USDC:USDC", 60);

        let result = safe_place_tp_sl(
            &client,
            &store,
            &cfg,
            "ETH/USDC:USDC",
            true,
            1.0,
            3100.0,
            2900.0,
        )
        .await;

        assert!(matches!(result, TpSlPlacement::SkippedBackoff));
        assert!(client.created_orders().is_empty());
    }

    #[tokio::test]
    async fn uncrossed_prices_place_both_legs() {
        let client = MockExchange::new();
        let store = temp_store();
        let cfg = Config::default();
        client.set_mark_price("BTC/USDC:USDC", 45000.0);
        client.set_tick_size("BTC/USDC:USDC", 0.1);

        let result = safe_place_tp_sl(
            &client,
            &store,
            &cfg,
            "BTC/USDC:USDC",
            true,
            0.1,
            49000.0,
            43000.0,
        )
        .await;

        let TpSlPlacement::Placed(outcome) = result else {
            panic!("expected placement");
        };
        assert!(outcome.complete());

        let created = client.created_orders();
        assert_eq!(created.len(), 2);
        // SL first.
        assert_eq!(created[0].order_type, "STOP_MARKET");
        assert_eq!(created[0].stop_price, Some(43000.0));
        assert_eq!(created[1].order_type, "TAKE_PROFIT_MARKET");
        assert_eq!(created[1].stop_price, Some(49000.0));
        // Both legs sized to the position within tolerance.
        for leg in &created {
            assert!((leg.amount - 0.1).abs() <= 0.1 * cfg.tp_sl_quantity_tolerance);
        }
    }
}
