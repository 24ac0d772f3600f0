// =============================================================================
// Bot Store — single-writer engine state with JSON durability
// =============================================================================
//
// Ownership rule: the worker task is the only writer; the HTTP layer reads.
// Container-typed fields are replaced wholesale under a short write lock so a
// reader holding a clone never observes a half-updated collection.
//
// Durability: pending orders, metrics, trade history, and the balance
// timeline are serialized in full to JSON files under `data/` on every write,
// via an atomic tmp + rename. A corrupt or missing file loads as empty.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::exchange::{AccountBalance, Candle, ExchangeOrder};
use crate::order_utils::normalize_symbol;
use crate::planner::TradePlan;
use crate::signal::OrderBlock;
use crate::types::{PositionSide, TradeStatus};

/// Reconciliation log retention (head-insert FIFO).
const RECONCILIATION_LOG_CAP: usize = 50;
/// Trade-history retention (head-insert FIFO).
const TRADE_HISTORY_CAP: usize = 100;
/// Balance timeline retention.
const BALANCE_HISTORY_CAP: usize = 5000;
/// Chart candles retained per symbol for the frontend.
const OHLCV_CHART_CAP: usize = 100;
/// Minimum seconds between repeated log emissions per (category, symbol).
const LOG_THROTTLE_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// Exchange ids of the protective legs attached to a filled entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtectiveIds {
    #[serde(default)]
    pub sl: Option<String>,
    #[serde(default)]
    pub tp: Option<String>,
}

/// A limit entry the bot has placed and is waiting on.
///
/// Older persisted files may predate some fields; serde defaults backfill
/// them on load so a restart never rejects its own state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub symbol: String,
    pub order_id: String,
    pub params: TradePlan,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub exchange_orders: ProtectiveIds,
    #[serde(default)]
    pub last_tp_sl_placement: Option<DateTime<Utc>>,
    #[serde(default)]
    pub partial_fill: bool,
    #[serde(default)]
    pub filled_amount: f64,
}

/// Operational counters, persisted across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub pending_orders_count: u64,
    #[serde(default)]
    pub open_exchange_orders_count: u64,
    #[serde(default)]
    pub placed_orders_count: u64,
    #[serde(default)]
    pub cancelled_orders_count: u64,
    #[serde(default)]
    pub filled_orders_count: u64,
    #[serde(default)]
    pub reconciliation_runs_count: u64,
    #[serde(default)]
    pub reconciliation_skipped_count: u64,
    #[serde(default)]
    pub duplicate_placement_attempts: u64,
    #[serde(default)]
    pub order_create_retries_total: u64,
    #[serde(default)]
    pub pending_order_stale_count: u64,
}

/// One row of the trade journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    #[serde(default)]
    pub exit_price: Option<f64>,
    pub size: f64,
    #[serde(default)]
    pub pnl: Option<f64>,
    pub status: TradeStatus,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub entry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_time: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// One point of the balance timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancePoint {
    pub timestamp: DateTime<Utc>,
    pub total: f64,
    pub free: f64,
    pub used: f64,
    pub total_pnl: f64,
}

// ---------------------------------------------------------------------------
// In-memory records
// ---------------------------------------------------------------------------

/// Cached mirror of an exchange position, enriched with protective prices
/// derived from reduce-only open orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// Absolute contract count.
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: f64,
    #[serde(default)]
    pub entry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
}

/// One reconciliation-log entry (not persisted).
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub details: Value,
}

/// Candle shape consumed by the dashboard chart.
#[derive(Debug, Clone, Serialize)]
pub struct ChartCandle {
    /// Epoch seconds.
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Clone)]
struct BackoffEntry {
    until: DateTime<Utc>,
    logged: bool,
}

#[derive(Debug, Clone)]
struct ThrottleEntry {
    last_logged: DateTime<Utc>,
    suppressed: u64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Process-wide engine state. Wrapped in `Arc` and shared between the worker
/// (writer) and the HTTP API (readers).
pub struct BotStore {
    data_dir: PathBuf,

    // -- account -------------------------------------------------------------
    balance: RwLock<AccountBalance>,
    total_pnl: RwLock<f64>,
    last_update: RwLock<Option<DateTime<Utc>>>,

    // -- market mirrors for the API -------------------------------------
    ohlcv: RwLock<HashMap<String, Vec<ChartCandle>>>,
    order_blocks: RwLock<HashMap<String, Vec<OrderBlock>>>,
    last_price: RwLock<HashMap<String, f64>>,

    // -- positions & orders ----------------------------------------------
    positions: RwLock<HashMap<String, Position>>,
    pending_orders: RwLock<HashMap<String, PendingOrder>>,
    exchange_open_orders: RwLock<Vec<ExchangeOrder>>,

    // -- history ---------------------------------------------------------
    trade_history: RwLock<Vec<Trade>>,
    balance_history: RwLock<VecDeque<BalancePoint>>,

    // -- operational -----------------------------------------------------
    metrics: RwLock<Metrics>,
    reconciliation_log: RwLock<Vec<ReconciliationEntry>>,
    tp_sl_backoff: RwLock<HashMap<String, BackoffEntry>>,
    log_throttle: RwLock<HashMap<(String, String), ThrottleEntry>>,

    /// Serializes reconciliation cycles. Acquired non-blocking; losers skip.
    reconcile_gate: Mutex<()>,
}

impl BotStore {
    /// Create a store rooted at `data_dir` and load all persisted state.
    pub fn open(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();

        let pending: HashMap<String, PendingOrder> =
            load_json(&data_dir.join("pending_orders.json"));
        let mut metrics: Metrics = load_json(&data_dir.join("metrics.json"));
        let trades: Vec<Trade> = load_json(&data_dir.join("trade_history.json"));
        let balance_points: Vec<BalancePoint> = load_json(&data_dir.join("balance_history.json"));

        metrics.pending_orders_count = pending.len() as u64;

        info!(
            pending = pending.len(),
            trades = trades.len(),
            balance_points = balance_points.len(),
            data_dir = %data_dir.display(),
            "store loaded"
        );

        Self {
            data_dir,
            balance: RwLock::new(AccountBalance::default()),
            total_pnl: RwLock::new(0.0),
            last_update: RwLock::new(None),
            ohlcv: RwLock::new(HashMap::new()),
            order_blocks: RwLock::new(HashMap::new()),
            last_price: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            pending_orders: RwLock::new(pending),
            exchange_open_orders: RwLock::new(Vec::new()),
            trade_history: RwLock::new(trades),
            balance_history: RwLock::new(balance_points.into()),
            metrics: RwLock::new(metrics),
            reconciliation_log: RwLock::new(Vec::new()),
            tp_sl_backoff: RwLock::new(HashMap::new()),
            log_throttle: RwLock::new(HashMap::new()),
            reconcile_gate: Mutex::new(()),
        }
    }

    // -------------------------------------------------------------------------
    // Reconciliation gate
    // -------------------------------------------------------------------------

    /// Try to enter a reconciliation cycle. Returns `None` (and bumps the
    /// skip counter) when another cycle is already running.
    pub fn try_begin_reconciliation(&self) -> Option<MutexGuard<'_, ()>> {
        match self.reconcile_gate.try_lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                self.update_metrics(|m| m.reconciliation_skipped_count += 1);
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Balance
    // -------------------------------------------------------------------------

    pub fn update_full_balance(&self, total: f64, free: f64, used: f64) {
        *self.balance.write() = AccountBalance { total, free, used };
        *self.last_update.write() = Some(Utc::now());
    }

    pub fn balance(&self) -> AccountBalance {
        *self.balance.read()
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        *self.last_update.read()
    }

    pub fn total_pnl(&self) -> f64 {
        *self.total_pnl.read()
    }

    /// Append one point of the balance timeline and persist it.
    pub fn record_balance_point(&self) {
        let balance = self.balance();
        let point = BalancePoint {
            timestamp: Utc::now(),
            total: balance.total,
            free: balance.free,
            used: balance.used,
            total_pnl: self.total_pnl(),
        };

        {
            let mut history = self.balance_history.write();
            history.push_back(point);
            while history.len() > BALANCE_HISTORY_CAP {
                history.pop_front();
            }
        }
        self.save_balance_history();
    }

    pub fn balance_history_snapshot(&self) -> Vec<BalancePoint> {
        self.balance_history.read().iter().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Market mirrors
    // -------------------------------------------------------------------------

    /// Replace the chart window for `symbol` with the last 100 candles.
    pub fn update_ohlcv(&self, symbol: &str, candles: &[Candle]) {
        let start = candles.len().saturating_sub(OHLCV_CHART_CAP);
        let window: Vec<ChartCandle> = candles[start..]
            .iter()
            .map(|c| ChartCandle {
                time: c.timestamp / 1000,
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
            })
            .collect();
        self.ohlcv.write().insert(symbol.to_string(), window);
    }

    pub fn ohlcv_snapshot(&self, symbol: &str) -> Vec<ChartCandle> {
        self.ohlcv.read().get(symbol).cloned().unwrap_or_default()
    }

    pub fn update_order_blocks(&self, symbol: &str, blocks: Vec<OrderBlock>) {
        self.order_blocks.write().insert(symbol.to_string(), blocks);
    }

    pub fn order_blocks_snapshot(&self, symbol: &str) -> Vec<OrderBlock> {
        self.order_blocks.read().get(symbol).cloned().unwrap_or_default()
    }

    pub fn update_last_price(&self, symbol: &str, price: f64) {
        self.last_price.write().insert(symbol.to_string(), price);
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_price.read().get(symbol).copied()
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// Insert or refresh the mirror of an exchange position, preserving the
    /// first-seen entry time across updates.
    pub fn upsert_position(&self, position: Position) {
        let mut positions = self.positions.write();
        let entry_time = positions
            .get(&position.symbol)
            .and_then(|existing| existing.entry_time)
            .or(position.entry_time)
            .or_else(|| Some(Utc::now()));

        positions.insert(
            position.symbol.clone(),
            Position {
                entry_time,
                ..position
            },
        );
    }

    /// Remove a position the exchange no longer reports, closing its open
    /// trade-history row at the last observed mark price.
    pub fn remove_position(&self, symbol: &str) {
        let removed = self.positions.write().remove(symbol);
        if let Some(old) = removed {
            let exit_price = if old.mark_price > 0.0 {
                old.mark_price
            } else {
                let (should_log, suppressed) = self.should_log("exit_price_fallback", symbol);
                if should_log {
                    warn!(
                        symbol,
                        suppressed,
                        "no mark price for closed position, falling back to entry price"
                    );
                }
                old.entry_price
            };
            self.close_trade(symbol, exit_price);
        }
    }

    /// Attach protective prices derived from reduce-only open orders.
    pub fn set_position_protection(&self, symbol: &str, tp: Option<f64>, sl: Option<f64>) {
        if let Some(pos) = self.positions.write().get_mut(symbol) {
            pos.take_profit = tp;
            pos.stop_loss = sl;
        }
    }

    pub fn get_position(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).cloned()
    }

    pub fn positions_snapshot(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    pub fn position_symbols(&self) -> Vec<String> {
        self.positions.read().keys().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Trade history
    // -------------------------------------------------------------------------

    /// Head-insert a trade row and persist. Retention is capped.
    pub fn add_trade(&self, trade: Trade) {
        {
            let mut history = self.trade_history.write();
            history.insert(0, trade);
            history.truncate(TRADE_HISTORY_CAP);
        }
        self.save_trade_history();
    }

    /// Close the most recent OPEN row for `symbol`. PnL is computed per side
    /// and accumulated into the running total.
    pub fn close_trade(&self, symbol: &str, exit_price: f64) {
        let mut closed_pnl = None;
        {
            let mut history = self.trade_history.write();
            if let Some(trade) = history
                .iter_mut()
                .find(|t| t.symbol == symbol && t.status == TradeStatus::Open)
            {
                let pnl = match trade.side {
                    PositionSide::Long => (exit_price - trade.entry_price) * trade.size,
                    PositionSide::Short => (trade.entry_price - exit_price) * trade.size,
                };
                trade.exit_price = Some(exit_price);
                trade.pnl = Some((pnl * 100.0).round() / 100.0);
                trade.status = TradeStatus::Closed;
                trade.exit_time = Some(Utc::now());
                closed_pnl = Some(pnl);
            }
        }

        if let Some(pnl) = closed_pnl {
            *self.total_pnl.write() += pnl;
            info!(symbol, pnl, exit_price, "trade closed");
            self.save_trade_history();
        }
    }

    pub fn has_open_trade(&self, symbol: &str) -> bool {
        self.trade_history
            .read()
            .iter()
            .any(|t| t.symbol == symbol && t.status == TradeStatus::Open)
    }

    pub fn trade_history_snapshot(&self) -> Vec<Trade> {
        self.trade_history.read().clone()
    }

    // -------------------------------------------------------------------------
    // Pending orders
    // -------------------------------------------------------------------------

    /// Track a newly accepted limit entry. One pending order per symbol; a
    /// second insert for the same symbol replaces the first.
    pub fn add_pending_order(&self, symbol: &str, order_id: &str, params: TradePlan) {
        let pending = PendingOrder {
            symbol: symbol.to_string(),
            order_id: order_id.to_string(),
            params,
            created_at: Utc::now(),
            exchange_orders: ProtectiveIds::default(),
            last_tp_sl_placement: None,
            partial_fill: false,
            filled_amount: 0.0,
        };

        let count = {
            let mut map = self.pending_orders.write();
            map.insert(symbol.to_string(), pending);
            map.len() as u64
        };
        self.update_metrics(|m| m.pending_orders_count = count);
        self.save_pending_orders();
    }

    /// Insert a pre-built pending order (startup adoption path).
    pub fn adopt_pending_order(&self, pending: PendingOrder) {
        let count = {
            let mut map = self.pending_orders.write();
            map.insert(pending.symbol.clone(), pending);
            map.len() as u64
        };
        self.update_metrics(|m| m.pending_orders_count = count);
        self.save_pending_orders();
    }

    pub fn remove_pending_order(&self, symbol: &str) {
        let (removed, count) = {
            let mut map = self.pending_orders.write();
            let removed = map.remove(symbol).is_some();
            (removed, map.len() as u64)
        };
        if removed {
            self.update_metrics(|m| m.pending_orders_count = count);
            self.save_pending_orders();
        }
    }

    /// Apply an in-place mutation to one pending order and persist.
    pub fn update_pending_order(&self, symbol: &str, f: impl FnOnce(&mut PendingOrder)) {
        let updated = {
            let mut map = self.pending_orders.write();
            match map.get_mut(symbol) {
                Some(p) => {
                    f(p);
                    true
                }
                None => false,
            }
        };
        if updated {
            self.save_pending_orders();
        }
    }

    pub fn get_pending_order(&self, symbol: &str) -> Option<PendingOrder> {
        self.pending_orders.read().get(symbol).cloned()
    }

    pub fn pending_orders_snapshot(&self) -> HashMap<String, PendingOrder> {
        self.pending_orders.read().clone()
    }

    // -------------------------------------------------------------------------
    // Exchange open-order cache
    // -------------------------------------------------------------------------

    /// Replace the cached mirror of exchange open orders.
    pub fn update_exchange_open_orders(&self, orders: Vec<ExchangeOrder>) {
        let count = orders.len() as u64;
        *self.exchange_open_orders.write() = orders;
        self.update_metrics(|m| m.open_exchange_orders_count = count);
    }

    pub fn exchange_open_orders_snapshot(&self) -> Vec<ExchangeOrder> {
        self.exchange_open_orders.read().clone()
    }

    /// Cached open orders for one symbol, compared in normalized form so
    /// settlement-suffix differences between feeds don't hide orders.
    pub fn cached_orders_for_symbol(&self, symbol: &str) -> Vec<ExchangeOrder> {
        let wanted = normalize_symbol(symbol);
        self.exchange_open_orders
            .read()
            .iter()
            .filter(|o| normalize_symbol(&o.symbol) == wanted)
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------------
    // Metrics
    // -------------------------------------------------------------------------

    /// Mutate the counters and persist the result.
    pub fn update_metrics(&self, f: impl FnOnce(&mut Metrics)) {
        {
            let mut metrics = self.metrics.write();
            f(&mut metrics);
        }
        self.save_metrics();
    }

    pub fn metrics_snapshot(&self) -> Metrics {
        self.metrics.read().clone()
    }

    // -------------------------------------------------------------------------
    // Reconciliation log
    // -------------------------------------------------------------------------

    pub fn add_reconciliation_log(&self, action: &str, symbol: Option<&str>, details: Value) {
        self.push_log_entry(ReconciliationEntry {
            timestamp: Utc::now(),
            action: action.to_string(),
            symbol: symbol.map(str::to_string),
            reason: None,
            details,
        });
    }

    /// Record a safety-net forced closure.
    pub fn add_forced_closure_log(&self, symbol: &str, reason: &str, details: Value) {
        self.push_log_entry(ReconciliationEntry {
            timestamp: Utc::now(),
            action: "forced_closure".to_string(),
            symbol: Some(symbol.to_string()),
            reason: Some(reason.to_string()),
            details,
        });
    }

    fn push_log_entry(&self, entry: ReconciliationEntry) {
        let mut log = self.reconciliation_log.write();
        log.insert(0, entry);
        log.truncate(RECONCILIATION_LOG_CAP);
    }

    pub fn reconciliation_log_snapshot(&self) -> Vec<ReconciliationEntry> {
        self.reconciliation_log.read().clone()
    }

    // -------------------------------------------------------------------------
    // TP/SL backoff
    // -------------------------------------------------------------------------

    /// Suppress TP/SL placement for `symbol` for `seconds`.
    pub fn set_backoff(&self, symbol: &str, seconds: u64) {
        self.tp_sl_backoff.write().insert(
            symbol.to_string(),
            BackoffEntry {
                until: Utc::now() + Duration::seconds(seconds as i64),
                logged: false,
            },
        );
    }

    /// Remaining backoff seconds for `symbol`, clearing expired entries.
    pub fn backoff_remaining(&self, symbol: &str) -> Option<i64> {
        let mut table = self.tp_sl_backoff.write();
        let remaining = table
            .get(symbol)
            .map(|e| (e.until - Utc::now()).num_seconds());
        match remaining {
            Some(secs) if secs > 0 => Some(secs),
            Some(_) => {
                table.remove(symbol);
                None
            }
            None => None,
        }
    }

    /// Whether the active backoff window has already emitted its skip log.
    /// Marks it emitted. A fresh window logs once, then goes quiet.
    pub fn backoff_should_log(&self, symbol: &str) -> bool {
        let mut table = self.tp_sl_backoff.write();
        match table.get_mut(symbol) {
            Some(entry) if !entry.logged => {
                entry.logged = true;
                true
            }
            _ => false,
        }
    }

    // -------------------------------------------------------------------------
    // Log throttling
    // -------------------------------------------------------------------------

    /// Whether a `(category, symbol)` message may be emitted now, plus the
    /// number of emissions suppressed since the last permitted one.
    pub fn should_log(&self, category: &str, symbol: &str) -> (bool, u64) {
        self.should_log_at(category, symbol, Utc::now())
    }

    fn should_log_at(&self, category: &str, symbol: &str, now: DateTime<Utc>) -> (bool, u64) {
        let key = (category.to_string(), normalize_symbol(symbol));
        let mut table = self.log_throttle.write();

        match table.get_mut(&key) {
            Some(entry) => {
                if (now - entry.last_logged).num_seconds() >= LOG_THROTTLE_SECS {
                    let suppressed = entry.suppressed;
                    entry.last_logged = now;
                    entry.suppressed = 0;
                    (true, suppressed)
                } else {
                    entry.suppressed += 1;
                    (false, entry.suppressed)
                }
            }
            None => {
                table.insert(
                    key,
                    ThrottleEntry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                (true, 0)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    fn save_pending_orders(&self) {
        let snapshot = self.pending_orders.read().clone();
        save_json(&self.data_dir.join("pending_orders.json"), &snapshot);
    }

    fn save_metrics(&self) {
        let snapshot = self.metrics.read().clone();
        save_json(&self.data_dir.join("metrics.json"), &snapshot);
    }

    fn save_trade_history(&self) {
        let snapshot = self.trade_history.read().clone();
        save_json(&self.data_dir.join("trade_history.json"), &snapshot);
    }

    fn save_balance_history(&self) {
        let snapshot: Vec<BalancePoint> = self.balance_history.read().iter().cloned().collect();
        save_json(&self.data_dir.join("balance_history.json"), &snapshot);
    }
}

/// Load a persisted structure, treating a missing or corrupt file as empty.
fn load_json<T: DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt state file, starting empty");
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}

/// Serialize a structure to `path` atomically (tmp sibling + rename).
/// Persistence failures are warnings: in-memory state stays authoritative and
/// the next successful write supersedes.
fn save_json<T: Serialize>(path: &Path, value: &T) {
    let content = match serde_json::to_string_pretty(value) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to serialize state");
            return;
        }
    };

    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(path = %parent.display(), error = %e, "failed to create data dir");
            return;
        }
    }

    let tmp = path.with_extension("json.tmp");
    if let Err(e) = std::fs::write(&tmp, &content) {
        warn!(path = %tmp.display(), error = %e, "failed to write state file");
        return;
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        warn!(path = %path.display(), error = %e, "failed to publish state file");
    }
}
