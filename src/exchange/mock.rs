// =============================================================================
// Mock exchange — scriptable in-memory ExchangePort for tests
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::exchange::{AccountBalance, Candle, ExchangePort, ExchangeOrder, PositionInfo, Ticker};
use crate::order_utils::{normalize_symbol, DEFAULT_TICK_SIZE};
use crate::types::TradeSide;

/// In-memory exchange double. State is seeded by tests; every mutating call
/// is recorded so assertions can inspect exactly what reached the venue.
#[derive(Default)]
pub struct MockExchange {
    free_balance: Mutex<f64>,
    full_balance: Mutex<AccountBalance>,
    candles: Mutex<HashMap<String, Vec<Candle>>>,
    positions: Mutex<Vec<PositionInfo>>,
    open_orders: Mutex<Vec<ExchangeOrder>>,
    /// Scripted `get_order_status` answers, keyed by order id.
    order_status: Mutex<HashMap<String, ExchangeOrder>>,
    tick_sizes: Mutex<HashMap<String, f64>>,
    mark_prices: Mutex<HashMap<String, f64>>,

    // -- recorded effects -------------------------------------------------
    created: Mutex<Vec<ExchangeOrder>>,
    cancelled: Mutex<Vec<(String, String)>>,
    cancelled_all: Mutex<Vec<String>>,
    market_closes: Mutex<Vec<(String, TradeSide, f64, String)>>,

    // -- scripted failures -------------------------------------------------
    place_failures: Mutex<VecDeque<String>>,
    cancel_failures: Mutex<VecDeque<String>>,
    close_failures: Mutex<VecDeque<String>>,
    blank_order_ids: AtomicBool,

    next_id: AtomicU64,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            free_balance: Mutex::new(1000.0),
            full_balance: Mutex::new(AccountBalance {
                total: 1000.0,
                free: 1000.0,
                used: 0.0,
            }),
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    // -- seeding -----------------------------------------------------------

    pub fn set_free_balance(&self, balance: f64) {
        *self.free_balance.lock() = balance;
    }

    pub fn set_full_balance(&self, balance: AccountBalance) {
        *self.full_balance.lock() = balance;
    }

    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.candles.lock().insert(symbol.to_string(), candles);
    }

    pub fn set_position(&self, position: PositionInfo) {
        self.positions.lock().push(position);
    }

    pub fn clear_positions(&self) {
        self.positions.lock().clear();
    }

    pub fn add_open_order(&self, order: ExchangeOrder) {
        self.open_orders.lock().push(order);
    }

    pub fn script_order_status(&self, order: ExchangeOrder) {
        self.order_status.lock().insert(order.order_id.clone(), order);
    }

    pub fn set_tick_size(&self, symbol: &str, tick: f64) {
        self.tick_sizes.lock().insert(normalize_symbol(symbol), tick);
    }

    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        self.mark_prices.lock().insert(normalize_symbol(symbol), price);
    }

    pub fn queue_place_failure(&self, message: &str) {
        self.place_failures.lock().push_back(message.to_string());
    }

    pub fn queue_cancel_failure(&self, message: &str) {
        self.cancel_failures.lock().push_back(message.to_string());
    }

    pub fn queue_close_failure(&self, message: &str) {
        self.close_failures.lock().push_back(message.to_string());
    }

    /// When set, placements succeed but return an empty order id (the
    /// response-shape failure mode).
    pub fn set_blank_order_ids(&self, blank: bool) {
        self.blank_order_ids.store(blank, Ordering::SeqCst);
    }

    // -- inspection --------------------------------------------------------

    pub fn created_orders(&self) -> Vec<ExchangeOrder> {
        self.created.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<(String, String)> {
        self.cancelled.lock().clone()
    }

    pub fn cancelled_all_symbols(&self) -> Vec<String> {
        self.cancelled_all.lock().clone()
    }

    pub fn market_closes(&self) -> Vec<(String, TradeSide, f64, String)> {
        self.market_closes.lock().clone()
    }

    pub fn open_orders_snapshot(&self) -> Vec<ExchangeOrder> {
        self.open_orders.lock().clone()
    }

    // -- helpers -----------------------------------------------------------

    /// A reduce-only protective order in the venue's reported shape.
    pub fn protective_order(
        id: &str,
        symbol: &str,
        order_type: &str,
        stop_price: f64,
        amount: f64,
    ) -> ExchangeOrder {
        ExchangeOrder {
            order_id: id.to_string(),
            symbol: symbol.to_string(),
            order_type: order_type.to_string(),
            side: "SELL".to_string(),
            price: 0.0,
            amount,
            filled: 0.0,
            remaining: amount,
            status: "open".to_string(),
            reduce_only: true,
            stop_price: Some(stop_price),
            timestamp: String::new(),
        }
    }

    /// A resting (non-protective) limit order.
    pub fn limit_order(id: &str, symbol: &str, side: &str, price: f64, amount: f64) -> ExchangeOrder {
        ExchangeOrder {
            order_id: id.to_string(),
            symbol: symbol.to_string(),
            order_type: "LIMIT".to_string(),
            side: side.to_string(),
            price,
            amount,
            filled: 0.0,
            remaining: amount,
            status: "open".to_string(),
            reduce_only: false,
            stop_price: None,
            timestamp: String::new(),
        }
    }

    fn next_order_id(&self) -> String {
        if self.blank_order_ids.load(Ordering::SeqCst) {
            return String::new();
        }
        format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn take_failure(queue: &Mutex<VecDeque<String>>) -> Option<String> {
        queue.lock().pop_front()
    }

    fn record_placement(
        &self,
        symbol: &str,
        order_type: &str,
        side: TradeSide,
        amount: f64,
        price: f64,
        stop_price: Option<f64>,
        reduce_only: bool,
    ) -> Result<ExchangeOrder> {
        if let Some(message) = Self::take_failure(&self.place_failures) {
            anyhow::bail!(message);
        }

        let order = ExchangeOrder {
            order_id: self.next_order_id(),
            symbol: symbol.to_string(),
            order_type: order_type.to_string(),
            side: side.as_str().to_uppercase(),
            price,
            amount,
            filled: 0.0,
            remaining: amount,
            status: "open".to_string(),
            reduce_only,
            stop_price,
            timestamp: String::new(),
        };

        if !order.order_id.is_empty() {
            self.created.lock().push(order.clone());
            self.open_orders.lock().push(order.clone());
        }
        Ok(order)
    }
}

#[async_trait]
impl ExchangePort for MockExchange {
    async fn fetch_candles(&self, symbol: &str, _timeframe: &str, _limit: u32) -> Result<Vec<Candle>> {
        Ok(self.candles.lock().get(symbol).cloned().unwrap_or_default())
    }

    async fn get_free_balance(&self) -> Result<f64> {
        Ok(*self.free_balance.lock())
    }

    async fn get_full_balance(&self) -> Result<AccountBalance> {
        Ok(*self.full_balance.lock())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<PositionInfo>> {
        let wanted = normalize_symbol(symbol);
        Ok(self
            .positions
            .lock()
            .iter()
            .find(|p| normalize_symbol(&p.symbol) == wanted)
            .cloned())
    }

    async fn get_all_positions(&self) -> Result<Vec<PositionInfo>> {
        Ok(self.positions.lock().clone())
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<ExchangeOrder>> {
        let orders = self.open_orders.lock();
        Ok(match symbol {
            Some(s) => {
                let wanted = normalize_symbol(s);
                orders
                    .iter()
                    .filter(|o| normalize_symbol(&o.symbol) == wanted)
                    .cloned()
                    .collect()
            }
            None => orders.clone(),
        })
    }

    async fn get_order_status(&self, _symbol: &str, order_id: &str) -> Result<Option<ExchangeOrder>> {
        if let Some(scripted) = self.order_status.lock().get(order_id) {
            return Ok(Some(scripted.clone()));
        }
        Ok(self
            .open_orders
            .lock()
            .iter()
            .find(|o| o.order_id == order_id)
            .cloned())
    }

    async fn place_limit(
        &self,
        symbol: &str,
        side: TradeSide,
        amount: f64,
        price: f64,
    ) -> Result<ExchangeOrder> {
        self.record_placement(symbol, "LIMIT", side, amount, price, None, false)
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: TradeSide,
        amount: f64,
        stop_price: f64,
    ) -> Result<ExchangeOrder> {
        self.record_placement(symbol, "STOP_MARKET", side, amount, 0.0, Some(stop_price), true)
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: TradeSide,
        amount: f64,
        price: f64,
    ) -> Result<ExchangeOrder> {
        self.record_placement(
            symbol,
            "TAKE_PROFIT_MARKET",
            side,
            amount,
            0.0,
            Some(price),
            true,
        )
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool> {
        if let Some(message) = Self::take_failure(&self.cancel_failures) {
            anyhow::bail!(message);
        }
        self.cancelled
            .lock()
            .push((symbol.to_string(), order_id.to_string()));
        self.open_orders.lock().retain(|o| o.order_id != order_id);
        Ok(true)
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<bool> {
        self.cancelled_all.lock().push(symbol.to_string());
        let wanted = normalize_symbol(symbol);
        self.open_orders
            .lock()
            .retain(|o| normalize_symbol(&o.symbol) != wanted);
        Ok(true)
    }

    async fn close_position_market(
        &self,
        symbol: &str,
        side: TradeSide,
        amount: f64,
        reason: &str,
    ) -> Result<ExchangeOrder> {
        if let Some(message) = Self::take_failure(&self.close_failures) {
            anyhow::bail!(message);
        }
        self.market_closes
            .lock()
            .push((symbol.to_string(), side, amount, reason.to_string()));
        Ok(ExchangeOrder {
            order_id: self.next_order_id(),
            symbol: symbol.to_string(),
            order_type: "MARKET".to_string(),
            side: side.as_str().to_uppercase(),
            price: 0.0,
            amount,
            filled: amount,
            remaining: 0.0,
            status: "filled".to_string(),
            reduce_only: true,
            stop_price: None,
            timestamp: String::new(),
        })
    }

    async fn market_tick_size(&self, symbol: &str) -> Result<f64> {
        Ok(self
            .tick_sizes
            .lock()
            .get(&normalize_symbol(symbol))
            .copied()
            .unwrap_or(DEFAULT_TICK_SIZE))
    }

    async fn amount_to_precision(&self, _symbol: &str, amount: f64) -> Result<f64> {
        Ok(amount)
    }

    async fn price_to_precision(&self, _symbol: &str, price: f64) -> Result<f64> {
        Ok(price)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let mark = self.mark_prices.lock().get(&normalize_symbol(symbol)).copied();
        Ok(Ticker {
            mark_price: mark,
            last: None,
            close: None,
            info_mark_price: None,
        })
    }
}
