// =============================================================================
// Exchange Port — narrow async interface between the engine and the venue
// =============================================================================
//
// The engine never sees raw exchange payloads. Every implementation coerces
// venue responses into the normalized records below at the boundary, so the
// reconciliation logic works with one fixed shape regardless of vendor quirks.
// =============================================================================

pub mod binance;

#[cfg(test)]
pub mod mock;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::TradeSide;

// ---------------------------------------------------------------------------
// Normalized records
// ---------------------------------------------------------------------------

/// A single OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Open time, epoch milliseconds.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Account balance snapshot in the settlement currency.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccountBalance {
    pub total: f64,
    pub free: f64,
    pub used: f64,
}

/// Best-effort ticker fields used for mark-price extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ticker {
    #[serde(default)]
    pub mark_price: Option<f64>,
    #[serde(default)]
    pub last: Option<f64>,
    #[serde(default)]
    pub close: Option<f64>,
    /// Vendor-specific mark price nested under `info`.
    #[serde(default)]
    pub info_mark_price: Option<f64>,
}

/// Order types that represent a protective (stop or take-profit) leg.
pub const TP_SL_ORDER_TYPES: [&str; 6] = [
    "STOP",
    "STOP_MARKET",
    "STOP_LIMIT",
    "TAKE_PROFIT",
    "TAKE_PROFIT_MARKET",
    "TAKE_PROFIT_LIMIT",
];

/// An open or historical order, normalized from the venue's wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub symbol: String,
    /// Upper-cased order type, e.g. "LIMIT", "STOP_MARKET".
    pub order_type: String,
    /// Upper-cased side, "BUY" or "SELL".
    pub side: String,
    pub price: f64,
    pub amount: f64,
    pub filled: f64,
    pub remaining: f64,
    /// Lower-cased status: "open", "filled", "canceled", "expired",
    /// "rejected", "partially_filled".
    pub status: String,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub timestamp: String,
}

impl ExchangeOrder {
    /// Whether the order type belongs to the protective TP/SL family.
    pub fn is_tp_sl_type(&self) -> bool {
        TP_SL_ORDER_TYPES.contains(&self.order_type.as_str())
    }

    /// Whether this order is a stop-loss leg. Ambiguous bare "STOP" types
    /// count only when they carry a non-zero stop price.
    pub fn is_stop_loss_like(&self) -> bool {
        match self.order_type.as_str() {
            "STOP_MARKET" | "STOP_LIMIT" => true,
            "STOP" => self.stop_price.unwrap_or(0.0) != 0.0,
            _ => false,
        }
    }

    /// Whether this order is a take-profit leg.
    pub fn is_take_profit_like(&self) -> bool {
        match self.order_type.as_str() {
            "TAKE_PROFIT_MARKET" | "TAKE_PROFIT_LIMIT" => true,
            "TAKE_PROFIT" => self.stop_price.unwrap_or(0.0) != 0.0,
            _ => false,
        }
    }

    /// The price the order actually triggers or executes at: stop price when
    /// present and non-zero, else the limit price.
    pub fn effective_price(&self) -> f64 {
        match self.stop_price {
            Some(p) if p != 0.0 => p,
            _ => self.price,
        }
    }

    /// Quantity still working on the book: remaining when non-zero, else the
    /// full amount (some venues omit `remaining` on conditional orders).
    pub fn effective_quantity(&self) -> f64 {
        if self.remaining > 0.0 {
            self.remaining
        } else {
            self.amount
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status.as_str(), "open" | "partially_filled" | "new")
    }

    pub fn is_filled(&self) -> bool {
        self.status == "filled"
    }

    /// Terminal without a fill: canceled, expired, or rejected.
    pub fn is_dead(&self) -> bool {
        matches!(self.status.as_str(), "canceled" | "cancelled" | "expired" | "rejected")
    }
}

/// An open position as reported by the venue, before side resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    /// Explicit side field when the venue provides one ("LONG"/"SHORT",
    /// sometimes "BUY"/"SELL").
    #[serde(default)]
    pub side: Option<String>,
    /// Signed contract count; sign encodes direction when `side` is absent.
    pub contracts: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub leverage: f64,
}

// ---------------------------------------------------------------------------
// Port trait
// ---------------------------------------------------------------------------

/// The narrow exchange interface the engine consumes.
///
/// All methods are fallible; transient-failure retry policy lives in the
/// execution layer, not in implementations.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    async fn fetch_candles(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>>;

    async fn get_free_balance(&self) -> Result<f64>;
    async fn get_full_balance(&self) -> Result<AccountBalance>;

    async fn get_position(&self, symbol: &str) -> Result<Option<PositionInfo>>;
    async fn get_all_positions(&self) -> Result<Vec<PositionInfo>>;

    /// Open orders for one symbol, or all symbols when `symbol` is `None`.
    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<ExchangeOrder>>;
    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<Option<ExchangeOrder>>;

    async fn place_limit(
        &self,
        symbol: &str,
        side: TradeSide,
        amount: f64,
        price: f64,
    ) -> Result<ExchangeOrder>;

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: TradeSide,
        amount: f64,
        stop_price: f64,
    ) -> Result<ExchangeOrder>;

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: TradeSide,
        amount: f64,
        price: f64,
    ) -> Result<ExchangeOrder>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool>;
    async fn cancel_all_orders(&self, symbol: &str) -> Result<bool>;

    /// Market close with the reduce-only flag; implementations retry once
    /// without the flag on a reduce-only rejection.
    async fn close_position_market(
        &self,
        symbol: &str,
        side: TradeSide,
        amount: f64,
        reason: &str,
    ) -> Result<ExchangeOrder>;

    async fn market_tick_size(&self, symbol: &str) -> Result<f64>;
    async fn amount_to_precision(&self, symbol: &str, amount: f64) -> Result<f64>;
    async fn price_to_precision(&self, symbol: &str, price: f64) -> Result<f64>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(order_type: &str, stop_price: Option<f64>) -> ExchangeOrder {
        ExchangeOrder {
            order_id: "1".into(),
            symbol: "BTC/USDC".into(),
            order_type: order_type.into(),
            side: "SELL".into(),
            price: 0.0,
            amount: 1.0,
            filled: 0.0,
            remaining: 1.0,
            status: "open".into(),
            reduce_only: true,
            stop_price,
            timestamp: String::new(),
        }
    }

    #[test]
    fn protective_type_classification() {
        assert!(order("STOP_MARKET", Some(100.0)).is_stop_loss_like());
        assert!(order("STOP_LIMIT", None).is_stop_loss_like());
        assert!(order("STOP", Some(100.0)).is_stop_loss_like());
        assert!(!order("STOP", None).is_stop_loss_like());
        assert!(!order("STOP", Some(0.0)).is_stop_loss_like());

        assert!(order("TAKE_PROFIT_MARKET", None).is_take_profit_like());
        assert!(order("TAKE_PROFIT", Some(50.0)).is_take_profit_like());
        assert!(!order("TAKE_PROFIT", None).is_take_profit_like());
        assert!(!order("LIMIT", None).is_take_profit_like());
    }

    #[test]
    fn effective_price_prefers_stop_price() {
        let mut o = order("STOP_MARKET", Some(45000.0));
        o.price = 44000.0;
        assert_eq!(o.effective_price(), 45000.0);

        let mut o = order("LIMIT", None);
        o.price = 44000.0;
        assert_eq!(o.effective_price(), 44000.0);

        // Zero stop price means "not set" on some venues.
        let mut o = order("STOP", Some(0.0));
        o.price = 44000.0;
        assert_eq!(o.effective_price(), 44000.0);
    }

    #[test]
    fn status_predicates() {
        let mut o = order("LIMIT", None);
        o.status = "open".into();
        assert!(o.is_open() && !o.is_filled() && !o.is_dead());
        o.status = "filled".into();
        assert!(o.is_filled() && !o.is_open());
        o.status = "expired".into();
        assert!(o.is_dead());
        o.status = "canceled".into();
        assert!(o.is_dead());
    }
}
