// =============================================================================
// Trade Planner — block geometry + free balance → entry/SL/TP/quantity
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::signal::OrderBlock;
use crate::types::{BlockKind, TradeSide};

/// Stop-loss buffer beyond the block edge (10 bps).
const SL_BUFFER: f64 = 0.001;

/// A fully parameterized entry the worker can hand to the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradePlan {
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub quantity: f64,
}

/// Compute a trade plan for `block` given the account's free balance.
///
/// Bullish blocks are bought at the top edge with the stop just under the
/// bottom edge; bearish blocks mirror that. The take-profit is the configured
/// reward-to-risk multiple of the stop distance, and quantity is sized so a
/// stop-out loses `risk_per_trade` percent of balance.
///
/// Returns `None` when the block geometry leaves no positive risk per unit.
pub fn compute_trade_plan(block: &OrderBlock, balance: f64, config: &Config) -> Option<TradePlan> {
    let risk_amount = balance * (config.risk_per_trade / 100.0);

    let (side, entry_price, stop_loss) = match block.kind {
        BlockKind::Bullish => {
            let entry = block.top;
            let sl = block.bottom * (1.0 - SL_BUFFER);
            (TradeSide::Buy, entry, sl)
        }
        BlockKind::Bearish => {
            let entry = block.bottom;
            let sl = block.top * (1.0 + SL_BUFFER);
            (TradeSide::Sell, entry, sl)
        }
    };

    let risk_per_unit = match side {
        TradeSide::Buy => entry_price - stop_loss,
        TradeSide::Sell => stop_loss - entry_price,
    };

    if risk_per_unit <= 0.0 {
        warn!(
            kind = ?block.kind,
            entry_price,
            stop_loss,
            "degenerate block geometry, no positive risk per unit"
        );
        return None;
    }

    let take_profit = match side {
        TradeSide::Buy => entry_price + risk_per_unit * config.rr_ratio,
        TradeSide::Sell => entry_price - risk_per_unit * config.rr_ratio,
    };

    Some(TradePlan {
        symbol: String::new(), // filled in by the caller
        side,
        entry_price,
        stop_loss,
        take_profit,
        quantity: risk_amount / risk_per_unit,
    })
}
