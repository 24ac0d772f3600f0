// =============================================================================
// Order helpers — tick math, tolerance matching, symbol normalization
// =============================================================================
//
// Everything in this module is pure. Price comparisons in the engine go
// through `prices_are_equal`, never `==`: exchanges round to tick and the
// bot must treat tick-level differences as equal.
// =============================================================================

use crate::exchange::{ExchangeOrder, Ticker};
use crate::types::PositionSide;

/// Relative price tolerance used when matching protective orders (0.1 %).
pub const PRICE_TOLERANCE_PCT: f64 = 0.001;

/// Tick size used when market metadata is unavailable.
pub const DEFAULT_TICK_SIZE: f64 = 1e-8;

// ---------------------------------------------------------------------------
// Symbol normalization
// ---------------------------------------------------------------------------

/// Normalize a trading symbol for comparison across sources.
///
/// Venues disagree on settlement suffixes: an order feed may report
/// "BTC/USDC" while the position feed says "BTC/USDC:USDC". Upper-case and
/// strip everything after `:` so both compare equal. Idempotent.
pub fn normalize_symbol(symbol: &str) -> String {
    let trimmed = symbol.trim();
    let base = match trimmed.find(':') {
        Some(idx) => &trimmed[..idx],
        None => trimmed,
    };
    base.to_uppercase()
}

// ---------------------------------------------------------------------------
// Tick math
// ---------------------------------------------------------------------------

/// Round a price to the nearest valid tick, half-up on the tick ratio.
///
/// The final result is cleaned to 10 decimal places so that binary-float
/// noise from the multiplication does not survive into order payloads.
pub fn round_to_tick(value: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return value;
    }
    let ticks = (value / tick_size).round();
    let raw = ticks * tick_size;
    (raw * 1e10).round() / 1e10
}

// ---------------------------------------------------------------------------
// Tolerance comparisons
// ---------------------------------------------------------------------------

/// Relative approximate equality.
///
/// Both-zero compares equal; exactly one zero does not (a zero quantity or
/// price is "unset", never a near-match for a real value).
pub fn approx_equal(a: f64, b: f64, pct_tol: f64) -> bool {
    if a == 0.0 && b == 0.0 {
        return true;
    }
    if a == 0.0 || b == 0.0 {
        return false;
    }
    (a - b).abs() <= pct_tol * a.abs().max(b.abs())
}

/// Whether two prices are equal within `max(tick, pct·max(|a|,|b|))`.
pub fn prices_are_equal(a: f64, b: f64, tick_size: f64, pct: f64) -> bool {
    let tolerance = tick_size.max(pct * a.abs().max(b.abs()));
    (a - b).abs() <= tolerance
}

/// Whether an existing order already satisfies a protective-order target.
///
/// The stop price (falling back to the limit price) must match
/// `target_price` within price tolerance, and the working quantity must
/// match `target_qty` within `qty_tol`.
pub fn order_matches_target(
    order: &ExchangeOrder,
    target_price: f64,
    target_qty: f64,
    tick_size: f64,
    qty_tol: f64,
) -> bool {
    let order_price = order.effective_price();
    if order_price == 0.0 || target_price == 0.0 {
        return false;
    }
    if !prices_are_equal(order_price, target_price, tick_size, PRICE_TOLERANCE_PCT) {
        return false;
    }
    approx_equal(order.effective_quantity(), target_qty, qty_tol)
}

// ---------------------------------------------------------------------------
// Ticker / position field extraction
// ---------------------------------------------------------------------------

/// Best-effort mark price from a ticker: mark price, then last, then close,
/// then the vendor-specific nested mark price. Zero fields are skipped.
pub fn mark_price_from_ticker(ticker: &Ticker) -> Option<f64> {
    [
        ticker.mark_price,
        ticker.last,
        ticker.close,
        ticker.info_mark_price,
    ]
    .into_iter()
    .flatten()
    .find(|p| *p > 0.0)
}

/// Resolve the canonical position side.
///
/// An explicit side field wins when it resolves to a known direction
/// (case-insensitive, accepting order-side spellings). Otherwise the sign of
/// the contract count decides; zero defaults to long.
pub fn resolve_position_side(explicit: Option<&str>, contracts: f64) -> PositionSide {
    if let Some(raw) = explicit {
        match raw.trim().to_uppercase().as_str() {
            "LONG" | "BUY" => return PositionSide::Long,
            "SHORT" | "SELL" => return PositionSide::Short,
            _ => {}
        }
    }
    if contracts < 0.0 {
        PositionSide::Short
    } else {
        PositionSide::Long
    }
}
