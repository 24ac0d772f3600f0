// =============================================================================
// Signal Detector — pivot/band order blocks on a candle window
// =============================================================================
//
// Pure function of the input window. A block is born when a confirmed pivot
// extremum also pierces a rolling band, and dies the first time price trades
// back into its interval after confirmation.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::exchange::Candle;
use crate::types::BlockKind;

/// Pivot lookback/lookforward used by the worker.
pub const PIVOT_LENGTH: usize = 5;

/// A candidate reaction zone marked by a confirmed pivot.
///
/// Invariant: `bottom <= top`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBlock {
    pub kind: BlockKind,
    pub top: f64,
    pub bottom: f64,
    /// Open time of the pivot candle, epoch milliseconds.
    pub pivot_time: i64,
    /// Index of the candle that confirmed the pivot (pivot index + length).
    pub confirm_index: usize,
}

impl OrderBlock {
    /// The price a limit entry would rest at: the top edge for bullish
    /// blocks, the bottom edge for bearish ones.
    pub fn entry_edge(&self) -> f64 {
        match self.kind {
            BlockKind::Bullish => self.top,
            BlockKind::Bearish => self.bottom,
        }
    }
}

/// Detect all currently unmitigated order blocks in `candles`.
///
/// `length` is the pivot lookback: a pivot at index `i` must be the extremum
/// of `[i-length, i+length]` and is only confirmed `length` candles later.
/// The rolling band spans `10·length` candles ending one candle before the
/// pivot; candidates without a full band window are ignored.
pub fn detect_order_blocks(candles: &[Candle], length: usize) -> Vec<OrderBlock> {
    let blocks = find_pivot_blocks(candles, length);
    drop_mitigated(blocks, candles)
}

/// First pass: confirmed pivots that pierce the band.
fn find_pivot_blocks(candles: &[Candle], length: usize) -> Vec<OrderBlock> {
    let n = candles.len();
    if length == 0 || n < 2 * length + 1 {
        return Vec::new();
    }

    let period = length * 10;
    let mut blocks = Vec::new();

    for i in length..n - length {
        // Band over the `period` candles strictly before `i`; no band, no
        // signal.
        if i < period {
            continue;
        }
        let band_window = &candles[i - period..i];
        let lower_band = band_window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
        let upper_band = band_window
            .iter()
            .map(|c| c.high)
            .fold(f64::NEG_INFINITY, f64::max);

        let pivot_window = &candles[i - length..=i + length];

        let window_low = pivot_window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
        if candles[i].low == window_low && candles[i].low < lower_band {
            blocks.push(OrderBlock {
                kind: BlockKind::Bullish,
                top: candles[i].high,
                bottom: candles[i].low,
                pivot_time: candles[i].timestamp,
                confirm_index: i + length,
            });
        }

        let window_high = pivot_window
            .iter()
            .map(|c| c.high)
            .fold(f64::NEG_INFINITY, f64::max);
        if candles[i].high == window_high && candles[i].high > upper_band {
            blocks.push(OrderBlock {
                kind: BlockKind::Bearish,
                top: candles[i].high,
                bottom: candles[i].low,
                pivot_time: candles[i].timestamp,
                confirm_index: i + length,
            });
        }
    }

    blocks
}

/// Second pass: drop every block that price has traded back into after its
/// confirmation candle. Blocks not yet past confirmation are retained.
fn drop_mitigated(blocks: Vec<OrderBlock>, candles: &[Candle]) -> Vec<OrderBlock> {
    let n = candles.len();
    blocks
        .into_iter()
        .filter(|block| {
            let start = block.confirm_index + 1;
            if start >= n {
                return true;
            }
            let mitigated = candles[start..].iter().any(|c| match block.kind {
                BlockKind::Bullish => c.low <= block.top,
                BlockKind::Bearish => c.high >= block.bottom,
            });
            !mitigated
        })
        .collect()
}

/// Pick the nearest block that price has not yet reached: bullish blocks
/// strictly below price, bearish blocks strictly above.
pub fn nearest_tradable_block(blocks: &[OrderBlock], current_price: f64) -> Option<&OrderBlock> {
    blocks
        .iter()
        .filter(|b| match b.kind {
            BlockKind::Bullish => current_price > b.top,
            BlockKind::Bearish => current_price < b.bottom,
        })
        .min_by(|a, b| {
            let da = (current_price - a.entry_edge()).abs();
            let db = (current_price - b.entry_edge()).abs();
            da.total_cmp(&db)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(i: usize, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: i as i64 * 60_000,
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn flat(i: usize) -> Candle {
        candle(i, 100.0, 101.0, 99.0, 100.0)
    }

    /// 30 flat candles with a deep pivot low at index 24 (length = 2,
    /// band period = 20).
    fn window_with_bullish_pivot() -> Vec<Candle> {
        let mut candles: Vec<Candle> = (0..30).map(flat).collect();
        candles[24] = candle(24, 94.0, 95.0, 90.0, 94.0);
        candles
    }

    #[test]
    fn detects_confirmed_bullish_block() {
        let candles = window_with_bullish_pivot();
        let blocks = detect_order_blocks(&candles, 2);

        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.kind, BlockKind::Bullish);
        assert_eq!(block.top, 95.0);
        assert_eq!(block.bottom, 90.0);
        assert_eq!(block.confirm_index, 26);
        assert_eq!(block.pivot_time, 24 * 60_000);
        assert!(block.bottom <= block.top);
    }

    #[test]
    fn detects_confirmed_bearish_block() {
        let mut candles: Vec<Candle> = (0..30).map(flat).collect();
        candles[24] = candle(24, 106.0, 110.0, 105.0, 106.0);
        let blocks = detect_order_blocks(&candles, 2);

        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.kind, BlockKind::Bearish);
        assert_eq!(block.top, 110.0);
        assert_eq!(block.bottom, 105.0);
        assert_eq!(block.confirm_index, 26);
    }

    #[test]
    fn pivot_without_band_pierce_is_ignored() {
        // A local low that stays inside the band is not a block.
        let mut candles: Vec<Candle> = (0..30).map(flat).collect();
        candles[24] = candle(24, 99.5, 100.5, 99.2, 99.5);
        assert!(detect_order_blocks(&candles, 2).is_empty());
    }

    #[test]
    fn pivot_inside_band_warmup_is_ignored() {
        // The pivot sits before a full band window exists.
        let mut candles: Vec<Candle> = (0..30).map(flat).collect();
        candles[10] = candle(10, 94.0, 95.0, 90.0, 94.0);
        // Index 10 < period 20, and the spike also poisons later band
        // minima, so nothing may fire.
        assert!(detect_order_blocks(&candles, 2).is_empty());
    }

    #[test]
    fn bullish_block_mitigated_by_later_low() {
        let block = OrderBlock {
            kind: BlockKind::Bullish,
            top: 50.0,
            bottom: 48.0,
            pivot_time: 0,
            confirm_index: 10,
        };
        let mut candles: Vec<Candle> = (0..15).map(|i| candle(i, 55.0, 56.0, 54.0, 55.0)).collect();
        // Candle 12 wicks down to 49.5, inside the block interval.
        candles[12] = candle(12, 55.0, 56.0, 49.5, 55.0);

        assert!(drop_mitigated(vec![block], &candles).is_empty());
    }

    #[test]
    fn bullish_block_survives_when_price_stays_above() {
        let block = OrderBlock {
            kind: BlockKind::Bullish,
            top: 50.0,
            bottom: 48.0,
            pivot_time: 0,
            confirm_index: 10,
        };
        let candles: Vec<Candle> = (0..15).map(|i| candle(i, 55.0, 56.0, 54.0, 55.0)).collect();

        assert_eq!(drop_mitigated(vec![block], &candles).len(), 1);
    }

    #[test]
    fn bearish_block_mitigated_by_later_high() {
        let block = OrderBlock {
            kind: BlockKind::Bearish,
            top: 110.0,
            bottom: 108.0,
            pivot_time: 0,
            confirm_index: 10,
        };
        let mut candles: Vec<Candle> =
            (0..15).map(|i| candle(i, 100.0, 101.0, 99.0, 100.0)).collect();
        candles[13] = candle(13, 100.0, 108.5, 99.0, 100.0);

        assert!(drop_mitigated(vec![block], &candles).is_empty());
    }

    #[test]
    fn candle_at_confirm_index_does_not_mitigate() {
        // Mitigation scanning starts strictly after the confirmation candle.
        let block = OrderBlock {
            kind: BlockKind::Bullish,
            top: 50.0,
            bottom: 48.0,
            pivot_time: 0,
            confirm_index: 10,
        };
        let mut candles: Vec<Candle> = (0..11).map(|i| candle(i, 55.0, 56.0, 54.0, 55.0)).collect();
        candles[10] = candle(10, 55.0, 56.0, 49.0, 55.0);

        assert_eq!(drop_mitigated(vec![block], &candles).len(), 1);
    }

    #[test]
    fn unconfirmed_block_is_retained() {
        let block = OrderBlock {
            kind: BlockKind::Bullish,
            top: 50.0,
            bottom: 48.0,
            pivot_time: 0,
            confirm_index: 20,
        };
        let candles: Vec<Candle> = (0..15).map(|i| candle(i, 40.0, 41.0, 39.0, 40.0)).collect();

        assert_eq!(drop_mitigated(vec![block], &candles).len(), 1);
    }

    #[test]
    fn nearest_block_respects_price_side() {
        let blocks = vec![
            OrderBlock {
                kind: BlockKind::Bullish,
                top: 95.0,
                bottom: 93.0,
                pivot_time: 0,
                confirm_index: 0,
            },
            OrderBlock {
                kind: BlockKind::Bullish,
                top: 98.0,
                bottom: 97.0,
                pivot_time: 0,
                confirm_index: 0,
            },
            OrderBlock {
                kind: BlockKind::Bearish,
                top: 112.0,
                bottom: 110.0,
                pivot_time: 0,
                confirm_index: 0,
            },
        ];

        // Price above both bullish blocks and below the bearish one: the
        // 98-top bullish block is closest.
        let best = nearest_tradable_block(&blocks, 100.0).unwrap();
        assert_eq!(best.top, 98.0);

        // Price below every bullish top: only the bearish block qualifies.
        let best = nearest_tradable_block(&blocks, 96.0).unwrap();
        assert_eq!(best.kind, BlockKind::Bearish);

        // Price inside the bearish block: nothing tradable above/below.
        assert!(nearest_tradable_block(&blocks, 111.0).is_none());
    }

    #[test]
    fn short_window_yields_nothing() {
        let candles: Vec<Candle> = (0..5).map(flat).collect();
        assert!(detect_order_blocks(&candles, 5).is_empty());
    }
}
