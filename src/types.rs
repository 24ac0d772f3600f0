// =============================================================================
// Shared types used across the Orion trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of an entry order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of an open position as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn is_long(self) -> bool {
        matches!(self, Self::Long)
    }

    /// The order side that closes a position on this side.
    pub fn closing_side(self) -> TradeSide {
        match self {
            Self::Long => TradeSide::Sell,
            Self::Short => TradeSide::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a detected order block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Bullish,
    Bearish,
}

/// Lifecycle state of a trade-history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

/// What to do when a TP or SL price has already been crossed at placement
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallbackMode {
    /// Close the position immediately with a market reduce-only order.
    MarketReduce,
    /// Skip placement and leave the position unprotected.
    None,
}

impl FallbackMode {
    /// Parse the `TP_SL_FALLBACK_MODE` environment value. Unknown values fall
    /// back to `MarketReduce`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "NONE" => Self::None,
            _ => Self::MarketReduce,
        }
    }
}
