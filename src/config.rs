// =============================================================================
// Configuration — environment-driven settings for the Orion engine
// =============================================================================
//
// Every tunable lives here. Values come from the process environment (loaded
// via dotenv in main) with defaults matching the documented behavior, so a
// bare `.env` with only exchange credentials is a valid deployment.
// =============================================================================

use std::time::Duration;

use tracing::{info, warn};

use crate::types::FallbackMode;

/// Top-level runtime configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Exchange credentials ------------------------------------------------
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,

    // --- Trading settings ----------------------------------------------------
    /// Candle timeframe used by the signal detector (e.g. "30m").
    pub timeframe: String,
    /// Reward-to-risk multiple from entry to take-profit.
    pub rr_ratio: f64,
    /// Percent of free balance risked per trade (1.0 == 1 %).
    pub risk_per_trade: f64,
    /// Instruments the worker scans, in settlement-suffixed form
    /// (e.g. "BTC/USDC:USDC").
    pub trading_pairs: Vec<String>,

    // --- Reconciliation settings --------------------------------------------
    /// Seconds between periodic position/TP-SL reconciliation sweeps.
    pub position_reconciliation_interval: u64,
    /// Pending limit entries older than this are force-canceled.
    pub pending_order_stale_seconds: u64,
    /// Relative tolerance when matching protective-order quantities (0.01 == 1 %).
    pub tp_sl_quantity_tolerance: f64,
    /// Ticks of headroom applied to crossed-price checks.
    pub tp_sl_buffer_ticks: f64,
    /// Per-symbol backoff window after a TP/SL placement failure.
    pub tp_sl_pending_backoff_seconds: u64,
    /// Behavior when a TP/SL price is already crossed at placement time.
    pub tp_sl_fallback_mode: FallbackMode,
    /// Seconds to let the exchange catch up after a TP/SL placement before
    /// re-evaluating the same position.
    pub tp_sl_placement_cooldown_seconds: i64,

    // --- Active monitoring ---------------------------------------------------
    /// Master switch for the breach safety net.
    pub enable_active_tp_sl_monitoring: bool,
    /// Delay between consecutive forced closures, to stay under rate limits.
    pub forced_closure_rate_limit_delay: Duration,

    // --- Process -------------------------------------------------------------
    /// HTTP API bind address.
    pub bind_addr: String,
    /// Seconds between worker cycles.
    pub cycle_seconds: u64,
}

fn default_trading_pairs() -> Vec<String> {
    vec![
        "BTC/USDC:USDC".to_string(),
        "ETH/USDC:USDC".to_string(),
        "SOL/USDC:USDC".to_string(),
    ]
}

/// Read an environment variable and parse it, falling back to `default` on
/// absence or parse failure (parse failures are logged).
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "unparseable config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Config {
    /// Resolve the full configuration from the process environment.
    pub fn from_env() -> Self {
        let trading_pairs = match std::env::var("TRADING_PAIRS") {
            Ok(raw) => {
                let pairs: Vec<String> = raw
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if pairs.is_empty() {
                    default_trading_pairs()
                } else {
                    pairs
                }
            }
            Err(_) => default_trading_pairs(),
        };

        let fallback_mode = FallbackMode::parse(
            &std::env::var("TP_SL_FALLBACK_MODE").unwrap_or_else(|_| "MARKET_REDUCE".into()),
        );

        let config = Self {
            api_key: std::env::var("BINANCE_API_KEY").unwrap_or_default(),
            api_secret: std::env::var("BINANCE_API_SECRET").unwrap_or_default(),
            testnet: env_bool("BINANCE_TESTNET", false),

            timeframe: std::env::var("TIMEFRAME").unwrap_or_else(|_| "30m".into()),
            rr_ratio: env_parse("RR_RATIO", 2.0),
            risk_per_trade: env_parse("RISK_PER_TRADE", 1.0),
            trading_pairs,

            position_reconciliation_interval: env_parse("POSITION_RECONCILIATION_INTERVAL", 600),
            pending_order_stale_seconds: env_parse("PENDING_ORDER_STALE_SECONDS", 3600),
            tp_sl_quantity_tolerance: env_parse("TP_SL_QUANTITY_TOLERANCE", 0.01),
            tp_sl_buffer_ticks: env_parse("TP_SL_BUFFER_TICKS", 1.0),
            tp_sl_pending_backoff_seconds: env_parse("TP_SL_PENDING_BACKOFF_SECONDS", 60),
            tp_sl_fallback_mode: fallback_mode,
            tp_sl_placement_cooldown_seconds: env_parse("TP_SL_PLACEMENT_COOLDOWN_SECONDS", 30),

            enable_active_tp_sl_monitoring: env_bool("ENABLE_ACTIVE_TP_SL_MONITORING", true),
            forced_closure_rate_limit_delay: Duration::from_secs_f64(env_parse(
                "FORCED_CLOSURE_RATE_LIMIT_DELAY",
                0.5,
            )),

            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".into()),
            cycle_seconds: env_parse("CYCLE_SECONDS", 120),
        };

        info!(
            pairs = ?config.trading_pairs,
            timeframe = %config.timeframe,
            rr_ratio = config.rr_ratio,
            risk_per_trade = config.risk_per_trade,
            testnet = config.testnet,
            "configuration resolved"
        );

        config
    }
}

impl Default for Config {
    /// Defaults used by tests; identical to `from_env` with an empty
    /// environment.
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            testnet: false,
            timeframe: "30m".into(),
            rr_ratio: 2.0,
            risk_per_trade: 1.0,
            trading_pairs: default_trading_pairs(),
            position_reconciliation_interval: 600,
            pending_order_stale_seconds: 3600,
            tp_sl_quantity_tolerance: 0.01,
            tp_sl_buffer_ticks: 1.0,
            tp_sl_pending_backoff_seconds: 60,
            tp_sl_fallback_mode: FallbackMode::MarketReduce,
            tp_sl_placement_cooldown_seconds: 30,
            enable_active_tp_sl_monitoring: true,
            forced_closure_rate_limit_delay: Duration::from_secs_f64(0.5),
            bind_addr: "0.0.0.0:8000".into(),
            cycle_seconds: 120,
        }
    }
}
