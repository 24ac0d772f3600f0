// =============================================================================
// Binance USD-M Futures client — HMAC-SHA256 signed REST implementation
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift.
//
// Symbols are configured in settlement-suffixed form ("BTC/USDC:USDC") and
// resolved to raw API symbols ("BTCUSDC") at this boundary; every outward
// record carries the configured form so the engine compares one spelling.
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::exchange::{AccountBalance, Candle, ExchangePort, ExchangeOrder, PositionInfo, Ticker};
use crate::order_utils::{round_to_tick, DEFAULT_TICK_SIZE};
use crate::types::TradeSide;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const MAINNET_URL: &str = "https://fapi.binance.com";
const TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Per-symbol market metadata pulled from exchangeInfo filters.
#[derive(Debug, Clone, Copy)]
struct MarketFilters {
    tick_size: f64,
    step_size: f64,
}

/// Binance USD-M futures REST client.
pub struct BinanceFuturesClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    /// raw API symbol → configured symbol, for boundary back-mapping.
    aliases: HashMap<String, String>,
    /// Cached exchangeInfo filters keyed by raw symbol.
    filters: RwLock<HashMap<String, MarketFilters>>,
}

/// Resolve a configured symbol ("BTC/USDC:USDC") to the raw API form
/// ("BTCUSDC").
fn to_raw_symbol(symbol: &str) -> String {
    let base = match symbol.find(':') {
        Some(idx) => &symbol[..idx],
        None => symbol,
    };
    base.replace('/', "").trim().to_uppercase()
}

/// Map a Binance order status onto the normalized lower-case set.
fn normalize_status(raw: &str) -> String {
    match raw {
        "NEW" => "open",
        "PARTIALLY_FILLED" => "partially_filled",
        "FILLED" => "filled",
        "CANCELED" => "canceled",
        "REJECTED" => "rejected",
        "EXPIRED" | "EXPIRED_IN_MATCH" => "expired",
        other => {
            return other.to_lowercase();
        }
    }
    .to_string()
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &Value) -> f64 {
    if let Some(s) = val.as_str() {
        s.parse().unwrap_or(0.0)
    } else {
        val.as_f64().unwrap_or(0.0)
    }
}

/// Whether an error message indicates the venue rejected the reduce-only
/// flag (position already flat or flag unsupported in the current mode).
pub fn is_reduce_only_rejection(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("-2022") || lower.contains("reduceonly") || lower.contains("reduce-only")
}

impl BinanceFuturesClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a client. `trading_pairs` seeds the raw→configured symbol map
    /// so responses keyed by raw symbols come back in configured form.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        testnet: bool,
        trading_pairs: &[String],
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let aliases = trading_pairs
            .iter()
            .map(|p| (to_raw_symbol(p), p.clone()))
            .collect();

        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL };
        info!(base_url, testnet, "futures client initialised");

        Self {
            api_key,
            secret,
            base_url: base_url.to_string(),
            client,
            aliases,
            filters: RwLock::new(HashMap::new()),
        }
    }

    /// The configured spelling for a raw API symbol, falling back to raw.
    fn display_symbol(&self, raw: &str) -> String {
        self.aliases.get(raw).cloned().unwrap_or_else(|| raw.to_string())
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
    ) -> Result<Value> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let resp = self
            .client
            .request(method.clone(), &url)
            .send()
            .await
            .with_context(|| format!("{method} {path} request failed"))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("{method} {path} returned {status}: {body}");
        }
        Ok(body)
    }

    async fn signed(&self, method: reqwest::Method, path: &str, params: &str) -> Result<Value> {
        let query = self.signed_query(params);
        self.request(method, path, &query).await
    }

    // -------------------------------------------------------------------------
    // Normalization
    // -------------------------------------------------------------------------

    fn normalize_order(&self, raw: &Value) -> ExchangeOrder {
        let order_id = raw
            .get("orderId")
            .map(|v| {
                v.as_u64()
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| v.as_str().unwrap_or_default().to_string())
            })
            .unwrap_or_default();

        let raw_symbol = raw.get("symbol").and_then(Value::as_str).unwrap_or_default();
        let amount = parse_str_f64(raw.get("origQty").unwrap_or(&Value::Null));
        let filled = parse_str_f64(raw.get("executedQty").unwrap_or(&Value::Null));
        let stop_price = parse_str_f64(raw.get("stopPrice").unwrap_or(&Value::Null));

        ExchangeOrder {
            order_id,
            symbol: self.display_symbol(raw_symbol),
            order_type: raw
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_uppercase(),
            side: raw
                .get("side")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_uppercase(),
            price: parse_str_f64(raw.get("price").unwrap_or(&Value::Null)),
            amount,
            filled,
            remaining: (amount - filled).max(0.0),
            status: normalize_status(raw.get("status").and_then(Value::as_str).unwrap_or_default()),
            reduce_only: raw.get("reduceOnly").and_then(Value::as_bool).unwrap_or(false),
            stop_price: (stop_price != 0.0).then_some(stop_price),
            timestamp: raw
                .get("updateTime")
                .or_else(|| raw.get("time"))
                .and_then(Value::as_i64)
                .map(|t| t.to_string())
                .unwrap_or_default(),
        }
    }

    async fn market_filters(&self, raw_symbol: &str) -> MarketFilters {
        if let Some(cached) = self.filters.read().get(raw_symbol) {
            return *cached;
        }

        let fallback = MarketFilters {
            tick_size: DEFAULT_TICK_SIZE,
            step_size: 0.0,
        };

        let info = match self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/exchangeInfo",
                &format!("symbol={raw_symbol}"),
            )
            .await
        {
            Ok(body) => body,
            Err(e) => {
                warn!(symbol = raw_symbol, error = %e, "exchangeInfo fetch failed, using default tick");
                return fallback;
            }
        };

        let symbol_info = info["symbols"].as_array().and_then(|arr| arr.first());
        let filters_arr = symbol_info
            .and_then(|s| s.get("filters"))
            .and_then(Value::as_array);

        let mut resolved = fallback;
        if let Some(filters) = filters_arr {
            for f in filters {
                match f.get("filterType").and_then(Value::as_str) {
                    Some("PRICE_FILTER") => {
                        let tick = parse_str_f64(f.get("tickSize").unwrap_or(&Value::Null));
                        if tick > 0.0 {
                            resolved.tick_size = tick;
                        }
                    }
                    Some("LOT_SIZE") => {
                        resolved.step_size =
                            parse_str_f64(f.get("stepSize").unwrap_or(&Value::Null));
                    }
                    _ => {}
                }
            }
        } else {
            warn!(symbol = raw_symbol, "market metadata missing, using default tick");
        }

        self.filters.write().insert(raw_symbol.to_string(), resolved);
        resolved
    }

    /// Submit an order. Optional fields are appended only when present so the
    /// same path serves limit, conditional, and market orders.
    #[allow(clippy::too_many_arguments)]
    async fn submit_order(
        &self,
        raw_symbol: &str,
        side: TradeSide,
        order_type: &str,
        quantity: f64,
        price: Option<f64>,
        stop_price: Option<f64>,
        reduce_only: bool,
    ) -> Result<ExchangeOrder> {
        let side_str = side.as_str().to_uppercase();
        let client_order_id = format!("orion-{}", Uuid::new_v4().simple());
        let mut params = format!(
            "symbol={raw_symbol}&side={side_str}&type={order_type}&quantity={quantity}&newClientOrderId={client_order_id}"
        );
        if let Some(p) = price {
            params.push_str(&format!("&price={p}&timeInForce=GTC"));
        }
        if let Some(sp) = stop_price {
            params.push_str(&format!("&stopPrice={sp}"));
        }
        if reduce_only {
            params.push_str("&reduceOnly=true");
        }

        debug!(symbol = raw_symbol, side = %side_str, order_type, quantity, "placing order");

        let body = self
            .signed(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;

        Ok(self.normalize_order(&body))
    }
}

#[async_trait]
impl ExchangePort for BinanceFuturesClient {
    #[instrument(skip(self), name = "binance::fetch_candles")]
    async fn fetch_candles(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>> {
        let raw_symbol = to_raw_symbol(symbol);
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/klines",
                &format!("symbol={raw_symbol}&interval={timeframe}&limit={limit}"),
            )
            .await?;

        let rows = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let arr = match row.as_array() {
                Some(a) if a.len() >= 6 => a,
                _ => {
                    warn!(symbol, "skipping malformed kline entry");
                    continue;
                }
            };
            candles.push(Candle {
                timestamp: arr[0].as_i64().unwrap_or(0),
                open: parse_str_f64(&arr[1]),
                high: parse_str_f64(&arr[2]),
                low: parse_str_f64(&arr[3]),
                close: parse_str_f64(&arr[4]),
                volume: parse_str_f64(&arr[5]),
            });
        }

        debug!(symbol, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "binance::get_free_balance")]
    async fn get_free_balance(&self) -> Result<f64> {
        Ok(self.get_full_balance().await?.free)
    }

    #[instrument(skip(self), name = "binance::get_full_balance")]
    async fn get_full_balance(&self) -> Result<AccountBalance> {
        let body = self
            .signed(reqwest::Method::GET, "/fapi/v2/account", "")
            .await?;

        let total = parse_str_f64(body.get("totalMarginBalance").unwrap_or(&Value::Null));
        let free = parse_str_f64(body.get("availableBalance").unwrap_or(&Value::Null));

        Ok(AccountBalance {
            total,
            free,
            used: (total - free).max(0.0),
        })
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<PositionInfo>> {
        let wanted = to_raw_symbol(symbol);
        let positions = self.get_all_positions().await?;
        Ok(positions
            .into_iter()
            .find(|p| to_raw_symbol(&p.symbol) == wanted))
    }

    #[instrument(skip(self), name = "binance::get_all_positions")]
    async fn get_all_positions(&self) -> Result<Vec<PositionInfo>> {
        let body = self
            .signed(reqwest::Method::GET, "/fapi/v2/positionRisk", "")
            .await?;

        let rows = body.as_array().context("positionRisk response is not an array")?;
        let mut positions = Vec::new();
        for row in rows {
            let contracts = parse_str_f64(row.get("positionAmt").unwrap_or(&Value::Null));
            if contracts == 0.0 {
                continue;
            }
            let raw_symbol = row.get("symbol").and_then(Value::as_str).unwrap_or_default();
            positions.push(PositionInfo {
                symbol: self.display_symbol(raw_symbol),
                side: row
                    .get("positionSide")
                    .and_then(Value::as_str)
                    .filter(|s| *s != "BOTH")
                    .map(str::to_string),
                contracts,
                entry_price: parse_str_f64(row.get("entryPrice").unwrap_or(&Value::Null)),
                mark_price: parse_str_f64(row.get("markPrice").unwrap_or(&Value::Null)),
                unrealized_pnl: parse_str_f64(row.get("unRealizedProfit").unwrap_or(&Value::Null)),
                leverage: parse_str_f64(row.get("leverage").unwrap_or(&Value::Null)).max(1.0),
            });
        }

        debug!(count = positions.len(), "positions fetched");
        Ok(positions)
    }

    #[instrument(skip(self), name = "binance::get_open_orders")]
    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<ExchangeOrder>> {
        let params = match symbol {
            Some(s) => format!("symbol={}", to_raw_symbol(s)),
            None => String::new(),
        };
        let body = self
            .signed(reqwest::Method::GET, "/fapi/v1/openOrders", &params)
            .await?;

        let orders = body
            .as_array()
            .context("openOrders response is not an array")?
            .iter()
            .map(|o| self.normalize_order(o))
            .collect::<Vec<_>>();

        debug!(count = orders.len(), "open orders fetched");
        Ok(orders)
    }

    #[instrument(skip(self), name = "binance::get_order_status")]
    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<Option<ExchangeOrder>> {
        let raw_symbol = to_raw_symbol(symbol);
        let result = self
            .signed(
                reqwest::Method::GET,
                "/fapi/v1/order",
                &format!("symbol={raw_symbol}&orderId={order_id}"),
            )
            .await;

        match result {
            Ok(body) => Ok(Some(self.normalize_order(&body))),
            Err(e) => {
                // -2013: order does not exist. Callers treat that as a
                // terminal answer, not an error.
                if e.to_string().contains("-2013") {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn place_limit(
        &self,
        symbol: &str,
        side: TradeSide,
        amount: f64,
        price: f64,
    ) -> Result<ExchangeOrder> {
        let raw = to_raw_symbol(symbol);
        self.submit_order(&raw, side, "LIMIT", amount, Some(price), None, false)
            .await
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: TradeSide,
        amount: f64,
        stop_price: f64,
    ) -> Result<ExchangeOrder> {
        let raw = to_raw_symbol(symbol);
        self.submit_order(&raw, side, "STOP_MARKET", amount, None, Some(stop_price), true)
            .await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: TradeSide,
        amount: f64,
        price: f64,
    ) -> Result<ExchangeOrder> {
        let raw = to_raw_symbol(symbol);
        self.submit_order(&raw, side, "TAKE_PROFIT_MARKET", amount, None, Some(price), true)
            .await
    }

    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool> {
        let raw_symbol = to_raw_symbol(symbol);
        self.signed(
            reqwest::Method::DELETE,
            "/fapi/v1/order",
            &format!("symbol={raw_symbol}&orderId={order_id}"),
        )
        .await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(true)
    }

    #[instrument(skip(self), name = "binance::cancel_all_orders")]
    async fn cancel_all_orders(&self, symbol: &str) -> Result<bool> {
        let raw_symbol = to_raw_symbol(symbol);
        self.signed(
            reqwest::Method::DELETE,
            "/fapi/v1/allOpenOrders",
            &format!("symbol={raw_symbol}"),
        )
        .await?;
        debug!(symbol, "all orders cancelled");
        Ok(true)
    }

    #[instrument(skip(self), name = "binance::close_position_market")]
    async fn close_position_market(
        &self,
        symbol: &str,
        side: TradeSide,
        amount: f64,
        reason: &str,
    ) -> Result<ExchangeOrder> {
        let raw = to_raw_symbol(symbol);
        info!(symbol, %side, amount, reason, "submitting market close");

        match self
            .submit_order(&raw, side, "MARKET", amount, None, None, true)
            .await
        {
            Ok(order) => Ok(order),
            Err(e) if is_reduce_only_rejection(&e.to_string()) => {
                warn!(symbol, error = %e, "reduce-only rejected, retrying without flag");
                self.submit_order(&raw, side, "MARKET", amount, None, None, false)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn market_tick_size(&self, symbol: &str) -> Result<f64> {
        Ok(self.market_filters(&to_raw_symbol(symbol)).await.tick_size)
    }

    async fn amount_to_precision(&self, symbol: &str, amount: f64) -> Result<f64> {
        let step = self.market_filters(&to_raw_symbol(symbol)).await.step_size;
        if step <= 0.0 {
            return Ok(amount);
        }
        // Amounts floor to the step so an order never exceeds the intended
        // size.
        let floored = (amount / step).floor() * step;
        Ok((floored * 1e10).round() / 1e10)
    }

    async fn price_to_precision(&self, symbol: &str, price: f64) -> Result<f64> {
        let tick = self.market_filters(&to_raw_symbol(symbol)).await.tick_size;
        Ok(round_to_tick(price, tick))
    }

    #[instrument(skip(self), name = "binance::fetch_ticker")]
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let raw_symbol = to_raw_symbol(symbol);
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/premiumIndex",
                &format!("symbol={raw_symbol}"),
            )
            .await?;

        let mark = parse_str_f64(body.get("markPrice").unwrap_or(&Value::Null));
        let index = parse_str_f64(body.get("indexPrice").unwrap_or(&Value::Null));

        Ok(Ticker {
            mark_price: (mark > 0.0).then_some(mark),
            last: (index > 0.0).then_some(index),
            close: None,
            info_mark_price: None,
        })
    }
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
