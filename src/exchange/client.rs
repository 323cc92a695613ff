// =============================================================================
// Exchange Client (C4) — typed request surface over C1/C2/C3
// =============================================================================
//
// HMAC-SHA256 signed requests against a Binance-shaped spot REST API.
// SECURITY: the secret key is never logged or serialized; only a redacted
// Debug impl is provided. Every call categorizes itself as `market_data` or
// `account` and goes through the worker coordinator then the rate limiter
// before hitting the wire, exactly as the concurrency model requires.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rust_decimal::prelude::FromStr;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::error::CoreError;
use crate::rate_limiter::{Category, RateLimiter};
use crate::types::{Candle, Side, Timeframe};
use crate::worker_coordinator::{WorkerClass, WorkerCoordinator};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Ticker {
    pub symbol: String,
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub volume_24h_quote: Decimal,
}

#[derive(Debug, Clone)]
pub struct OrderbookLevel {
    pub price: Decimal,
    pub qty: Decimal,
}

#[derive(Debug, Clone)]
pub struct Orderbook {
    pub bids: Vec<OrderbookLevel>,
    pub asks: Vec<OrderbookLevel>,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub status: String,
}

pub struct ExchangeClient {
    api_key: String,
    secret: String,
    base_url: String,
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    coordinator: Arc<WorkerCoordinator>,
    worker_id: u64,
    worker_class: WorkerClass,
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ExchangeClient {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        limiter: Arc<RateLimiter>,
        coordinator: Arc<WorkerCoordinator>,
        worker_id: u64,
        worker_class: WorkerClass,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        coordinator.register(worker_id, worker_class);
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: "https://api.binance.com".to_string(),
            http,
            limiter,
            coordinator,
            worker_id,
            worker_class,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
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

    async fn admit(&self, category: Category) {
        self.coordinator.request_permission(self.worker_id, category).await;
        self.limiter.acquire(category).await;
    }

    fn classify_status(status: reqwest::StatusCode, body: &serde_json::Value) -> CoreError {
        if status.as_u16() == 429 || status.as_u16() == 418 {
            CoreError::RateLimited(format!("exchange returned {status}: {body}"))
        } else if status.is_server_error() {
            CoreError::Transient(format!("exchange returned {status}: {body}"))
        } else {
            CoreError::Permanent(format!("exchange returned {status}: {body}"))
        }
    }

    async fn get_json(&self, url: &str, category: Category) -> Result<serde_json::Value, CoreError> {
        self.admit(category).await;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("request failed: {e}")))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::Transient(format!("body parse failed: {e}")))?;
        if !status.is_success() {
            let err = Self::classify_status(status, &body);
            if matches!(err, CoreError::RateLimited(_)) {
                self.limiter.record_rate_limited(category);
            }
            return Err(err);
        }
        self.limiter.record_success(category);
        Ok(body)
    }

    async fn post_json(&self, url: &str, category: Category) -> Result<serde_json::Value, CoreError> {
        self.admit(category).await;
        let resp = self
            .http
            .post(url)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("request failed: {e}")))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::Transient(format!("body parse failed: {e}")))?;
        if !status.is_success() {
            let err = Self::classify_status(status, &body);
            if matches!(err, CoreError::RateLimited(_)) {
                self.limiter.record_rate_limited(category);
            }
            return Err(err);
        }
        self.limiter.record_success(category);
        Ok(body)
    }

    async fn delete_json(&self, url: &str, category: Category) -> Result<serde_json::Value, CoreError> {
        self.admit(category).await;
        let resp = self
            .http
            .delete(url)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("request failed: {e}")))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::Transient(format!("body parse failed: {e}")))?;
        if !status.is_success() {
            let err = Self::classify_status(status, &body);
            if matches!(err, CoreError::RateLimited(_)) {
                self.limiter.record_rate_limited(category);
            }
            return Err(err);
        }
        self.limiter.record_success(category);
        Ok(body)
    }

    fn parse_decimal(val: &serde_json::Value) -> Result<Decimal, CoreError> {
        if let Some(s) = val.as_str() {
            Decimal::from_str(s).map_err(|e| CoreError::Permanent(format!("bad decimal '{s}': {e}")))
        } else if let Some(n) = val.as_f64() {
            Decimal::try_from(n).map_err(|e| CoreError::Permanent(format!("bad decimal {n}: {e}")))
        } else {
            Err(CoreError::Permanent(format!("expected decimal, got {val}")))
        }
    }

    // --- market data -------------------------------------------------------

    #[instrument(skip(self), name = "exchange::fetch_markets")]
    pub async fn fetch_markets(&self) -> Result<Vec<String>, CoreError> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let body = self.get_json(&url, Category::MarketData).await?;
        let symbols = body["symbols"]
            .as_array()
            .ok_or_else(|| CoreError::Permanent("exchangeInfo missing symbols array".to_string()))?
            .iter()
            .filter_map(|s| s["symbol"].as_str().map(str::to_string))
            .collect();
        Ok(symbols)
    }

    #[instrument(skip(self), name = "exchange::fetch_ticker")]
    pub async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, CoreError> {
        let wire_symbol = symbol.replace('/', "");
        let url = format!("{}/api/v3/ticker/24hr?symbol={}", self.base_url, wire_symbol);
        let body = self.get_json(&url, Category::MarketData).await?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last: Self::parse_decimal(&body["lastPrice"])?,
            bid: Self::parse_decimal(&body["bidPrice"])?,
            ask: Self::parse_decimal(&body["askPrice"])?,
            high_24h: Self::parse_decimal(&body["highPrice"])?,
            low_24h: Self::parse_decimal(&body["lowPrice"])?,
            volume_24h_quote: Self::parse_decimal(&body["quoteVolume"])?,
        })
    }

    #[instrument(skip(self), name = "exchange::fetch_candles")]
    pub async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<Vec<Candle>, CoreError> {
        let wire_symbol = symbol.replace('/', "");
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            wire_symbol,
            timeframe.as_str(),
            limit
        );
        let body = self.get_json(&url, Category::MarketData).await?;
        let raw = body
            .as_array()
            .ok_or_else(|| CoreError::Permanent("klines response is not an array".to_string()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry
                .as_array()
                .ok_or_else(|| CoreError::Permanent("kline entry is not an array".to_string()))?;
            if arr.len() < 6 {
                warn!(len = arr.len(), "skipping malformed kline entry");
                continue;
            }
            let t_open_ms = arr[0].as_i64().unwrap_or(0);
            let open = Self::parse_decimal(&arr[1])?;
            let high = Self::parse_decimal(&arr[2])?;
            let low = Self::parse_decimal(&arr[3])?;
            let close = Self::parse_decimal(&arr[4])?;
            let volume = Self::parse_decimal(&arr[5])?;
            match Candle::new(t_open_ms, open, high, low, close, volume) {
                Ok(c) => candles.push(c),
                Err(e) => warn!(symbol, %e, "dropping invalid candle"),
            }
        }
        debug!(symbol, timeframe = %timeframe, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "exchange::fetch_orderbook")]
    pub async fn fetch_orderbook(&self, symbol: &str, depth: u32) -> Result<Orderbook, CoreError> {
        let wire_symbol = symbol.replace('/', "");
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.base_url, wire_symbol, depth
        );
        let body = self.get_json(&url, Category::MarketData).await?;
        let parse_levels = |key: &str| -> Result<Vec<OrderbookLevel>, CoreError> {
            body[key]
                .as_array()
                .ok_or_else(|| CoreError::Permanent(format!("depth response missing {key}")))?
                .iter()
                .map(|level| {
                    let level = level
                        .as_array()
                        .ok_or_else(|| CoreError::Permanent("depth level is not an array".to_string()))?;
                    Ok(OrderbookLevel {
                        price: Self::parse_decimal(&level[0])?,
                        qty: Self::parse_decimal(&level[1])?,
                    })
                })
                .collect()
        };
        Ok(Orderbook { bids: parse_levels("bids")?, asks: parse_levels("asks")? })
    }

    // --- account -------------------------------------------------------

    #[instrument(skip(self), name = "exchange::fetch_balance")]
    pub async fn fetch_balance(&self, asset: &str) -> Result<Decimal, CoreError> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);
        let body = self.get_json(&url, Category::Account).await?;
        let balances = body["balances"]
            .as_array()
            .ok_or_else(|| CoreError::Permanent("account response missing balances".to_string()))?;
        for b in balances {
            if b["asset"].as_str() == Some(asset) {
                return Self::parse_decimal(&b["free"]);
            }
        }
        warn!(asset, "asset not found in balances, returning 0");
        Ok(Decimal::ZERO)
    }

    #[instrument(skip(self), name = "exchange::create_market_order")]
    pub async fn create_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
    ) -> Result<OrderAck, CoreError> {
        let wire_symbol = symbol.replace('/', "");
        let side_str = side.to_string();
        let params = format!("symbol={wire_symbol}&side={side_str}&type=MARKET&quantity={qty}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);
        let body = self.post_json(&url, Category::Account).await?;
        Self::parse_order_ack(&body)
    }

    #[instrument(skip(self), name = "exchange::create_stop_loss_order")]
    pub async fn create_stop_loss_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        stop_price: Decimal,
    ) -> Result<OrderAck, CoreError> {
        let wire_symbol = symbol.replace('/', "");
        let side_str = side.to_string();
        let params = format!(
            "symbol={wire_symbol}&side={side_str}&type=STOP_LOSS&quantity={qty}&stopPrice={stop_price}"
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);
        let body = self.post_json(&url, Category::Account).await?;
        Self::parse_order_ack(&body)
    }

    #[instrument(skip(self), name = "exchange::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> Result<(), CoreError> {
        let wire_symbol = symbol.replace('/', "");
        let params = format!("symbol={wire_symbol}&orderId={exchange_order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);
        self.delete_json(&url, Category::Account).await?;
        Ok(())
    }

    fn parse_order_ack(body: &serde_json::Value) -> Result<OrderAck, CoreError> {
        let exchange_order_id = body["orderId"]
            .as_i64()
            .map(|id| id.to_string())
            .or_else(|| body["orderId"].as_str().map(str::to_string))
            .ok_or_else(|| CoreError::Permanent("order response missing orderId".to_string()))?;
        let status = body["status"].as_str().unwrap_or("UNKNOWN").to_string();
        let filled_qty = body["executedQty"]
            .as_str()
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or(Decimal::ZERO);
        let avg_price = body["fills"]
            .as_array()
            .and_then(|fills| fills.first())
            .and_then(|f| f["price"].as_str())
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or(Decimal::ZERO);
        Ok(OrderAck { exchange_order_id, filled_qty, avg_price, status })
    }
}

impl Drop for ExchangeClient {
    fn drop(&mut self) {
        self.coordinator.unregister(self.worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_maps_429_to_rate_limited() {
        let body = serde_json::json!({});
        let err = ExchangeClient::classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, &body);
        assert!(matches!(err, CoreError::RateLimited(_)));
    }

    #[test]
    fn classify_status_maps_5xx_to_transient() {
        let body = serde_json::json!({});
        let err = ExchangeClient::classify_status(reqwest::StatusCode::BAD_GATEWAY, &body);
        assert!(matches!(err, CoreError::Transient(_)));
    }

    #[test]
    fn classify_status_maps_4xx_to_permanent() {
        let body = serde_json::json!({});
        let err = ExchangeClient::classify_status(reqwest::StatusCode::BAD_REQUEST, &body);
        assert!(matches!(err, CoreError::Permanent(_)));
    }

    #[test]
    fn parse_order_ack_extracts_fields() {
        let body = serde_json::json!({
            "orderId": 12345,
            "status": "FILLED",
            "executedQty": "1.5",
            "fills": [{"price": "100.5"}]
        });
        let ack = ExchangeClient::parse_order_ack(&body).unwrap();
        assert_eq!(ack.exchange_order_id, "12345");
        assert_eq!(ack.status, "FILLED");
    }
}
