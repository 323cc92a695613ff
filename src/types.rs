// =============================================================================
// Shared domain types for the market-scanning and signal-dispatch core
// =============================================================================

use std::collections::HashSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Opaque `BASE/QUOTE` market identifier. `QUOTE` is always `USDT`.
///
/// Immutable after construction; `new` validates the shape so a `Symbol`
/// in hand is always well-formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Parse and validate a `BASE/QUOTE` symbol string. Rejects anything
    /// without exactly one `/` or whose quote side isn't `USDT`.
    pub fn parse(raw: &str) -> Result<Self, crate::error::CoreError> {
        let (base, quote) = raw.split_once('/').ok_or_else(|| {
            crate::error::CoreError::Validation(format!("malformed symbol: {raw}"))
        })?;
        if base.is_empty() || quote != "USDT" {
            return Err(crate::error::CoreError::Validation(format!(
                "unsupported symbol {raw}: quote must be USDT"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn base(&self) -> &str {
        self.0.split_once('/').map(|(b, _)| b).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A candlestick timeframe. Only the timeframes the wire contract names are
/// representable — `Other` exists so an exchange-reported timeframe we don't
/// trade on can still round-trip through serialization without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    H2,
    H4,
    D1,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tradable asset tracked by the selector/validator.
///
/// Created when first observed; mutated only by the selector; never deleted
/// (soft-invalidated via `is_valid = false`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: uuid::Uuid,
    pub symbol: Symbol,
    pub is_valid: bool,
    pub min_order_size: Decimal,
    pub last_validation: chrono::DateTime<chrono::Utc>,
    /// Opaque exchange-provided validation payload (e.g. raw exchangeInfo
    /// filters); not interpreted beyond `min_order_size` extraction.
    pub validation_blob: serde_json::Value,
}

/// Immutable OHLCV bar. Invariant: `l <= min(o,c) <= max(o,c) <= h` and
/// `v >= 0`, enforced in `Candle::new`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub t_open_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn new(
        t_open_ms: i64,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Result<Self, crate::error::CoreError> {
        let body_lo = open.min(close);
        let body_hi = open.max(close);
        if low > body_lo || body_hi > high || volume < Decimal::ZERO {
            return Err(crate::error::CoreError::Validation(format!(
                "candle invariant violated at t={t_open_ms}: o={open} h={high} l={low} c={close} v={volume}"
            )));
        }
        Ok(Self {
            t_open_ms,
            open,
            high,
            low,
            close,
            volume,
        })
    }
}

/// Derived, idempotently recomputable indicator bundle for one
/// `(symbol, timeframe, t)` key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Indicators {
    pub mm1: Decimal,
    pub center: Decimal,
    pub rsi: Decimal,
    pub volume_sma: Decimal,
}

/// BUY / SELL / NEUTRAL directional hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Buy,
    Sell,
    Neutral,
    /// `B` and `S` both fired with confidence ratio >= 2x either way —
    /// promoted from Buy/Sell per spec.md 4.7 step 4.
    StrongBuy,
    StrongSell,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Neutral => "NEUTRAL",
            Self::StrongBuy => "STRONG_BUY",
            Self::StrongSell => "STRONG_SELL",
        };
        write!(f, "{s}")
    }
}

impl SignalKind {
    /// Whether this kind resolves to a BUY-direction order (STRONG_BUY
    /// counts as BUY for order placement purposes).
    pub fn is_buy(self) -> bool {
        matches!(self, Self::Buy | Self::StrongBuy)
    }

    pub fn is_sell(self) -> bool {
        matches!(self, Self::Sell | Self::StrongSell)
    }

    pub fn is_actionable(self) -> bool {
        !matches!(self, Self::Neutral)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStatus {
    Pending,
    Consumed,
    Rejected,
}

/// A typed directional hint plus confidence and triggered-rule set, replacing
/// the "dynamic dict" shape of the original per spec.md REDESIGN FLAGS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: uuid::Uuid,
    pub symbol: Symbol,
    pub kind: SignalKind,
    /// Confidence in `[0, 1]`.
    pub strength: f64,
    pub rules_triggered: HashSet<String>,
    pub snapshot: Indicators,
    pub created: chrono::DateTime<chrono::Utc>,
    pub status: SignalStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn sign(self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

impl TryFrom<SignalKind> for Side {
    type Error = crate::error::CoreError;

    fn try_from(kind: SignalKind) -> Result<Self, Self::Error> {
        if kind.is_buy() {
            Ok(Side::Buy)
        } else if kind.is_sell() {
            Ok(Side::Sell)
        } else {
            Err(crate::error::CoreError::Validation(
                "NEUTRAL signal has no side".to_string(),
            ))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Pending,
    Open,
    Closed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
    Emergency,
    Risk,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StopLoss => "STOP_LOSS",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::Manual => "MANUAL",
            Self::Emergency => "EMERGENCY",
            Self::Risk => "RISK",
        };
        write!(f, "{s}")
    }
}

/// A logical position. Owns zero or more [`Order`]s. State machine:
/// `PENDING -> OPEN -> CLOSED`, or `PENDING -> CANCELLED` on market-order
/// failure. Terminal states are `CLOSED`/`CANCELLED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: uuid::Uuid,
    pub symbol: Symbol,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub status: TradeStatus,
    pub entry_time: chrono::DateTime<chrono::Utc>,
    pub exit_time: Option<chrono::DateTime<chrono::Utc>>,
    pub exit_price: Option<Decimal>,
    pub pnl: Option<Decimal>,
    pub pnl_pct: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,
    /// Explicit per-trade bitmap of consumed staged take-profit levels,
    /// indexed to match `Config::take_profit_levels`. Resolves the open
    /// question in spec.md 9 ("tracked only via comments in source").
    pub take_profit_levels_hit: Vec<bool>,
    pub exchange_order_id: Option<String>,
    /// Quantity filled at entry, fixed for the trade's lifetime — the
    /// denominator for `pnl_pct` once staged take-profits have started
    /// shrinking `qty`.
    pub qty_original: Decimal,
    /// PnL already booked from staged take-profit legs (see
    /// `RiskLoop::process_trade`); `close_trade` folds this into the final
    /// PnL so a partially-closed trade's earlier legs are never lost.
    pub realized_pnl: Decimal,
}

impl Trade {
    /// PnL for a BUY: `(exit - entry) * qty - fees`; for a SELL:
    /// `(entry - exit) * qty - fees`. `pnl_pct = pnl / (entry * qty) * 100`.
    pub fn compute_pnl(side: Side, entry: Decimal, exit: Decimal, qty: Decimal, fees: Decimal) -> (Decimal, Decimal) {
        let raw = match side {
            Side::Buy => (exit - entry) * qty,
            Side::Sell => (entry - exit) * qty,
        };
        let pnl = raw - fees;
        let notional = entry * qty;
        let pnl_pct = if notional.is_zero() {
            Decimal::ZERO
        } else {
            (pnl / notional) * Decimal::from(100)
        };
        (pnl, pnl_pct)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    StopLoss,
    Limit,
    TakeProfit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
}

/// A management or entry order owned by exactly one [`Trade`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: uuid::Uuid,
    pub exchange_order_id: Option<String>,
    pub kind: OrderKind,
    pub side: Side,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub fees: Decimal,
}

/// Free/locked exchange balance for one asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn symbol_requires_usdt_quote() {
        assert!(Symbol::parse("BTC/USDT").is_ok());
        assert!(Symbol::parse("BTC/BUSD").is_err());
        assert!(Symbol::parse("BTCUSDT").is_err());
    }

    #[test]
    fn candle_rejects_invariant_violation() {
        assert!(Candle::new(0, dec!(10), dec!(5), dec!(1), dec!(9), dec!(1)).is_err());
        assert!(Candle::new(0, dec!(10), dec!(12), dec!(9), dec!(11), dec!(-1)).is_err());
        assert!(Candle::new(0, dec!(10), dec!(12), dec!(9), dec!(11), dec!(1)).is_ok());
    }

    #[test]
    fn pnl_buy_vs_sell() {
        let (pnl_buy, _) = Trade::compute_pnl(Side::Buy, dec!(100), dec!(110), dec!(2), dec!(1));
        assert_eq!(pnl_buy, dec!(19)); // (110-100)*2 - 1
        let (pnl_sell, _) = Trade::compute_pnl(Side::Sell, dec!(100), dec!(90), dec!(2), dec!(1));
        assert_eq!(pnl_sell, dec!(19));
    }

    #[test]
    fn side_try_from_neutral_fails() {
        assert!(Side::try_from(SignalKind::Neutral).is_err());
        assert_eq!(Side::try_from(SignalKind::StrongBuy).unwrap(), Side::Buy);
    }
}
