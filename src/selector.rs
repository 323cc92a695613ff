// =============================================================================
// Symbol Selector (C6) — periodic producer of the tradable universe
// =============================================================================
//
// Scores and admits symbols from a candidate list every re-selection
// interval. Unlike the source this was distilled from, there is no top-N
// truncation or liquidity allowlist: every symbol that clears the reject
// thresholds is returned, ordered by score, since downstream concurrency
// limits already bound the actual scanning work.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::exchange::ExchangeClient;
use crate::types::Symbol;

const MIN_VOLUME_24H_USDT: f64 = 10_000.0;
const MAX_SPREAD_PERCENT: f64 = 2.0;
const MIN_VOLATILITY_24H: f64 = 0.1;
const MAX_VOLATILITY_24H: f64 = 50.0;
const MIN_LIQUIDITY_SCORE: f64 = 0.1;
const RESELECTION_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSymbol {
    pub symbol: Symbol,
    pub score: f64,
    pub liquidity_score: f64,
}

fn volatility_fit(volatility_pct: f64) -> f64 {
    if (2.0..=8.0).contains(&volatility_pct) {
        1.0
    } else if volatility_pct < 2.0 {
        (volatility_pct / 2.0).max(0.0)
    } else {
        (1.0 - (volatility_pct - 8.0) / 42.0).max(0.0)
    }
}

fn score_candidate(
    volume_24h_quote: f64,
    spread_percent: f64,
    volatility_24h: f64,
    liquidity_score: f64,
) -> Option<f64> {
    if volume_24h_quote < MIN_VOLUME_24H_USDT
        || spread_percent > MAX_SPREAD_PERCENT
        || !(MIN_VOLATILITY_24H..=MAX_VOLATILITY_24H).contains(&volatility_24h)
        || liquidity_score < MIN_LIQUIDITY_SCORE
    {
        return None;
    }
    let volume_tier = (volume_24h_quote / 10_000_000.0).min(1.0);
    let spread_component = 1.0 - (spread_percent / MAX_SPREAD_PERCENT);
    let score = 0.30 * volume_tier
        + 0.25 * spread_component
        + 0.25 * volatility_fit(volatility_24h)
        + 0.20 * liquidity_score;
    Some(score)
}

fn liquidity_score(volume_24h_quote: f64, spread_percent: f64) -> f64 {
    0.7 * (volume_24h_quote / 10_000_000.0).min(1.0) + 0.3 * (1.0 - spread_percent).max(0.0)
}

pub struct SymbolSelector {
    exchange: Arc<ExchangeClient>,
    candidates: Vec<Symbol>,
    cached: Mutex<Option<(Instant, Vec<ScoredSymbol>)>>,
}

impl SymbolSelector {
    pub fn new(exchange: Arc<ExchangeClient>, candidates: Vec<Symbol>) -> Self {
        Self { exchange, candidates, cached: Mutex::new(None) }
    }

    /// Returns the cached universe if still within the re-selection TTL,
    /// otherwise recomputes it.
    pub async fn select(&self) -> Vec<ScoredSymbol> {
        if let Some((at, cached)) = self.cached.lock().clone() {
            if at.elapsed() < RESELECTION_TTL {
                return cached;
            }
        }
        self.force_refresh().await
    }

    pub async fn force_refresh(&self) -> Vec<ScoredSymbol> {
        let mut scored = Vec::new();
        for symbol in &self.candidates {
            match self.exchange.fetch_ticker(symbol.as_str()).await {
                Ok(ticker) => {
                    if let Some(entry) = Self::evaluate(symbol.clone(), &ticker) {
                        scored.push(entry);
                    }
                }
                Err(e) => {
                    warn!(symbol = %symbol, %e, "selector: ticker fetch failed, skipping candidate");
                }
            }
        }
        // score desc, tie-break by liquidity desc then alphabetical symbol.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.liquidity_score
                        .partial_cmp(&a.liquidity_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.symbol.as_str().cmp(b.symbol.as_str()))
        });
        debug!(count = scored.len(), "symbol selector refreshed universe");
        *self.cached.lock() = Some((Instant::now(), scored.clone()));
        scored
    }

    fn evaluate(symbol: Symbol, ticker: &crate::exchange::client::Ticker) -> Option<ScoredSymbol> {
        let last = ticker.last.to_f64()?;
        if last <= 0.0 {
            return None;
        }
        let bid = ticker.bid.to_f64()?;
        let ask = ticker.ask.to_f64()?;
        let high = ticker.high_24h.to_f64()?;
        let low = ticker.low_24h.to_f64()?;
        let volume_24h_quote = ticker.volume_24h_quote.to_f64()?;

        let spread_percent = ((ask - bid) / last) * 100.0;
        let volatility_24h = ((high - low) / last) * 100.0;
        let liquidity = liquidity_score(volume_24h_quote, spread_percent);

        let score = score_candidate(volume_24h_quote, spread_percent, volatility_24h, liquidity)?;
        Some(ScoredSymbol { symbol, score, liquidity_score: liquidity })
    }
}

/// Pure helper used by the scanner to estimate liquidity from a raw
/// decimal ticker without constructing a full `ExchangeClient::Ticker`.
pub fn spread_percent(bid: Decimal, ask: Decimal, last: Decimal) -> Decimal {
    if last.is_zero() {
        return Decimal::ZERO;
    }
    ((ask - bid) / last) * Decimal::from(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_low_volume() {
        assert!(score_candidate(5_000.0, 0.1, 5.0, 0.5).is_none());
    }

    #[test]
    fn rejects_wide_spread() {
        assert!(score_candidate(1_000_000.0, 3.0, 5.0, 0.5).is_none());
    }

    #[test]
    fn rejects_out_of_range_volatility() {
        assert!(score_candidate(1_000_000.0, 0.1, 0.05, 0.5).is_none());
        assert!(score_candidate(1_000_000.0, 0.1, 60.0, 0.5).is_none());
    }

    #[test]
    fn rejects_low_liquidity() {
        assert!(score_candidate(1_000_000.0, 0.1, 5.0, 0.05).is_none());
    }

    #[test]
    fn accepts_and_scores_valid_candidate() {
        let score = score_candidate(1_000_000.0, 0.1, 5.0, 0.5).unwrap();
        assert!(score > 0.0 && score <= 1.0);
    }

    #[test]
    fn volatility_fit_peaks_in_2_to_8_band() {
        assert_eq!(volatility_fit(5.0), 1.0);
        assert!(volatility_fit(20.0) < 1.0);
        assert!(volatility_fit(0.5) < 1.0);
    }

    #[test]
    fn ordering_is_deterministic_for_equal_scores() {
        let mut symbols = vec![
            ScoredSymbol { symbol: Symbol::parse("ETH/USDT").unwrap(), score: 0.5, liquidity_score: 0.5 },
            ScoredSymbol { symbol: Symbol::parse("BTC/USDT").unwrap(), score: 0.5, liquidity_score: 0.5 },
        ];
        symbols.sort_by(|a, b| a.symbol.as_str().cmp(b.symbol.as_str()));
        assert_eq!(symbols[0].symbol.as_str(), "BTC/USDT");
    }
}
