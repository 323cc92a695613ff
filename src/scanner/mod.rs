// =============================================================================
// Scanner (C7) — the pipeline heart
// =============================================================================
//
// Bounded-concurrency fan-out over the selected universe. Continuous mode
// runs small batches on a tight cadence; full-scan mode covers everything
// every N cycles with a batch size adapted to rate-limiter utilization.
// Per-symbol failures are isolated: one bad symbol increments a counter and
// is skipped, never aborting the batch.

pub mod rules;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, Category as CacheCategory, SmartCache};
use crate::config::Config;
use crate::error::CoreError;
use crate::exchange::ExchangeClient;
use crate::indicators::{self, Crossover};
use crate::persistence::Store;
use crate::rate_limiter::{Category as RateCategory, RateLimiter};
use crate::scanner::rules::{aggregate, r1_crossover_rsi, r2_ma_distance, r3_volume_spike, RuleOutcome, Tf};
use crate::signal_bus::SignalBus;
use crate::types::{Candle, Indicators, Signal, SignalKind, SignalStatus, Symbol, Timeframe};

pub struct ScannerStats {
    pub symbols_scanned: AtomicU64,
    pub symbols_errored: AtomicU64,
    pub signals_emitted: AtomicU64,
}

impl Default for ScannerStats {
    fn default() -> Self {
        Self {
            symbols_scanned: AtomicU64::new(0),
            symbols_errored: AtomicU64::new(0),
            signals_emitted: AtomicU64::new(0),
        }
    }
}

pub struct Scanner {
    exchange: Arc<ExchangeClient>,
    cache: Arc<SmartCache>,
    store: Arc<dyn Store>,
    bus: Arc<SignalBus>,
    limiter: Arc<RateLimiter>,
    cfg: Arc<Config>,
    pub stats: ScannerStats,
}

impl Scanner {
    pub fn new(
        exchange: Arc<ExchangeClient>,
        cache: Arc<SmartCache>,
        store: Arc<dyn Store>,
        bus: Arc<SignalBus>,
        limiter: Arc<RateLimiter>,
        cfg: Arc<Config>,
    ) -> Self {
        Self { exchange, cache, store, bus, limiter, cfg, stats: ScannerStats::default() }
    }

    async fn fetch_candles_cached(&self, symbol: &Symbol, tf: Timeframe, limit: u32) -> Result<Vec<Candle>, CoreError> {
        let key = CacheKey::new(
            CacheCategory::Candles,
            symbol.as_str(),
            vec![("tf".into(), tf.as_str().into()), ("limit".into(), limit.to_string())],
        );
        let exchange = self.exchange.clone();
        let symbol = symbol.clone();
        self.cache
            .get_or_fetch(key, move || async move { exchange.fetch_candles(symbol.as_str(), tf, limit).await })
            .await
    }

    /// Full per-symbol pipeline: fetch -> compute -> evaluate rules -> emit.
    /// Errors are returned to the caller for counting, never panics.
    pub async fn scan_symbol(&self, symbol: &Symbol) -> Result<Option<Signal>, CoreError> {
        // Warms the 1m cache tier per the documented per-symbol fetch list;
        // no rule consumes it today.
        if let Err(e) = self.fetch_candles_cached(symbol, Timeframe::M1, 50).await {
            debug!(%symbol, %e, "1m candle warm fetch failed, continuing without it");
        }

        let candles_2h = indicators::clean_candles(self.fetch_candles_cached(symbol, Timeframe::H2, 100).await?);
        let candles_4h = indicators::clean_candles(self.fetch_candles_cached(symbol, Timeframe::H4, 100).await?);

        if candles_2h.len() < 100 || candles_4h.len() < 100 {
            return Err(CoreError::InsufficientData(format!("{symbol}: not enough 2h/4h candles")));
        }

        let snapshot_2h = self.compute_with_prev(&candles_2h)?;
        let snapshot_4h = self.compute_with_prev(&candles_4h)?;

        let mut outcomes: Vec<RuleOutcome> = Vec::new();

        if let Some(r1) = r1_crossover_rsi(
            &self.cfg,
            snapshot_2h.crossover,
            snapshot_2h.curr.rsi,
            snapshot_4h.crossover,
            snapshot_4h.curr.rsi,
        ) {
            outcomes.push(r1);
        }

        let dist_2h = indicators::ma_distance(snapshot_2h.curr.mm1, snapshot_2h.curr.center);
        if let Some(r2) = r2_ma_distance(&self.cfg, Tf::H2, dist_2h, snapshot_2h.curr.mm1, snapshot_2h.curr.center) {
            outcomes.push(r2);
        }
        let dist_4h = indicators::ma_distance(snapshot_4h.curr.mm1, snapshot_4h.curr.center);
        if let Some(r2) = r2_ma_distance(&self.cfg, Tf::H4, dist_4h, snapshot_4h.curr.mm1, snapshot_4h.curr.center) {
            outcomes.push(r2);
        }

        let current_volume = candles_2h.last().map(|c| c.volume).unwrap_or_default();
        let spike = indicators::volume_spike(
            current_volume,
            snapshot_2h.curr.volume_sma,
            Decimal::try_from(self.cfg.volume_spike_threshold).unwrap_or_default(),
        );
        if let Some(r3) = r3_volume_spike(spike, snapshot_2h.curr.mm1, snapshot_2h.curr.center) {
            outcomes.push(r3);
        }

        let (kind, confidence, rules_triggered) = aggregate(&outcomes);

        if kind == SignalKind::Neutral {
            return Ok(None);
        }

        let signal = Signal {
            id: uuid::Uuid::new_v4(),
            symbol: symbol.clone(),
            kind,
            strength: confidence,
            rules_triggered,
            snapshot: snapshot_4h.curr,
            created: chrono::Utc::now(),
            status: SignalStatus::Pending,
        };

        if confidence >= self.cfg.signal_persist_threshold {
            if let Err(e) = self.store.create_signal(signal.clone()).await {
                warn!(%symbol, %e, "failed to persist audit signal");
            }
        }

        if confidence >= self.cfg.signal_threshold_buy {
            self.bus.publish(signal.clone());
            self.stats.signals_emitted.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(signal));
        }

        Ok(None)
    }

    fn compute_with_prev(&self, candles: &[Candle]) -> Result<TfSnapshot, CoreError> {
        let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
        let mm1_series = indicators::ema::ema_series(&closes, self.cfg.mm1_period as usize)?;
        let center_series = indicators::ema::ema_series(&closes, self.cfg.center_period as usize)?;
        let curr = indicators::compute_indicators(candles, &self.cfg)?;

        let n = mm1_series.len();
        let (mm1_prev, center_prev) = if n >= 2 {
            (mm1_series[n - 2], center_series[n - 2])
        } else {
            (mm1_series[n - 1], center_series[n - 1])
        };
        let crossover = indicators::detect_crossover(mm1_prev, center_prev, curr.mm1, curr.center);

        Ok(TfSnapshot { curr, crossover })
    }

    /// Batches run sequentially to bound total in-flight work; per-symbol
    /// tasks inside a batch run concurrently, bounded by a semaphore sized
    /// to the batch. One symbol's error never aborts the batch.
    pub async fn scan_batch(self: &Arc<Self>, symbols: &[Symbol], batch_size: usize) {
        for batch in symbols.chunks(batch_size.max(1)) {
            let semaphore = Arc::new(Semaphore::new(batch.len().max(1)));
            let mut handles = Vec::with_capacity(batch.len());
            for symbol in batch {
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let symbol = symbol.clone();
                let this = self.clone();
                handles.push(tokio::spawn(async move {
                    let result = this.scan_symbol(&symbol).await;
                    drop(permit);
                    (symbol, result)
                }));
            }
            for handle in handles {
                let (symbol, result) = match handle.await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(%e, "scan task panicked, isolating as an error");
                        continue;
                    }
                };
                self.stats.symbols_scanned.fetch_add(1, Ordering::Relaxed);
                match result {
                    Ok(Some(_)) => debug!(%symbol, "scan produced a signal"),
                    Ok(None) => {}
                    Err(e) => {
                        self.stats.symbols_errored.fetch_add(1, Ordering::Relaxed);
                        warn!(%symbol, %e, "scan error isolated to this symbol");
                    }
                }
            }
        }
    }

    /// Chooses a full-scan batch size and inter-batch delay from the
    /// configured utilization bands.
    pub fn full_scan_batch_plan(&self) -> (usize, u64) {
        let utilization = self.limiter.stats(RateCategory::MarketData).utilization;
        for band in &self.cfg.full_scan_batch_bands {
            if utilization < band.utilization_ceiling {
                return (band.batch_size, band.inter_batch_delay_ms);
            }
        }
        (20, 250)
    }
}

struct TfSnapshot {
    curr: Indicators,
    crossover: Crossover,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_plan_table_is_monotonic_in_size() {
        let cfg = Config::default();
        let mut prev = usize::MAX;
        for band in &cfg.full_scan_batch_bands {
            assert!(band.batch_size <= prev);
            prev = band.batch_size;
        }
    }
}
