// =============================================================================
// Configuration — flat settings bag with env > file > defaults precedence
// =============================================================================
//
// Every field carries a serde default so an older config file missing new
// fields still loads. `Config::load` layers a JSON file over built-in
// defaults, then lets a handful of environment variables override specific
// fields — matching the precedence the external interface contract demands.
// Persistence uses the same atomic tmp+rename pattern as the rest of the
// engine's state files.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_mm1_period() -> u32 {
    9
}
fn default_center_period() -> u32 {
    21
}
fn default_rsi_period() -> u32 {
    14
}
fn default_volume_sma_period() -> u32 {
    20
}
fn default_rsi_min() -> f64 {
    35.0
}
fn default_rsi_max() -> f64 {
    73.0
}
fn default_ma_distance_2h_percent() -> f64 {
    0.02
}
fn default_ma_distance_4h_percent() -> f64 {
    0.03
}
fn default_volume_spike_threshold() -> f64 {
    2.0
}
fn default_volume_spike_lookback() -> u32 {
    20
}
fn default_max_concurrent_trades() -> u32 {
    3
}
fn default_max_position_size_percent() -> f64 {
    2.0
}
fn default_initial_stop_loss_percent() -> f64 {
    0.02
}
fn default_min_order_size_usdt() -> f64 {
    10.0
}
fn default_min_volume_24h_usdt() -> f64 {
    10_000.0
}
fn default_signal_threshold_buy() -> f64 {
    0.4
}
fn default_signal_persist_threshold() -> f64 {
    0.3
}
fn default_trailing_stop_levels() -> Vec<(f64, f64)> {
    vec![(0.01, 0.005), (0.02, 0.01), (0.04, 0.02)]
}
fn default_take_profit_levels() -> Vec<(f64, f64)> {
    vec![(0.015, 0.3), (0.03, 0.3), (0.05, 0.4)]
}
fn default_scan_interval_seconds() -> u64 {
    2
}
fn default_full_scan_every_n_cycles() -> u32 {
    10
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}

/// Per-category rate limit: `(max_requests, window_seconds, safety_factor)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitCategory {
    pub max_requests: u32,
    pub window_seconds: u64,
    pub safety_factor: f64,
}

fn default_rate_limit_market_data() -> RateLimitCategory {
    RateLimitCategory {
        max_requests: 100,
        window_seconds: 10,
        safety_factor: 0.85,
    }
}

fn default_rate_limit_account() -> RateLimitCategory {
    RateLimitCategory {
        max_requests: 1000,
        window_seconds: 10,
        safety_factor: 0.90,
    }
}

/// TTL range in seconds for a cache category; `Set` uses the midpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheTtl {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl CacheTtl {
    pub fn fixed(secs: u64) -> Self {
        Self {
            min_secs: secs,
            max_secs: secs,
        }
    }

    pub fn midpoint(self) -> u64 {
        (self.min_secs + self.max_secs) / 2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "cache_ticker")]
    pub ticker: CacheTtl,
    #[serde(default = "cache_market_summary")]
    pub market_summary: CacheTtl,
    #[serde(default = "cache_volume_analysis")]
    pub volume_analysis: CacheTtl,
    #[serde(default = "cache_candles")]
    pub candles: CacheTtl,
    #[serde(default = "cache_indicators")]
    pub indicators: CacheTtl,
    #[serde(default = "cache_validation")]
    pub validation: CacheTtl,
    #[serde(default = "cache_markets")]
    pub markets: CacheTtl,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn cache_ticker() -> CacheTtl {
    CacheTtl { min_secs: 5, max_secs: 15 }
}
fn cache_market_summary() -> CacheTtl {
    CacheTtl::fixed(30)
}
fn cache_volume_analysis() -> CacheTtl {
    CacheTtl::fixed(45)
}
fn cache_candles() -> CacheTtl {
    CacheTtl { min_secs: 60, max_secs: 120 }
}
fn cache_indicators() -> CacheTtl {
    CacheTtl { min_secs: 120, max_secs: 300 }
}
fn cache_validation() -> CacheTtl {
    CacheTtl { min_secs: 300, max_secs: 900 }
}
fn cache_markets() -> CacheTtl {
    CacheTtl::fixed(1800)
}
fn default_cache_max_entries() -> usize {
    10_000
}
fn default_cache_sweep_interval_secs() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ticker: cache_ticker(),
            market_summary: cache_market_summary(),
            volume_analysis: cache_volume_analysis(),
            candles: cache_candles(),
            indicators: cache_indicators(),
            validation: cache_validation(),
            markets: cache_markets(),
            max_entries: default_cache_max_entries(),
            sweep_interval_secs: default_cache_sweep_interval_secs(),
        }
    }
}

/// Batch sizing table for full-scan mode, keyed by limiter utilization band.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchBand {
    pub utilization_ceiling: f64,
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
}

fn default_batch_bands() -> Vec<BatchBand> {
    vec![
        BatchBand { utilization_ceiling: 0.60, batch_size: 50, inter_batch_delay_ms: 50 },
        BatchBand { utilization_ceiling: 0.85, batch_size: 35, inter_batch_delay_ms: 150 },
        BatchBand { utilization_ceiling: f64::INFINITY, batch_size: 20, inter_batch_delay_ms: 250 },
    ]
}

fn default_continuous_batch_size() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // --- indicator periods ---------------------------------------------
    #[serde(default = "default_mm1_period")]
    pub mm1_period: u32,
    #[serde(default = "default_center_period")]
    pub center_period: u32,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: u32,
    #[serde(default = "default_volume_sma_period")]
    pub volume_sma_period: u32,

    // --- RSI confirmation band ------------------------------------------
    #[serde(default = "default_rsi_min")]
    pub rsi_min: f64,
    #[serde(default = "default_rsi_max")]
    pub rsi_max: f64,

    // --- MA distance thresholds ------------------------------------------
    #[serde(default = "default_ma_distance_2h_percent")]
    pub ma_distance_2h_percent: f64,
    #[serde(default = "default_ma_distance_4h_percent")]
    pub ma_distance_4h_percent: f64,

    // --- volume spike ------------------------------------------------------
    #[serde(default = "default_volume_spike_threshold")]
    pub volume_spike_threshold: f64,
    #[serde(default = "default_volume_spike_lookback")]
    pub volume_spike_lookback: u32,

    // --- trading limits ------------------------------------------------
    #[serde(default = "default_max_concurrent_trades")]
    pub max_concurrent_trades: u32,
    #[serde(default = "default_max_position_size_percent")]
    pub max_position_size_percent: f64,
    #[serde(default = "default_initial_stop_loss_percent")]
    pub initial_stop_loss_percent: f64,
    #[serde(default = "default_min_order_size_usdt")]
    pub min_order_size_usdt: f64,
    #[serde(default = "default_min_volume_24h_usdt")]
    pub min_volume_24h_usdt: f64,

    // --- signal thresholds & staged exits --------------------------------
    #[serde(default = "default_signal_threshold_buy")]
    pub signal_threshold_buy: f64,
    #[serde(default = "default_signal_persist_threshold")]
    pub signal_persist_threshold: f64,
    #[serde(default = "default_trailing_stop_levels")]
    pub trailing_stop_levels: Vec<(f64, f64)>,
    #[serde(default = "default_take_profit_levels")]
    pub take_profit_levels: Vec<(f64, f64)>,

    // --- scanning cadence -------------------------------------------------
    #[serde(default = "default_scan_interval_seconds")]
    pub scan_interval_seconds: u64,
    #[serde(default = "default_full_scan_every_n_cycles")]
    pub full_scan_every_n_cycles: u32,
    #[serde(default = "default_continuous_batch_size")]
    pub continuous_batch_size: usize,
    #[serde(default = "default_batch_bands")]
    pub full_scan_batch_bands: Vec<BatchBand>,

    // --- rate limiting / caching ------------------------------------------
    #[serde(default = "default_rate_limit_market_data")]
    pub rate_limit_market_data: RateLimitCategory,
    #[serde(default = "default_rate_limit_account")]
    pub rate_limit_account: RateLimitCategory,
    #[serde(default)]
    pub cache: CacheConfig,

    // --- operational switches ----------------------------------------------
    #[serde(default = "default_true")]
    pub trading_enabled: bool,
    #[serde(default = "default_true")]
    pub paper_trading: bool,
    #[serde(default = "default_false")]
    pub emergency_stop: bool,

    // --- symbol universe ----------------------------------------------------
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTC/USDT".to_string(),
        "ETH/USDT".to_string(),
        "BNB/USDT".to_string(),
        "XRP/USDT".to_string(),
        "SOL/USDT".to_string(),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mm1_period: default_mm1_period(),
            center_period: default_center_period(),
            rsi_period: default_rsi_period(),
            volume_sma_period: default_volume_sma_period(),
            rsi_min: default_rsi_min(),
            rsi_max: default_rsi_max(),
            ma_distance_2h_percent: default_ma_distance_2h_percent(),
            ma_distance_4h_percent: default_ma_distance_4h_percent(),
            volume_spike_threshold: default_volume_spike_threshold(),
            volume_spike_lookback: default_volume_spike_lookback(),
            max_concurrent_trades: default_max_concurrent_trades(),
            max_position_size_percent: default_max_position_size_percent(),
            initial_stop_loss_percent: default_initial_stop_loss_percent(),
            min_order_size_usdt: default_min_order_size_usdt(),
            min_volume_24h_usdt: default_min_volume_24h_usdt(),
            signal_threshold_buy: default_signal_threshold_buy(),
            signal_persist_threshold: default_signal_persist_threshold(),
            trailing_stop_levels: default_trailing_stop_levels(),
            take_profit_levels: default_take_profit_levels(),
            scan_interval_seconds: default_scan_interval_seconds(),
            full_scan_every_n_cycles: default_full_scan_every_n_cycles(),
            continuous_batch_size: default_continuous_batch_size(),
            full_scan_batch_bands: default_batch_bands(),
            rate_limit_market_data: default_rate_limit_market_data(),
            rate_limit_account: default_rate_limit_account(),
            cache: CacheConfig::default(),
            trading_enabled: true,
            paper_trading: true,
            emergency_stop: false,
            symbols: default_symbols(),
        }
    }
}

impl Config {
    /// Load from `path` if present, layering a handful of environment
    /// variables over the result; falls back to built-in defaults (with
    /// the same env overlay) if the file is absent.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut cfg = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("failed to parse config from {}", path.display()))?,
            Err(_) => {
                info!(path = %path.display(), "no config file found, using defaults");
                Self::default()
            }
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        macro_rules! env_override {
            ($field:expr, $name:literal, $parse:ty) => {
                if let Ok(v) = std::env::var($name) {
                    if let Ok(parsed) = v.parse::<$parse>() {
                        $field = parsed;
                    }
                }
            };
        }
        env_override!(self.mm1_period, "MM1_PERIOD", u32);
        env_override!(self.center_period, "CENTER_PERIOD", u32);
        env_override!(self.rsi_period, "RSI_PERIOD", u32);
        env_override!(self.volume_sma_period, "VOLUME_SMA_PERIOD", u32);
        env_override!(self.rsi_min, "RSI_MIN", f64);
        env_override!(self.rsi_max, "RSI_MAX", f64);
        env_override!(self.ma_distance_2h_percent, "MA_DISTANCE_2H_PERCENT", f64);
        env_override!(self.ma_distance_4h_percent, "MA_DISTANCE_4H_PERCENT", f64);
        env_override!(self.volume_spike_threshold, "VOLUME_SPIKE_THRESHOLD", f64);
        env_override!(self.volume_spike_lookback, "VOLUME_SPIKE_LOOKBACK", u32);
        env_override!(self.max_concurrent_trades, "MAX_CONCURRENT_TRADES", u32);
        env_override!(self.max_position_size_percent, "MAX_POSITION_SIZE_PERCENT", f64);
        env_override!(self.initial_stop_loss_percent, "INITIAL_STOP_LOSS_PERCENT", f64);
        env_override!(self.min_order_size_usdt, "MIN_ORDER_SIZE_USDT", f64);
        env_override!(self.min_volume_24h_usdt, "MIN_VOLUME_24H_USDT", f64);
        env_override!(self.scan_interval_seconds, "SCAN_INTERVAL_SECONDS", u64);
        env_override!(self.trading_enabled, "TRADING_ENABLED", bool);
        env_override!(self.paper_trading, "PAPER_TRADING", bool);
        env_override!(self.emergency_stop, "EMERGENCY_STOP", bool);
    }

    /// Persist via atomic tmp+rename, same pattern the rest of the engine
    /// uses for crash-safe writes.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("serialise config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "config saved");
        Ok(())
    }
}

/// Replaces the ambient "test mode" global flag named in the redesign
/// notes: a swappable policy object rather than a boolean threaded through
/// every call site.
pub trait Policy: Send + Sync {
    fn should_trade(&self, emergency_stop: bool, trading_enabled: bool) -> bool {
        trading_enabled && !emergency_stop
    }

    fn signal_threshold(&self) -> f64;

    fn initial_stop_percent(&self) -> f64;
}

/// Production policy: thresholds come straight from [`Config`].
pub struct StandardPolicy {
    pub signal_threshold: f64,
    pub initial_stop_percent: f64,
}

impl StandardPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            signal_threshold: cfg.signal_threshold_buy,
            initial_stop_percent: cfg.initial_stop_loss_percent,
        }
    }
}

impl Policy for StandardPolicy {
    fn signal_threshold(&self) -> f64 {
        self.signal_threshold
    }

    fn initial_stop_percent(&self) -> f64 {
        self.initial_stop_percent
    }
}

/// Synthetic-load / integration-test policy: relaxed threshold (0.1) and
/// tighter stop (1%). Never wired as the default policy in production
/// startup — callers must opt in explicitly.
pub struct TestPolicy;

impl Policy for TestPolicy {
    fn signal_threshold(&self) -> f64 {
        0.1
    }

    fn initial_stop_percent(&self) -> f64 {
        0.01
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_enumerated_values() {
        let cfg = Config::default();
        assert_eq!(cfg.mm1_period, 9);
        assert_eq!(cfg.center_period, 21);
        assert_eq!(cfg.rsi_period, 14);
        assert_eq!(cfg.volume_sma_period, 20);
        assert_eq!(cfg.rsi_min, 35.0);
        assert_eq!(cfg.rsi_max, 73.0);
        assert_eq!(cfg.rate_limit_market_data.max_requests, 100);
        assert_eq!(cfg.rate_limit_market_data.window_seconds, 10);
        assert_eq!(cfg.rate_limit_account.max_requests, 1000);
        assert_eq!(cfg.min_volume_24h_usdt, 10_000.0);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.mm1_period, 9);
        assert!(cfg.trading_enabled);
        assert!(cfg.paper_trading);
        assert!(!cfg.emergency_stop);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.trailing_stop_levels, cfg2.trailing_stop_levels);
    }

    #[test]
    fn test_policy_never_equals_standard_defaults() {
        let cfg = Config::default();
        let standard = StandardPolicy::from_config(&cfg);
        let test = TestPolicy;
        assert_ne!(standard.signal_threshold(), test.signal_threshold());
        assert_ne!(standard.initial_stop_percent(), test.initial_stop_percent());
    }
}
