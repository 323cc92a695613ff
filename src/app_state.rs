// =============================================================================
// Central Application State
// =============================================================================
//
// The single source of truth tying C1-C10 together. Subsystems hold their
// own interior mutability; AppState composes them behind Arcs and builds the
// unified snapshot the dashboard reads.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for mutable collections owned directly by AppState.
//   - Arc wrappers for subsystem engines that manage their own state.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::cache::SmartCache;
use crate::config::Config;
use crate::exchange::ExchangeClient;
use crate::persistence::Store;
use crate::rate_limiter::{Category as RateCategory, RateLimiter};
use crate::scanner::Scanner;
use crate::selector::SymbolSelector;
use crate::signal_bus::SignalBus;
use crate::trading_engine::TradingEngine;
use crate::types::{BalanceInfo, Signal, Symbol, Trade};
use crate::worker_coordinator::WorkerCoordinator;
use crate::risk_loop::RiskLoop;

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    pub at: String,
}

/// The dashboard push contract's named event types.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    NewSignal { signal: Signal },
    TradeOpened { trade: Trade },
    TradeClosed { trade: Trade },
    StopAdjusted { trade_id: Uuid, symbol: Symbol, new_stop: Decimal },
    TakeProfitExecuted { trade_id: Uuid, symbol: Symbol, level: usize, qty: Decimal },
    ScannerStatus { symbols_scanned: u64, symbols_errored: u64, signals_emitted: u64 },
    Emergency { reason: String },
}

const MAX_RECENT_ERRORS: usize = 50;
const MAX_RECENT_EVENTS: usize = 200;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub state_version: AtomicU64,
    pub ws_sequence_number: AtomicU64,

    pub config: Arc<RwLock<Config>>,

    pub limiter: Arc<RateLimiter>,
    pub coordinator: Arc<WorkerCoordinator>,
    pub cache: Arc<SmartCache>,
    pub exchange: Arc<ExchangeClient>,
    pub selector: Arc<SymbolSelector>,
    pub scanner: Arc<Scanner>,
    pub bus: Arc<SignalBus>,
    pub trading_engine: Arc<TradingEngine>,
    pub risk_loop: Arc<RiskLoop>,
    pub store: Arc<dyn Store>,

    pub balances: RwLock<Vec<BalanceInfo>>,
    pub recent_events: RwLock<Vec<DashboardEvent>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    pub paused: std::sync::atomic::AtomicBool,

    pub start_time: std::time::Instant,
}

#[allow(clippy::too_many_arguments)]
impl AppState {
    pub fn new(
        config: Config,
        limiter: Arc<RateLimiter>,
        coordinator: Arc<WorkerCoordinator>,
        cache: Arc<SmartCache>,
        exchange: Arc<ExchangeClient>,
        selector: Arc<SymbolSelector>,
        scanner: Arc<Scanner>,
        bus: Arc<SignalBus>,
        trading_engine: Arc<TradingEngine>,
        risk_loop: Arc<RiskLoop>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            config: Arc::new(RwLock::new(config)),
            limiter,
            coordinator,
            cache,
            exchange,
            selector,
            scanner,
            bus,
            trading_engine,
            risk_loop,
            store,
            balances: RwLock::new(Vec::new()),
            recent_events: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),
            paused: std::sync::atomic::AtomicBool::new(false),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn push_error(&self, msg: String) {
        self.push_error_with_code(msg, None);
    }

    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord { message: msg, code, at: Utc::now().to_rfc3339() };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    /// Records a dashboard push-contract event and bumps the version so the
    /// WebSocket loop picks it up on its next tick.
    pub fn push_event(&self, event: DashboardEvent) {
        let mut events = self.recent_events.write();
        events.push(event);
        while events.len() > MAX_RECENT_EVENTS {
            events.remove(0);
        }
        self.increment_version();
    }

    pub async fn trigger_emergency_stop(&self, reason: String) {
        self.trading_engine.set_emergency_stop(true);
        self.push_event(DashboardEvent::Emergency { reason: reason.clone() });
        for (symbol, result) in self.trading_engine.emergency_stop_all().await {
            if let Err(e) = result {
                self.push_error_with_code(format!("emergency close failed for {symbol}: {e}"), None);
            }
        }
    }

    /// Builds a complete, serializable snapshot of the engine state for the
    /// dashboard's `GET /api/v1/state` endpoint and the WebSocket push feed.
    pub async fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let version = self.current_state_version();
        let config = self.config.read().clone();

        let open_trades = self.store.list_open_trades().await.unwrap_or_default();

        let truth = TruthHeader {
            state_version: version,
            ws_sequence_number: self.ws_sequence_number.load(Ordering::Relaxed),
            trading_enabled: config.trading_enabled,
            paper_trading: config.paper_trading,
            emergency_stop: config.emergency_stop || self.trading_engine.is_emergency_stopped(),
            paused: self.is_paused(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            server_time: now.timestamp_millis(),
        };

        let limiter_stats = LimiterSnapshot {
            market_data: self.limiter.stats(RateCategory::MarketData),
            account: self.limiter.stats(RateCategory::Account),
        };

        let cache_stats = self.cache.stats();
        let scanner_stats = ScannerStatsSnapshot {
            symbols_scanned: self.scanner.stats.symbols_scanned.load(Ordering::Relaxed),
            symbols_errored: self.scanner.stats.symbols_errored.load(Ordering::Relaxed),
            signals_emitted: self.scanner.stats.signals_emitted.load(Ordering::Relaxed),
        };

        StateSnapshot {
            state_version: version,
            server_time: now.timestamp_millis(),
            truth,
            open_trades,
            balances: self.balances.read().clone(),
            recent_events: self.recent_events.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
            limiter: limiter_stats,
            cache: cache_stats,
            scanner: scanner_stats,
            symbols: config.symbols.clone(),
        }
    }
}

// =============================================================================
// Serializable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub truth: TruthHeader,
    pub open_trades: Vec<Trade>,
    pub balances: Vec<BalanceInfo>,
    pub recent_events: Vec<DashboardEvent>,
    pub recent_errors: Vec<ErrorRecord>,
    pub limiter: LimiterSnapshot,
    pub cache: crate::cache::CacheStats,
    pub scanner: ScannerStatsSnapshot,
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TruthHeader {
    pub state_version: u64,
    pub ws_sequence_number: u64,
    pub trading_enabled: bool,
    pub paper_trading: bool,
    pub emergency_stop: bool,
    pub paused: bool,
    pub uptime_seconds: u64,
    pub server_time: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterSnapshot {
    pub market_data: crate::rate_limiter::CategoryStats,
    pub account: crate::rate_limiter::CategoryStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannerStatsSnapshot {
    pub symbols_scanned: u64,
    pub symbols_errored: u64,
    pub signals_emitted: u64,
}
