// =============================================================================
// Scan engine — main entry point
// =============================================================================
//
// `start` runs the full engine: scanner + trading engine + risk loop +
// dashboard API. The other subcommands are thin clients that hit the
// running engine's admin API, per the operational CLI surface.

mod api;
mod app_state;
mod cache;
mod config;
mod error;
mod exchange;
mod indicators;
mod persistence;
mod rate_limiter;
mod risk_loop;
mod scanner;
mod selector;
mod signal_bus;
mod trading_engine;
mod types;
mod worker_coordinator;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, DashboardEvent};
use crate::cache::SmartCache;
use crate::config::{Config, Policy, StandardPolicy};
use crate::exchange::ExchangeClient;
use crate::persistence::InMemoryStore;
use crate::rate_limiter::RateLimiter;
use crate::risk_loop::{RiskLoop, RISK_LOOP_INTERVAL};
use crate::scanner::Scanner;
use crate::selector::SymbolSelector;
use crate::signal_bus::SignalBus;
use crate::trading_engine::{IntakeOutcome, TradingEngine};
use crate::types::Symbol;
use crate::worker_coordinator::{WorkerClass, WorkerCoordinator};

#[derive(Parser)]
#[command(name = "scan-engine", about = "Real-time market scanning and signal-dispatch core")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine: scanner, trading engine, risk loop, dashboard API.
    Start,
    /// Ask a running engine to pause scanning via the admin API.
    Stop,
    /// Ask a running engine to liquidate all open trades immediately.
    EmergencyStop {
        #[arg(long)]
        reason: Option<String>,
    },
    /// Ask a running engine to re-score and refresh its symbol universe.
    ForceRevalidate,
    /// Ask a running engine to run a single on-demand scan of one symbol.
    Analyze { symbol: String },
}

fn admin_base() -> String {
    std::env::var("SCAN_ENGINE_BIND_ADDR")
        .map(|a| format!("http://{a}"))
        .unwrap_or_else(|_| "http://127.0.0.1:3001".to_string())
}

fn admin_token() -> String {
    std::env::var("SCAN_ENGINE_ADMIN_TOKEN").unwrap_or_default()
}

async fn admin_post(path: &str, body: serde_json::Value) -> anyhow::Result<serde_json::Value> {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}{}", admin_base(), path))
        .bearer_auth(admin_token())
        .json(&body)
        .send()
        .await?
        .error_for_status()?;
    Ok(resp.json().await.unwrap_or_default())
}

#[tokio::main]
async fn main() {
    std::process::exit(real_main().await);
}

async fn real_main() -> i32 {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Start) {
        Command::Start => run_engine().await,
        Command::Stop => match admin_post("/api/v1/control/pause", serde_json::json!({})).await {
            Ok(_) => { info!("scanning paused"); 0 }
            Err(e) => { error!(%e, "stop failed"); 1 }
        },
        Command::EmergencyStop { reason } => {
            match admin_post("/api/v1/control/emergency-stop", serde_json::json!({ "reason": reason })).await {
                Ok(_) => { warn!("emergency stop executed"); 0 }
                Err(e) => { error!(%e, "emergency-stop failed"); 1 }
            }
        }
        Command::ForceRevalidate => match admin_post("/api/v1/control/force-revalidate", serde_json::json!({})).await {
            Ok(v) => { info!(result = %v, "universe revalidated"); 0 }
            Err(e) => { error!(%e, "force-revalidate failed"); 1 }
        },
        Command::Analyze { symbol } => {
            let client = reqwest::Client::new();
            match client
                .post(format!("{}/api/v1/signals/analyze/{}", admin_base(), symbol))
                .bearer_auth(admin_token())
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    match resp.json::<serde_json::Value>().await {
                        Ok(v) => { info!(%v, "analysis complete"); 0 }
                        Err(e) => { error!(%e, "failed to parse analysis response"); 2 }
                    }
                }
                Ok(resp) => { error!(status = %resp.status(), "analyze request rejected"); 1 }
                Err(e) => { error!(%e, "analyze request failed"); 1 }
            }
        }
    }
}

/// Builds every C1-C10 component, wires background loops, and serves the
/// dashboard API until interrupted.
async fn run_engine() -> i32 {
    info!("scan engine starting up");
    api::auth::init();

    let config = Config::load("config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        Config::default()
    });

    let symbols: Vec<Symbol> = config
        .symbols
        .iter()
        .filter_map(|s| match Symbol::parse(s) {
            Ok(sym) => Some(sym),
            Err(e) => {
                warn!(raw = %s, %e, "dropping unparsable configured symbol");
                None
            }
        })
        .collect();
    if symbols.is_empty() {
        error!("no valid symbols configured, refusing to start");
        return 1;
    }

    let limiter = Arc::new(RateLimiter::new(config.rate_limit_market_data, config.rate_limit_account));
    let coordinator = Arc::new(WorkerCoordinator::new(config.rate_limit_market_data.max_requests as f64));
    let cache = Arc::new(SmartCache::new(config.cache.clone()));

    let api_key = std::env::var("EXCHANGE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("EXCHANGE_API_SECRET").unwrap_or_default();
    // Separate client instances per worker class so the coordinator's
    // per-class budget actually reflects which subsystem is calling out.
    let scan_exchange = Arc::new(ExchangeClient::new(
        api_key.clone(),
        api_secret.clone(),
        limiter.clone(),
        coordinator.clone(),
        1,
        WorkerClass::Scanner,
    ));
    let trading_exchange = Arc::new(ExchangeClient::new(
        api_key,
        api_secret,
        limiter.clone(),
        coordinator.clone(),
        2,
        WorkerClass::Trading,
    ));

    let store: Arc<dyn persistence::Store> = Arc::new(InMemoryStore::new());
    let bus = Arc::new(SignalBus::new());

    let config = Arc::new(config);
    let selector = Arc::new(SymbolSelector::new(scan_exchange.clone(), symbols.clone()));
    let scanner = Arc::new(Scanner::new(scan_exchange.clone(), cache.clone(), store.clone(), bus.clone(), limiter.clone(), config.clone()));

    let policy = Arc::new(StandardPolicy::from_config(&config));
    let trading_engine = Arc::new(TradingEngine::new(trading_exchange.clone(), store.clone(), config.clone(), policy));
    if let Err(e) = trading_engine.reconcile_at_startup().await {
        error!(%e, "startup reconciliation failed");
        return 1;
    }

    let risk_loop = Arc::new(RiskLoop::new(trading_exchange.clone(), store.clone(), config.clone()));

    let state = Arc::new(AppState::new(
        (*config).clone(),
        limiter.clone(),
        coordinator.clone(),
        cache.clone(),
        scan_exchange.clone(),
        selector.clone(),
        scanner.clone(),
        bus.clone(),
        trading_engine.clone(),
        risk_loop.clone(),
        store.clone(),
    ));

    // ── Signal bus consumer: feeds the trading engine ─────────────────────
    {
        let mut rx = bus.subscribe();
        let trading_engine = trading_engine.clone();
        let exchange = trading_exchange.clone();
        let state = state.clone();
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                let free_usdt = exchange.fetch_balance("USDT").await.unwrap_or_default();
                match trading_engine.intake_signal(&signal, free_usdt).await {
                    IntakeOutcome::Opened(trade) => {
                        info!(symbol = %trade.symbol, side = %trade.side, "trade opened");
                        state.push_event(DashboardEvent::TradeOpened { trade });
                    }
                    IntakeOutcome::Cancelled(trade) => {
                        warn!(symbol = %trade.symbol, "trade cancelled after market order failure");
                        state.push_event(DashboardEvent::TradeClosed { trade });
                    }
                    IntakeOutcome::Rejected(reason) => {
                        info!(symbol = %signal.symbol, %reason, "signal rejected at intake");
                    }
                }
                state.push_event(DashboardEvent::NewSignal { signal: (*signal).clone() });
            }
        });
    }

    // ── Scanner loop: continuous small batches, full scan every N cycles ──
    {
        let scanner = scanner.clone();
        let selector = selector.clone();
        let config = config.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let mut cycle: u32 = 0;
            loop {
                tokio::time::sleep(Duration::from_secs(config.scan_interval_seconds)).await;
                if state.is_paused() {
                    continue;
                }
                cycle += 1;
                let universe = selector.select().await;
                let symbols: Vec<Symbol> = universe.iter().map(|s| s.symbol.clone()).collect();
                if symbols.is_empty() {
                    continue;
                }

                if cycle % config.full_scan_every_n_cycles == 0 {
                    let (batch_size, delay_ms) = scanner.full_scan_batch_plan();
                    scanner.scan_batch(&symbols, batch_size).await;
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                } else {
                    let batch: Vec<Symbol> = symbols.into_iter().take(config.continuous_batch_size).collect();
                    scanner.scan_batch(&batch, batch.len()).await;
                }

                state.push_event(DashboardEvent::ScannerStatus {
                    symbols_scanned: scanner.stats.symbols_scanned.load(std::sync::atomic::Ordering::Relaxed),
                    symbols_errored: scanner.stats.symbols_errored.load(std::sync::atomic::Ordering::Relaxed),
                    signals_emitted: scanner.stats.signals_emitted.load(std::sync::atomic::Ordering::Relaxed),
                });
            }
        });
    }

    // ── Risk loop: trailing stops, staged take-profits, emergency exits ───
    {
        let risk_loop = risk_loop.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RISK_LOOP_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = risk_loop.run_once().await {
                    state.push_error(format!("risk loop pass failed: {e}"));
                }
            }
        });
    }

    // ── Dashboard API ──────────────────────────────────────────────────────
    let bind_addr = std::env::var("SCAN_ENGINE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let api_state = state.clone();
    let api_bind = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&api_bind).await {
            Ok(l) => l,
            Err(e) => {
                error!(%e, addr = %api_bind, "failed to bind dashboard API");
                return;
            }
        };
        info!(addr = %api_bind, "dashboard API listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(%e, "dashboard API server failed");
        }
    });

    info!(symbols = symbols.len(), "scan engine running, press Ctrl+C to stop");

    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to install Ctrl+C handler");
        return 2;
    }
    warn!("shutdown signal received, stopping");

    if let Err(e) = state.config.read().save("config.json") {
        error!(%e, "failed to save config on shutdown");
    }

    130
}
