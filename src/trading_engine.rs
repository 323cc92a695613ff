// =============================================================================
// Trading Engine (C9) — signal intake, sizing, order placement, trade FSM
// =============================================================================
//
// Consumes from the Signal Bus on a single logical consumer. Positions are
// protected by a per-symbol guard so two signals for the same symbol can
// never race into duplicate trades. Trade persistence is always consistent:
// a trade is either CANCELLED with a reason or OPEN with an exchange order
// id, never OPEN without one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::config::{Config, Policy};
use crate::error::CoreError;
use crate::exchange::ExchangeClient;
use crate::persistence::Store;
use crate::types::{ExitReason, Order, OrderKind, OrderStatus, Side, Signal, Symbol, Trade, TradeStatus};

pub struct TradingEngine {
    exchange: Arc<ExchangeClient>,
    store: Arc<dyn Store>,
    cfg: Arc<Config>,
    policy: Arc<dyn Policy>,
    symbols_in_flight: Mutex<HashSet<Symbol>>,
    emergency_stop: AtomicBool,
}

pub enum IntakeOutcome {
    Opened(Trade),
    Rejected(String),
    Cancelled(Trade),
}

impl TradingEngine {
    pub fn new(exchange: Arc<ExchangeClient>, store: Arc<dyn Store>, cfg: Arc<Config>, policy: Arc<dyn Policy>) -> Self {
        Self {
            exchange,
            store,
            cfg,
            policy,
            symbols_in_flight: Mutex::new(HashSet::new()),
            emergency_stop: AtomicBool::new(false),
        }
    }

    pub fn set_emergency_stop(&self, active: bool) {
        self.emergency_stop.store(active, Ordering::SeqCst);
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }

    /// Startup reconciliation: loads the durable open-trade set so the
    /// in-memory view matches the store before the engine starts consuming
    /// new signals.
    pub async fn reconcile_at_startup(&self) -> Result<usize, CoreError> {
        let open = self.store.list_open_trades().await?;
        let mut in_flight = self.symbols_in_flight.lock();
        for trade in &open {
            in_flight.insert(trade.symbol.clone());
        }
        info!(count = open.len(), "trading engine reconciled open trades at startup");
        Ok(open.len())
    }

    /// Runs the full signal intake pipeline. Returns `Rejected` for any
    /// validation/admission failure (never persisted); returns `Cancelled`
    /// if the market order failed after a PENDING row was already
    /// persisted; returns `Opened` on success.
    pub async fn intake_signal(&self, signal: &Signal, free_usdt: Decimal) -> IntakeOutcome {
        // --- 1. validate ---------------------------------------------------
        if !signal.kind.is_actionable() {
            return IntakeOutcome::Rejected("signal is NEUTRAL".to_string());
        }
        let side = match Side::try_from(signal.kind) {
            Ok(s) => s,
            Err(e) => return IntakeOutcome::Rejected(e.to_string()),
        };
        if signal.strength < self.policy.signal_threshold() {
            return IntakeOutcome::Rejected(format!(
                "strength {} below threshold {}",
                signal.strength,
                self.policy.signal_threshold()
            ));
        }

        // --- 2. admit --------------------------------------------------------
        if self.is_emergency_stopped() || !self.cfg.trading_enabled {
            return IntakeOutcome::Rejected("trading disabled or emergency stop active".to_string());
        }
        let open_trades = match self.store.list_open_trades().await {
            Ok(trades) => trades,
            Err(e) => return IntakeOutcome::Rejected(format!("failed to list open trades: {e}")),
        };
        if open_trades.len() as u32 >= self.cfg.max_concurrent_trades {
            return IntakeOutcome::Rejected("max concurrent trades reached".to_string());
        }
        if open_trades.iter().any(|t| t.symbol == signal.symbol) {
            return IntakeOutcome::Rejected(format!("{} already has an open trade", signal.symbol));
        }
        {
            let mut in_flight = self.symbols_in_flight.lock();
            if !in_flight.insert(signal.symbol.clone()) {
                return IntakeOutcome::Rejected(format!("{} trade already in flight", signal.symbol));
            }
        }

        let outcome = self.place_trade(signal, side, free_usdt).await;
        self.symbols_in_flight.lock().remove(&signal.symbol);
        outcome
    }

    async fn place_trade(&self, signal: &Signal, side: Side, free_usdt: Decimal) -> IntakeOutcome {
        let price = match self.exchange.fetch_ticker(signal.symbol.as_str()).await {
            Ok(t) => t.last,
            Err(e) => return IntakeOutcome::Rejected(format!("price fetch failed: {e}")),
        };
        if price <= Decimal::ZERO {
            return IntakeOutcome::Rejected("non-positive price".to_string());
        }

        // --- 3. size ---------------------------------------------------------
        let max_pct = Decimal::try_from(self.cfg.max_position_size_percent / 100.0).unwrap_or_default();
        let qty = ((free_usdt * max_pct) / price).floor();
        let min_order = Decimal::try_from(self.cfg.min_order_size_usdt).unwrap_or_default();
        if qty <= Decimal::ZERO || qty * price < min_order {
            return IntakeOutcome::Rejected("sized quantity below minimum order size".to_string());
        }

        // --- 4. initial stop ---------------------------------------------------
        let stop_pct = Decimal::try_from(self.policy.initial_stop_percent()).unwrap_or_default();
        let stop_price = match side {
            Side::Buy => price * (Decimal::ONE - stop_pct),
            Side::Sell => price * (Decimal::ONE + stop_pct),
        };

        let levels = self.cfg.take_profit_levels.len();

        // --- 5. persist PENDING before any order -----------------------------
        let mut trade = Trade {
            id: uuid::Uuid::new_v4(),
            symbol: signal.symbol.clone(),
            side,
            qty,
            entry_price: price,
            stop_loss: Some(stop_price),
            take_profit: None,
            status: TradeStatus::Pending,
            entry_time: chrono::Utc::now(),
            exit_time: None,
            exit_price: None,
            pnl: None,
            pnl_pct: None,
            exit_reason: None,
            take_profit_levels_hit: vec![false; levels],
            exchange_order_id: None,
            qty_original: qty,
            realized_pnl: Decimal::ZERO,
        };
        // Persist-then-act: the PENDING trade must be durable before we act
        // by placing the exchange order, so this write goes through an
        // explicit session boundary rather than a bare fire-and-forget call.
        match self.store.session().await {
            Ok(mut session) => {
                if let Err(e) = session.create_trade(trade.clone()).await {
                    return IntakeOutcome::Rejected(format!("failed to stage PENDING trade: {e}"));
                }
                if let Err(e) = session.commit().await {
                    return IntakeOutcome::Rejected(format!("failed to persist PENDING trade: {e}"));
                }
            }
            Err(e) => return IntakeOutcome::Rejected(format!("failed to open persistence session: {e}")),
        }

        // --- 6. place MARKET, then STOP_LOSS ------------------------------------
        match self.exchange.create_market_order(signal.symbol.as_str(), side, qty).await {
            Ok(ack) => {
                trade.status = TradeStatus::Open;
                trade.entry_price = if ack.avg_price > Decimal::ZERO { ack.avg_price } else { price };
                trade.qty = if ack.filled_qty > Decimal::ZERO { ack.filled_qty } else { qty };
                trade.qty_original = trade.qty;
                trade.exchange_order_id = Some(ack.exchange_order_id.clone());
                if let Err(e) = self.store.update_trade(trade.clone()).await {
                    error!(symbol = %signal.symbol, %e, "failed to persist OPEN trade after market fill");
                }

                let market_order = Order {
                    id: uuid::Uuid::new_v4(),
                    exchange_order_id: Some(ack.exchange_order_id.clone()),
                    kind: OrderKind::Market,
                    side,
                    qty: trade.qty,
                    price: None,
                    status: OrderStatus::Filled,
                    filled_qty: trade.qty,
                    avg_price: trade.entry_price,
                    fees: Decimal::ZERO,
                };
                let _ = self.store.create_order(market_order).await;

                match self
                    .exchange
                    .create_stop_loss_order(signal.symbol.as_str(), side.opposite(), trade.qty, stop_price)
                    .await
                {
                    Ok(stop_ack) => {
                        let stop_order = Order {
                            id: uuid::Uuid::new_v4(),
                            exchange_order_id: Some(stop_ack.exchange_order_id),
                            kind: OrderKind::StopLoss,
                            side: side.opposite(),
                            qty: trade.qty,
                            price: Some(stop_price),
                            status: OrderStatus::New,
                            filled_qty: Decimal::ZERO,
                            avg_price: Decimal::ZERO,
                            fees: Decimal::ZERO,
                        };
                        let _ = self.store.create_order(stop_order).await;
                    }
                    Err(e) => {
                        warn!(symbol = %signal.symbol, %e, "stop-loss placement failed; position is open without exchange-side protection");
                    }
                }

                IntakeOutcome::Opened(trade)
            }
            Err(e) => {
                trade.status = TradeStatus::Cancelled;
                trade.exit_time = Some(chrono::Utc::now());
                trade.exit_reason = Some(ExitReason::Manual);
                if let Err(persist_err) = self.store.update_trade(trade.clone()).await {
                    error!(symbol = %signal.symbol, %persist_err, "failed to persist CANCELLED trade");
                }
                warn!(symbol = %signal.symbol, %e, "market order failed, trade cancelled");
                IntakeOutcome::Cancelled(trade)
            }
        }
    }

    /// Closes all OPEN trades at market and disables trading. Continues past
    /// per-symbol failures so one bad close never blocks the rest; returns
    /// the per-symbol outcome.
    pub async fn emergency_stop_all(&self) -> Vec<(Symbol, Result<(), CoreError>)> {
        self.set_emergency_stop(true);
        let open_trades = match self.store.list_open_trades().await {
            Ok(t) => t,
            Err(e) => {
                error!(%e, "emergency stop: failed to list open trades");
                return Vec::new();
            }
        };
        let mut results = Vec::new();
        for trade in open_trades {
            let outcome = self.close_trade_at_market(&trade, ExitReason::Emergency).await;
            results.push((trade.symbol.clone(), outcome));
        }
        results
    }

    pub async fn close_trade_at_market(&self, trade: &Trade, reason: ExitReason) -> Result<(), CoreError> {
        let ack = self
            .exchange
            .create_market_order(trade.symbol.as_str(), trade.side.opposite(), trade.qty)
            .await?;
        let exit_price = if ack.avg_price > Decimal::ZERO { ack.avg_price } else { trade.entry_price };
        self.store.close_trade(trade.id, exit_price, reason, Decimal::ZERO).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StandardPolicy;
    use crate::persistence::InMemoryStore;
    use crate::rate_limiter::RateLimiter;
    use crate::worker_coordinator::{WorkerClass, WorkerCoordinator};
    use rust_decimal_macros::dec;

    fn engine() -> TradingEngine {
        let cfg = Arc::new(Config::default());
        let limiter = Arc::new(RateLimiter::new(cfg.rate_limit_market_data, cfg.rate_limit_account));
        let coordinator = Arc::new(WorkerCoordinator::new(100.0));
        let exchange = Arc::new(ExchangeClient::new("key", "secret", limiter, coordinator, 1, WorkerClass::Trading));
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let policy: Arc<dyn Policy> = Arc::new(StandardPolicy::from_config(&cfg));
        TradingEngine::new(exchange, store, cfg, policy)
    }

    fn buy_signal(strength: f64) -> Signal {
        Signal {
            id: uuid::Uuid::new_v4(),
            symbol: Symbol::parse("BTC/USDT").unwrap(),
            kind: crate::types::SignalKind::Buy,
            strength,
            rules_triggered: Default::default(),
            snapshot: crate::types::Indicators { mm1: dec!(1), center: dec!(1), rsi: dec!(50), volume_sma: dec!(1) },
            created: chrono::Utc::now(),
            status: crate::types::SignalStatus::Pending,
        }
    }

    #[tokio::test]
    async fn rejects_below_threshold_signal() {
        let engine = engine();
        let outcome = engine.intake_signal(&buy_signal(0.05), dec!(10000)).await;
        assert!(matches!(outcome, IntakeOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn rejects_when_emergency_stopped() {
        let engine = engine();
        engine.set_emergency_stop(true);
        let outcome = engine.intake_signal(&buy_signal(0.9), dec!(10000)).await;
        assert!(matches!(outcome, IntakeOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn neutral_signal_is_rejected() {
        let engine = engine();
        let mut signal = buy_signal(0.9);
        signal.kind = crate::types::SignalKind::Neutral;
        let outcome = engine.intake_signal(&signal, dec!(10000)).await;
        assert!(matches!(outcome, IntakeOutcome::Rejected(_)));
    }
}
