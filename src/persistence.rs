// =============================================================================
// Persistence contract — Store trait + in-memory reference implementation
// =============================================================================
//
// The core treats the database as an external collaborator; this module is
// the seam a real SQL-backed store would fill. `InMemoryStore` makes the
// engine runnable and testable without one, grounded on the same
// parking_lot-guarded collection pattern the position manager uses.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::error::CoreError;
use crate::types::{Asset, Candle, ExitReason, Indicators, Order, OrderStatus, Signal, Symbol, Timeframe, Trade, TradeStatus};

/// A short-lived transactional boundary: writes queued through a session are
/// invisible to the rest of the store until `commit` applies them as one
/// atomic batch. Used by "persist-then-act" call sites (e.g. persisting a
/// PENDING trade before placing the exchange order for it) so a reader never
/// observes a half-written state.
#[async_trait]
pub trait StoreSession: Send + Sync {
    async fn create_trade(&mut self, trade: Trade) -> Result<(), CoreError>;
    async fn update_trade(&mut self, trade: Trade) -> Result<(), CoreError>;
    async fn create_order(&mut self, order: Order) -> Result<(), CoreError>;
    async fn create_signal(&mut self, signal: Signal) -> Result<(), CoreError>;
    async fn commit(self: Box<Self>) -> Result<(), CoreError>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_asset(&self, asset: Asset) -> Result<(), CoreError>;
    async fn bulk_upsert_candles(&self, symbol: &Symbol, timeframe: Timeframe, candles: Vec<Candle>) -> Result<(), CoreError>;
    async fn upsert_indicators(&self, symbol: &Symbol, timeframe: Timeframe, t_ms: i64, indicators: Indicators) -> Result<(), CoreError>;
    async fn create_signal(&self, signal: Signal) -> Result<(), CoreError>;
    async fn create_trade(&self, trade: Trade) -> Result<(), CoreError>;
    async fn update_trade(&self, trade: Trade) -> Result<(), CoreError>;
    async fn close_trade(&self, trade_id: uuid::Uuid, exit_price: Decimal, reason: ExitReason, fees: Decimal) -> Result<Trade, CoreError>;
    async fn list_open_trades(&self) -> Result<Vec<Trade>, CoreError>;
    async fn create_order(&self, order: Order) -> Result<(), CoreError>;
    async fn update_order_status(&self, order_id: uuid::Uuid, status: OrderStatus, filled_qty: Decimal, avg_price: Decimal) -> Result<(), CoreError>;
    /// Opens a session boundary: subsequent writes through the returned
    /// session are staged and only become visible on `commit`.
    async fn session(&self) -> Result<Box<dyn StoreSession>, CoreError>;
}

#[derive(Default)]
struct Tables {
    assets: HashMap<Symbol, Asset>,
    candles: HashMap<(Symbol, &'static str), Vec<Candle>>,
    indicators: HashMap<(Symbol, &'static str, i64), Indicators>,
    signals: Vec<Signal>,
    trades: HashMap<uuid::Uuid, Trade>,
    orders: HashMap<uuid::Uuid, Order>,
}

pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { tables: Arc::new(RwLock::new(Tables::default())) }
    }
}

enum PendingWrite {
    CreateTrade(Trade),
    UpdateTrade(Trade),
    CreateOrder(Order),
    CreateSignal(Signal),
}

pub struct InMemorySession {
    tables: Arc<RwLock<Tables>>,
    pending: Vec<PendingWrite>,
}

#[async_trait]
impl StoreSession for InMemorySession {
    async fn create_trade(&mut self, trade: Trade) -> Result<(), CoreError> {
        self.pending.push(PendingWrite::CreateTrade(trade));
        Ok(())
    }

    async fn update_trade(&mut self, trade: Trade) -> Result<(), CoreError> {
        self.pending.push(PendingWrite::UpdateTrade(trade));
        Ok(())
    }

    async fn create_order(&mut self, order: Order) -> Result<(), CoreError> {
        self.pending.push(PendingWrite::CreateOrder(order));
        Ok(())
    }

    async fn create_signal(&mut self, signal: Signal) -> Result<(), CoreError> {
        self.pending.push(PendingWrite::CreateSignal(signal));
        Ok(())
    }

    /// Applies every staged write in one critical section — the commit is
    /// atomic from any reader's point of view.
    async fn commit(self: Box<Self>) -> Result<(), CoreError> {
        let mut tables = self.tables.write();
        for op in self.pending {
            match op {
                PendingWrite::CreateTrade(t) | PendingWrite::UpdateTrade(t) => {
                    tables.trades.insert(t.id, t);
                }
                PendingWrite::CreateOrder(o) => {
                    tables.orders.insert(o.id, o);
                }
                PendingWrite::CreateSignal(s) => {
                    tables.signals.push(s);
                }
            }
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_asset(&self, asset: Asset) -> Result<(), CoreError> {
        self.tables.write().assets.insert(asset.symbol.clone(), asset);
        Ok(())
    }

    async fn bulk_upsert_candles(&self, symbol: &Symbol, timeframe: Timeframe, candles: Vec<Candle>) -> Result<(), CoreError> {
        let mut tables = self.tables.write();
        let entry = tables.candles.entry((symbol.clone(), timeframe.as_str())).or_default();
        for candle in candles {
            if let Some(existing) = entry.iter_mut().find(|c| c.t_open_ms == candle.t_open_ms) {
                *existing = candle;
            } else {
                entry.push(candle);
            }
        }
        entry.sort_by_key(|c| c.t_open_ms);
        Ok(())
    }

    async fn upsert_indicators(&self, symbol: &Symbol, timeframe: Timeframe, t_ms: i64, indicators: Indicators) -> Result<(), CoreError> {
        self.tables
            .write()
            .indicators
            .insert((symbol.clone(), timeframe.as_str(), t_ms), indicators);
        Ok(())
    }

    async fn create_signal(&self, signal: Signal) -> Result<(), CoreError> {
        self.tables.write().signals.push(signal);
        Ok(())
    }

    async fn create_trade(&self, trade: Trade) -> Result<(), CoreError> {
        self.tables.write().trades.insert(trade.id, trade);
        Ok(())
    }

    async fn update_trade(&self, trade: Trade) -> Result<(), CoreError> {
        let mut tables = self.tables.write();
        if !tables.trades.contains_key(&trade.id) {
            return Err(CoreError::Validation(format!("unknown trade {}", trade.id)));
        }
        tables.trades.insert(trade.id, trade);
        Ok(())
    }

    async fn close_trade(&self, trade_id: uuid::Uuid, exit_price: Decimal, reason: ExitReason, fees: Decimal) -> Result<Trade, CoreError> {
        let mut tables = self.tables.write();
        let trade = tables
            .trades
            .get_mut(&trade_id)
            .ok_or_else(|| CoreError::Validation(format!("unknown trade {trade_id}")))?;
        if trade.status == TradeStatus::Closed || trade.status == TradeStatus::Cancelled {
            return Err(CoreError::Validation(format!("trade {trade_id} already terminal")));
        }
        // The final leg covers whatever quantity is still open; any PnL
        // already booked by earlier staged take-profit legs lives in
        // `realized_pnl` and is folded in here so it isn't lost.
        let (leg_pnl, _) = Trade::compute_pnl(trade.side, trade.entry_price, exit_price, trade.qty, fees);
        let total_pnl = trade.realized_pnl + leg_pnl;
        let notional = trade.entry_price * trade.qty_original;
        let pnl_pct = if notional.is_zero() { Decimal::ZERO } else { (total_pnl / notional) * Decimal::from(100) };
        trade.status = TradeStatus::Closed;
        trade.exit_price = Some(exit_price);
        trade.exit_time = Some(chrono::Utc::now());
        trade.exit_reason = Some(reason);
        trade.pnl = Some(total_pnl);
        trade.pnl_pct = Some(pnl_pct);
        Ok(trade.clone())
    }

    async fn list_open_trades(&self) -> Result<Vec<Trade>, CoreError> {
        Ok(self
            .tables
            .read()
            .trades
            .values()
            .filter(|t| t.status == TradeStatus::Open)
            .cloned()
            .collect())
    }

    async fn create_order(&self, order: Order) -> Result<(), CoreError> {
        self.tables.write().orders.insert(order.id, order);
        Ok(())
    }

    async fn update_order_status(&self, order_id: uuid::Uuid, status: OrderStatus, filled_qty: Decimal, avg_price: Decimal) -> Result<(), CoreError> {
        let mut tables = self.tables.write();
        let order = tables
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| CoreError::Validation(format!("unknown order {order_id}")))?;
        order.status = status;
        order.filled_qty = filled_qty;
        order.avg_price = avg_price;
        Ok(())
    }

    async fn session(&self) -> Result<Box<dyn StoreSession>, CoreError> {
        Ok(Box::new(InMemorySession { tables: self.tables.clone(), pending: Vec::new() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use rust_decimal_macros::dec;

    fn trade(status: TradeStatus) -> Trade {
        Trade {
            id: uuid::Uuid::new_v4(),
            symbol: Symbol::parse("BTC/USDT").unwrap(),
            side: Side::Buy,
            qty: dec!(1),
            entry_price: dec!(100),
            stop_loss: Some(dec!(98)),
            take_profit: None,
            status,
            entry_time: chrono::Utc::now(),
            exit_time: None,
            exit_price: None,
            pnl: None,
            pnl_pct: None,
            exit_reason: None,
            take_profit_levels_hit: vec![false, false, false],
            exchange_order_id: None,
            qty_original: dec!(1),
            realized_pnl: Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn session_writes_invisible_until_commit() {
        let store = InMemoryStore::new();
        let t = trade(TradeStatus::Open);
        let id = t.id;
        let mut session = store.session().await.unwrap();
        session.create_trade(t).await.unwrap();
        // Not yet committed: the store's own view must not see it.
        assert!(store.list_open_trades().await.unwrap().is_empty());
        session.commit().await.unwrap();
        let open = store.list_open_trades().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, id);
    }

    #[tokio::test]
    async fn create_and_list_open_trades() {
        let store = InMemoryStore::new();
        store.create_trade(trade(TradeStatus::Open)).await.unwrap();
        store.create_trade(trade(TradeStatus::Pending)).await.unwrap();
        let open = store.list_open_trades().await.unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn close_trade_computes_pnl_and_is_terminal() {
        let store = InMemoryStore::new();
        let t = trade(TradeStatus::Open);
        let id = t.id;
        store.create_trade(t).await.unwrap();
        let closed = store
            .close_trade(id, dec!(110), ExitReason::TakeProfit, dec!(0))
            .await
            .unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(closed.pnl, Some(dec!(10)));
    }

    #[tokio::test]
    async fn double_close_fails() {
        let store = InMemoryStore::new();
        let t = trade(TradeStatus::Open);
        let id = t.id;
        store.create_trade(t).await.unwrap();
        store.close_trade(id, dec!(110), ExitReason::TakeProfit, dec!(0)).await.unwrap();
        assert!(store.close_trade(id, dec!(111), ExitReason::TakeProfit, dec!(0)).await.is_err());
    }
}
