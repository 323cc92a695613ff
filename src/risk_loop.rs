// =============================================================================
// Risk Loop (C10) — periodic per-position trailing-stop / take-profit / stop
// =============================================================================
//
// Runs every 30s over a read-consistent snapshot of OPEN trades, each
// processed independently. Trailing-stop updates are monotonic-in-favor-
// of-position: a recomputed stop is only written if it's strictly better
// than the one already stored.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::CoreError;
use crate::exchange::ExchangeClient;
use crate::persistence::Store;
use crate::types::{ExitReason, Order, OrderKind, OrderStatus, Side, Trade};

pub const RISK_LOOP_INTERVAL: Duration = Duration::from_secs(30);

pub struct RiskLoop {
    exchange: Arc<ExchangeClient>,
    store: Arc<dyn Store>,
    cfg: Arc<Config>,
}

fn profit_pct(side: Side, entry: Decimal, current: Decimal) -> Decimal {
    match side {
        Side::Buy => (current - entry) / entry,
        Side::Sell => (entry - current) / entry,
    }
}

/// Highest `(trigger_pct, stop_pct)` level whose trigger has been reached,
/// if any.
fn highest_triggered_level(levels: &[(f64, f64)], profit_pct: Decimal) -> Option<(f64, f64)> {
    levels
        .iter()
        .copied()
        .filter(|&(trigger, _)| Decimal::try_from(trigger).map(|t| profit_pct >= t).unwrap_or(false))
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
}

fn trailing_stop_price(side: Side, entry: Decimal, stop_pct: f64) -> Option<Decimal> {
    let stop_pct = Decimal::try_from(stop_pct).ok()?;
    Some(match side {
        Side::Buy => entry * (Decimal::ONE + stop_pct),
        Side::Sell => entry * (Decimal::ONE - stop_pct),
    })
}

/// Whether `candidate` is strictly better than `current` for `side`
/// (higher for BUY, lower for SELL) — the monotonic-in-favor-of-position
/// invariant.
fn is_improvement(side: Side, current: Option<Decimal>, candidate: Decimal) -> bool {
    match current {
        None => true,
        Some(current) => match side {
            Side::Buy => candidate > current,
            Side::Sell => candidate < current,
        },
    }
}

impl RiskLoop {
    pub fn new(exchange: Arc<ExchangeClient>, store: Arc<dyn Store>, cfg: Arc<Config>) -> Self {
        Self { exchange, store, cfg }
    }

    /// Processes one OPEN trade: trailing stop, staged take-profits,
    /// emergency trigger. Returns the (possibly mutated) trade.
    pub async fn process_trade(&self, mut trade: Trade) -> Result<Trade, CoreError> {
        let ticker = self.exchange.fetch_ticker(trade.symbol.as_str()).await?;
        let current_price = ticker.last;
        let pct = profit_pct(trade.side, trade.entry_price, current_price);

        // --- trailing stop ----------------------------------------------------
        if let Some((_, stop_pct)) = highest_triggered_level(&self.cfg.trailing_stop_levels, pct) {
            if let Some(candidate) = trailing_stop_price(trade.side, trade.entry_price, stop_pct) {
                if is_improvement(trade.side, trade.stop_loss, candidate) {
                    trade.stop_loss = Some(candidate);
                    self.store.update_trade(trade.clone()).await?;
                    info!(symbol = %trade.symbol, new_stop = %candidate, "trailing stop advanced");
                }
            }
        }

        // --- staged take-profits ------------------------------------------------
        for (idx, &(level_pct, size_pct)) in self.cfg.take_profit_levels.iter().enumerate() {
            if trade.take_profit_levels_hit.get(idx).copied().unwrap_or(true) {
                continue;
            }
            let Ok(threshold) = Decimal::try_from(level_pct) else { continue };
            if pct < threshold {
                continue;
            }
            let Ok(fraction) = Decimal::try_from(size_pct) else { continue };
            let close_qty = (trade.qty * fraction).floor();
            if close_qty <= Decimal::ZERO {
                continue;
            }
            match self
                .exchange
                .create_market_order(trade.symbol.as_str(), trade.side.opposite(), close_qty)
                .await
            {
                Ok(ack) => {
                    let exit_px = if ack.avg_price > Decimal::ZERO { ack.avg_price } else { current_price };
                    let (leg_pnl, _) = Trade::compute_pnl(trade.side, trade.entry_price, exit_px, close_qty, Decimal::ZERO);
                    trade.qty -= close_qty;
                    trade.realized_pnl += leg_pnl;
                    if let Some(hit) = trade.take_profit_levels_hit.get_mut(idx) {
                        *hit = true;
                    }
                    let tp_order = Order {
                        id: uuid::Uuid::new_v4(),
                        exchange_order_id: Some(ack.exchange_order_id.clone()),
                        kind: OrderKind::TakeProfit,
                        side: trade.side.opposite(),
                        qty: close_qty,
                        price: Some(exit_px),
                        status: OrderStatus::Filled,
                        filled_qty: close_qty,
                        avg_price: exit_px,
                        fees: Decimal::ZERO,
                    };
                    self.store.create_order(tp_order).await?;
                    info!(symbol = %trade.symbol, level = idx, leg_pnl = %leg_pnl, exchange_order_id = %ack.exchange_order_id, "staged take-profit executed");
                    self.store.update_trade(trade.clone()).await?;
                }
                Err(e) => warn!(symbol = %trade.symbol, %e, "staged take-profit order failed"),
            }
        }

        // --- emergency trigger: price crossed our stored stop ----------------
        if let Some(stop) = trade.stop_loss {
            let crossed = match trade.side {
                Side::Buy => current_price <= stop,
                Side::Sell => current_price >= stop,
            };
            if crossed {
                warn!(symbol = %trade.symbol, stop = %stop, price = %current_price, "emergency stop trigger: price crossed stored stop");
                match self.exchange.create_market_order(trade.symbol.as_str(), trade.side.opposite(), trade.qty).await {
                    Ok(ack) => {
                        let exit_price = if ack.avg_price > Decimal::ZERO { ack.avg_price } else { current_price };
                        trade = self.store.close_trade(trade.id, exit_price, ExitReason::StopLoss, Decimal::ZERO).await?;
                    }
                    Err(e) => warn!(symbol = %trade.symbol, %e, "emergency-trigger market close failed"),
                }
            }
        }

        Ok(trade)
    }

    /// One full pass over all OPEN trades. Per-trade errors are logged and
    /// skipped; they never abort the pass.
    pub async fn run_once(&self) -> Result<(), CoreError> {
        let open_trades = self.store.list_open_trades().await?;
        for trade in open_trades {
            let symbol = trade.symbol.clone();
            if let Err(e) = self.process_trade(trade).await {
                warn!(%symbol, %e, "risk loop: error processing trade, skipping");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn highest_triggered_level_picks_max_eligible() {
        let levels = vec![(0.01, 0.005), (0.02, 0.01), (0.04, 0.02)];
        let level = highest_triggered_level(&levels, dec!(0.025));
        assert_eq!(level, Some((0.02, 0.01)));
    }

    #[test]
    fn no_level_triggered_below_first() {
        let levels = vec![(0.01, 0.005)];
        assert_eq!(highest_triggered_level(&levels, dec!(0.005)), None);
    }

    #[test]
    fn trailing_promotion_matches_scenario() {
        // entry 100, BUY, price 102 -> profit 2%, trigger 0.02 -> stop_pct 0.01
        // new stop = 100 * 1.01 = 101.
        let levels = vec![(0.01, 0.005), (0.02, 0.01)];
        let pct = profit_pct(Side::Buy, dec!(100), dec!(102));
        assert_eq!(pct, dec!(0.02));
        let (_, stop_pct) = highest_triggered_level(&levels, pct).unwrap();
        let new_stop = trailing_stop_price(Side::Buy, dec!(100), stop_pct).unwrap();
        assert_eq!(new_stop, dec!(101));
        assert!(is_improvement(Side::Buy, Some(dec!(99)), new_stop));
    }

    #[test]
    fn stop_never_regresses_for_buy() {
        assert!(!is_improvement(Side::Buy, Some(dec!(101)), dec!(100.5)));
        assert!(is_improvement(Side::Buy, Some(dec!(101)), dec!(101.5)));
    }

    #[test]
    fn stop_never_regresses_for_sell() {
        assert!(!is_improvement(Side::Sell, Some(dec!(99)), dec!(99.5)));
        assert!(is_improvement(Side::Sell, Some(dec!(99)), dec!(98.5)));
    }
}
