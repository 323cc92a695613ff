// =============================================================================
// Composite scanning rules (R1, R2, R3) and signal aggregation
// =============================================================================

use std::collections::HashSet;

use rust_decimal::Decimal;

use crate::config::Config;
use crate::indicators::{Crossover, SpikeIntensity};
use crate::types::{Indicators, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Buy,
    Sell,
}

#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub rule: &'static str,
    pub direction: Direction,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tf {
    H2,
    H4,
}

/// R1 — MA crossover with RSI confirmation. 4h wins over 2h when both fire
/// (caller is expected to pass 4h last so it overwrites the 2h rule entry
/// with the same `rule` key, or simply prefer keeping both and letting
/// aggregation sum confidences — here we return at most one outcome,
/// preferring 4h).
pub fn r1_crossover_rsi(
    cfg: &Config,
    crossover_2h: Crossover,
    rsi_2h: Decimal,
    crossover_4h: Crossover,
    rsi_4h: Decimal,
) -> Option<RuleOutcome> {
    let rsi_min = Decimal::try_from(cfg.rsi_min).unwrap_or_default();
    let rsi_max = Decimal::try_from(cfg.rsi_max).unwrap_or_default();
    let in_band = |rsi: Decimal| rsi >= rsi_min && rsi <= rsi_max;

    let fire_4h = !matches!(crossover_4h, Crossover::None) && in_band(rsi_4h);
    let fire_2h = !matches!(crossover_2h, Crossover::None) && in_band(rsi_2h);

    if fire_4h {
        let direction = if crossover_4h == Crossover::Bullish { Direction::Buy } else { Direction::Sell };
        return Some(RuleOutcome { rule: "R1_MA_CROSSOVER_RSI", direction, confidence: 0.7 });
    }
    if fire_2h {
        let direction = if crossover_2h == Crossover::Bullish { Direction::Buy } else { Direction::Sell };
        return Some(RuleOutcome { rule: "R1_MA_CROSSOVER_RSI", direction, confidence: 0.6 });
    }
    None
}

/// R2 — MA distance threshold, evaluated independently per timeframe.
pub fn r2_ma_distance(cfg: &Config, tf: Tf, distance: Decimal, mm1: Decimal, center: Decimal) -> Option<RuleOutcome> {
    let (threshold, confidence, rule) = match tf {
        Tf::H2 => (cfg.ma_distance_2h_percent, 0.5, "R2_MA_DISTANCE_2H"),
        Tf::H4 => (cfg.ma_distance_4h_percent, 0.6, "R2_MA_DISTANCE_4H"),
    };
    let threshold = Decimal::try_from(threshold).ok()?;
    if distance < threshold {
        return None;
    }
    let direction = if mm1 > center { Direction::Buy } else { Direction::Sell };
    Some(RuleOutcome { rule, direction, confidence })
}

/// R3 — volume spike with unambiguous MA direction on 2h.
pub fn r3_volume_spike(intensity: Option<SpikeIntensity>, mm1: Decimal, center: Decimal) -> Option<RuleOutcome> {
    let intensity = intensity?;
    if mm1 == center {
        return None;
    }
    let direction = if mm1 > center { Direction::Buy } else { Direction::Sell };
    let confidence = match intensity {
        SpikeIntensity::Low => 0.3,
        SpikeIntensity::Moderate => 0.5,
        SpikeIntensity::High => 0.7,
        SpikeIntensity::Extreme => 0.9,
    };
    Some(RuleOutcome { rule: "R3_VOLUME_SPIKE", direction, confidence })
}

/// Aggregates fired rules into an overall signal per spec.md 4.7 step 4.
pub fn aggregate(outcomes: &[RuleOutcome]) -> (SignalKind, f64, HashSet<String>) {
    let buy: Vec<&RuleOutcome> = outcomes.iter().filter(|o| o.direction == Direction::Buy).collect();
    let sell: Vec<&RuleOutcome> = outcomes.iter().filter(|o| o.direction == Direction::Sell).collect();

    let b: f64 = buy.iter().map(|o| o.confidence).sum();
    let s: f64 = sell.iter().map(|o| o.confidence).sum();

    let triggered = |group: &[&RuleOutcome]| group.iter().map(|o| o.rule.to_string()).collect::<HashSet<_>>();

    if b > 0.0 && s == 0.0 {
        let confidence = b / buy.len() as f64;
        let kind = if buy.len() >= 2 || confidence >= 0.7 { SignalKind::StrongBuy } else { SignalKind::Buy };
        return (kind, confidence, triggered(&buy));
    }
    if s > 0.0 && b == 0.0 {
        let confidence = s / sell.len() as f64;
        let kind = if sell.len() >= 2 || confidence >= 0.7 { SignalKind::StrongSell } else { SignalKind::Sell };
        return (kind, confidence, triggered(&sell));
    }
    if b > 0.0 && s > 0.0 {
        if b >= s * 1.2 {
            return (SignalKind::Buy, b / buy.len() as f64, triggered(&buy));
        }
        if s >= b * 1.2 {
            return (SignalKind::Sell, s / sell.len() as f64, triggered(&sell));
        }
    }
    (SignalKind::Neutral, 0.0, HashSet::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(rule: &'static str, direction: Direction, confidence: f64) -> RuleOutcome {
        RuleOutcome { rule, direction, confidence }
    }

    #[test]
    fn aggregate_pure_buy() {
        let outcomes = vec![outcome("R1", Direction::Buy, 0.6)];
        let (kind, confidence, _) = aggregate(&outcomes);
        assert_eq!(kind, SignalKind::Buy);
        assert_eq!(confidence, 0.6);
    }

    #[test]
    fn aggregate_promotes_strong_buy_on_two_rules() {
        let outcomes = vec![outcome("R1", Direction::Buy, 0.6), outcome("R2", Direction::Buy, 0.5)];
        let (kind, _, _) = aggregate(&outcomes);
        assert_eq!(kind, SignalKind::StrongBuy);
    }

    #[test]
    fn aggregate_conflicting_resolves_by_ratio() {
        // B=0.7, S=0.5, ratio 1.4 >= 1.2 -> BUY
        let outcomes = vec![outcome("R1", Direction::Buy, 0.7), outcome("R2", Direction::Sell, 0.5)];
        let (kind, confidence, _) = aggregate(&outcomes);
        assert_eq!(kind, SignalKind::Buy);
        assert_eq!(confidence, 0.7);
    }

    #[test]
    fn aggregate_conflicting_within_ratio_is_neutral() {
        let outcomes = vec![outcome("R1", Direction::Buy, 0.5), outcome("R2", Direction::Sell, 0.48)];
        let (kind, _, _) = aggregate(&outcomes);
        assert_eq!(kind, SignalKind::Neutral);
    }

    #[test]
    fn r1_prefers_4h_over_2h() {
        use crate::indicators::Crossover;
        let cfg = Config::default();
        let out = r1_crossover_rsi(&cfg, Crossover::Bullish, Decimal::from(50), Crossover::Bearish, Decimal::from(50)).unwrap();
        assert_eq!(out.confidence, 0.7);
        assert_eq!(out.direction, Direction::Sell);
    }

    #[test]
    fn r1_requires_rsi_band() {
        use crate::indicators::Crossover;
        let cfg = Config::default();
        let out = r1_crossover_rsi(&cfg, Crossover::Bullish, Decimal::from(90), Crossover::None, Decimal::from(50));
        assert!(out.is_none());
    }
}
