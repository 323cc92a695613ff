// =============================================================================
// Indicator Engine (C5)
// =============================================================================
//
// Pure, deterministic, side-effect-free computations over a time-ordered
// candle sequence. Callers are expected to have already cleaned the input
// (ascending timestamps, duplicates collapsed) via `clean_closes`.

pub mod ema;
pub mod rsi;
pub mod sma;

use rust_decimal::Decimal;

use crate::config::Config;
use crate::error::CoreError;
use crate::types::{Candle, Indicators};

/// Removes non-finite values and sorts ascending by open time, collapsing
/// duplicate timestamps by keeping the last occurrence — mirrors the
/// cleaning pass the source applies before any indicator math.
pub fn clean_candles(mut candles: Vec<Candle>) -> Vec<Candle> {
    // Stable sort preserves input order among equal timestamps, so
    // reversing before `dedup_by_key` (which keeps the first of each
    // equal-key run) keeps the last-occurring candle for a given bar.
    candles.sort_by_key(|c| c.t_open_ms);
    candles.reverse();
    candles.dedup_by_key(|c| c.t_open_ms);
    candles.reverse();
    candles
}

/// Computes the full indicator bundle for the latest bar of `candles`.
pub fn compute_indicators(candles: &[Candle], cfg: &Config) -> Result<Indicators, CoreError> {
    let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<Decimal> = candles.iter().map(|c| c.volume).collect();

    let mm1 = ema::ema_last(&closes, cfg.mm1_period as usize)?;
    let center = ema::ema_last(&closes, cfg.center_period as usize)?;
    let rsi = rsi::rsi_last(&closes, cfg.rsi_period as usize)?;
    let volume_sma = sma::sma_last(&volumes, cfg.volume_sma_period as usize)?;

    Ok(Indicators { mm1, center, rsi, volume_sma })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossover {
    Bullish,
    Bearish,
    None,
}

/// Compares only the two most recent EMA samples (weaker than a true cross,
/// kept intentionally — see DESIGN.md's open-question decision).
pub fn detect_crossover(
    mm1_prev: Decimal,
    center_prev: Decimal,
    mm1_curr: Decimal,
    center_curr: Decimal,
) -> Crossover {
    if mm1_prev <= center_prev && mm1_curr > center_curr {
        Crossover::Bullish
    } else if mm1_prev >= center_prev && mm1_curr < center_curr {
        Crossover::Bearish
    } else {
        Crossover::None
    }
}

/// `|mm1 - center| / center`, quantized to 6 decimal places; `0` if
/// `center == 0`.
pub fn ma_distance(mm1: Decimal, center: Decimal) -> Decimal {
    if center.is_zero() {
        return Decimal::ZERO;
    }
    ((mm1 - center).abs() / center).round_dp(6)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpikeIntensity {
    Low,
    Moderate,
    High,
    Extreme,
}

/// Whether the latest volume bar is a spike relative to its trailing
/// average, and at what intensity bucket (ratio thresholds 2/3/5).
pub fn volume_spike(current_volume: Decimal, avg_volume: Decimal, threshold: Decimal) -> Option<SpikeIntensity> {
    if avg_volume.is_zero() {
        return None;
    }
    let ratio = current_volume / avg_volume;
    if ratio < threshold {
        return None;
    }
    Some(if ratio >= Decimal::from(5) {
        SpikeIntensity::Extreme
    } else if ratio >= Decimal::from(3) {
        SpikeIntensity::High
    } else if ratio >= Decimal::from(2) {
        SpikeIntensity::Moderate
    } else {
        SpikeIntensity::Low
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn crossover_detects_bullish() {
        assert_eq!(
            detect_crossover(dec!(10), dec!(11), dec!(12), dec!(11)),
            Crossover::Bullish
        );
    }

    #[test]
    fn crossover_detects_bearish() {
        assert_eq!(
            detect_crossover(dec!(12), dec!(11), dec!(10), dec!(11)),
            Crossover::Bearish
        );
    }

    #[test]
    fn crossover_none_when_no_cross() {
        assert_eq!(
            detect_crossover(dec!(12), dec!(10), dec!(13), dec!(10)),
            Crossover::None
        );
    }

    #[test]
    fn ma_distance_zero_center_is_zero() {
        assert_eq!(ma_distance(dec!(5), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn ma_distance_matches_known_value() {
        // |103-100|/100 = 0.03
        assert_eq!(ma_distance(dec!(103), dec!(100)), dec!(0.03));
    }

    #[test]
    fn volume_spike_buckets() {
        assert_eq!(volume_spike(dec!(250), dec!(100), dec!(2)), Some(SpikeIntensity::Moderate));
        assert_eq!(volume_spike(dec!(600), dec!(100), dec!(2)), Some(SpikeIntensity::Extreme));
        assert_eq!(volume_spike(dec!(150), dec!(100), dec!(2)), None);
    }

    #[test]
    fn volume_spike_zero_avg_is_none() {
        assert_eq!(volume_spike(dec!(10), Decimal::ZERO, dec!(2)), None);
    }

    #[test]
    fn clean_candles_keeps_last_occurrence_of_duplicate_timestamp() {
        let stale = Candle::new(1_000, dec!(1), dec!(1), dec!(1), dec!(1), dec!(1)).unwrap();
        let refreshed = Candle::new(1_000, dec!(2), dec!(2), dec!(2), dec!(2), dec!(2)).unwrap();
        let next = Candle::new(2_000, dec!(3), dec!(3), dec!(3), dec!(3), dec!(3)).unwrap();
        let cleaned = clean_candles(vec![stale, next.clone(), refreshed.clone()]);
        assert_eq!(cleaned, vec![refreshed, next]);
    }
}
