// =============================================================================
// Relative Strength Index
// =============================================================================
//
// Wilder-equivalent using a rolling mean of gains and losses over `n`.
// Division by zero in the loss side is replaced by machine epsilon; the
// first `n` outputs (where the rolling window isn't full yet) are filled
// with 50 rather than left undefined. Final series clamped to [0,100].

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::CoreError;

const NEUTRAL_RSI: f64 = 50.0;

pub fn rsi_series(series: &[Decimal], n: usize) -> Result<Vec<Decimal>, CoreError> {
    if n == 0 {
        return Err(CoreError::Validation("RSI period must be > 0".to_string()));
    }
    if series.len() < n + 1 {
        return Err(CoreError::InsufficientData(format!(
            "RSI requires {} samples, got {}",
            n + 1,
            series.len()
        )));
    }

    let closes: Vec<f64> = series.iter().map(|d| d.to_f64().unwrap_or(0.0)).collect();
    let mut gains = vec![0.0; closes.len()];
    let mut losses = vec![0.0; closes.len()];
    for i in 1..closes.len() {
        let delta = closes[i] - closes[i - 1];
        gains[i] = delta.max(0.0);
        losses[i] = (-delta).max(0.0);
    }

    let mut out = vec![NEUTRAL_RSI; closes.len()];
    for i in n..closes.len() {
        let avg_gain: f64 = gains[(i - n + 1)..=i].iter().sum::<f64>() / n as f64;
        let avg_loss: f64 = losses[(i - n + 1)..=i].iter().sum::<f64>() / n as f64;
        let safe_loss = if avg_loss == 0.0 { f64::EPSILON } else { avg_loss };
        let rs = avg_gain / safe_loss;
        let rsi = 100.0 - (100.0 / (1.0 + rs));
        out[i] = rsi.clamp(0.0, 100.0);
    }

    Ok(out
        .into_iter()
        .map(|v| Decimal::from_f64_retain(v).unwrap_or(Decimal::from(50)).round_dp(2))
        .collect())
}

pub fn rsi_last(series: &[Decimal], n: usize) -> Result<Decimal, CoreError> {
    Ok(rsi_series(series, n)?.last().copied().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ascending(n: usize) -> Vec<Decimal> {
        (1..=n).map(|i| Decimal::from(i)).collect()
    }

    #[test]
    fn insufficient_data_errors() {
        assert!(rsi_series(&ascending(5), 14).is_err());
    }

    #[test]
    fn output_length_matches_input() {
        let series = ascending(30);
        let out = rsi_series(&series, 14).unwrap();
        assert_eq!(out.len(), series.len());
    }

    #[test]
    fn values_within_0_100() {
        let series = ascending(30);
        let out = rsi_series(&series, 14).unwrap();
        for v in out {
            assert!(v >= Decimal::ZERO && v <= Decimal::from(100));
        }
    }

    #[test]
    fn strictly_ascending_series_trends_toward_100() {
        let series = ascending(30);
        let out = rsi_series(&series, 14).unwrap();
        assert!(out.last().unwrap() > &dec!(90));
    }

    #[test]
    fn flat_series_yields_neutral_fill() {
        let series = vec![dec!(100); 20];
        let out = rsi_series(&series, 14).unwrap();
        // all-zero deltas -> avg_loss == 0 -> epsilon guard -> rs huge -> ~100,
        // except the warm-up region which is filled with 50.
        assert_eq!(out[0], dec!(50));
    }
}
