// =============================================================================
// Exponential Moving Average
// =============================================================================
//
// Smoothing factor alpha = 2/(n+1). Seeded with the series' first value
// (`EMA_0 = series_0`), not an SMA of the first `n` samples — matches the
// `pandas .ewm(span=n, adjust=False)` semantics the source relies on.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::CoreError;

/// Computes the full EMA series for `series` with period `n`.
///
/// Returns one EMA value per input sample (`len(output) == len(series)`).
/// Errors with `InsufficientData` if `series.len() < n`.
pub fn ema_series(series: &[Decimal], n: usize) -> Result<Vec<Decimal>, CoreError> {
    if n == 0 {
        return Err(CoreError::Validation("EMA period must be > 0".to_string()));
    }
    if series.len() < n {
        return Err(CoreError::InsufficientData(format!(
            "EMA requires {} samples, got {}",
            n,
            series.len()
        )));
    }

    let alpha = 2.0_f64 / (n as f64 + 1.0);
    let mut out = Vec::with_capacity(series.len());
    let mut prev = series[0];
    out.push(prev);

    for &x in &series[1..] {
        let x_f = x.to_f64().unwrap_or(0.0);
        let prev_f = prev.to_f64().unwrap_or(0.0);
        let next_f = alpha * x_f + (1.0 - alpha) * prev_f;
        prev = Decimal::from_f64_retain(next_f).unwrap_or(prev);
        out.push(prev);
    }

    Ok(out)
}

/// Last value of the EMA series, rounded to 8 decimal places.
pub fn ema_last(series: &[Decimal], n: usize) -> Result<Decimal, CoreError> {
    let full = ema_series(series, n)?;
    Ok(full.last().copied().unwrap_or_default().round_dp(8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ascending(n: usize) -> Vec<Decimal> {
        (1..=n).map(|i| Decimal::from(i)).collect()
    }

    #[test]
    fn empty_series_errors() {
        assert!(ema_series(&[], 5).is_err());
    }

    #[test]
    fn period_zero_errors() {
        assert!(ema_series(&ascending(5), 0).is_err());
    }

    #[test]
    fn insufficient_data_errors() {
        assert!(ema_series(&ascending(3), 5).is_err());
    }

    #[test]
    fn seeds_with_first_raw_value() {
        let series = vec![dec!(10), dec!(20), dec!(30)];
        let out = ema_series(&series, 2).unwrap();
        assert_eq!(out[0], dec!(10));
    }

    #[test]
    fn output_length_matches_input() {
        let series = ascending(30);
        let out = ema_series(&series, 9).unwrap();
        assert_eq!(out.len(), series.len());
    }

    #[test]
    fn known_two_period_sequence() {
        // alpha = 2/3. EMA0=10, EMA1 = 2/3*20 + 1/3*10 = 16.667
        let series = vec![dec!(10), dec!(20)];
        let out = ema_series(&series, 2).unwrap();
        let got = out[1].to_f64().unwrap();
        assert!((got - 16.6666).abs() < 0.01);
    }

    #[test]
    fn period_equals_length_is_ok() {
        let series = ascending(5);
        assert!(ema_series(&series, 5).is_ok());
    }
}
