// =============================================================================
// Simple Moving Average
// =============================================================================

use rust_decimal::Decimal;

use crate::error::CoreError;

/// Simple mean of the trailing `n` samples.
pub fn sma_last(series: &[Decimal], n: usize) -> Result<Decimal, CoreError> {
    if n == 0 {
        return Err(CoreError::Validation("SMA period must be > 0".to_string()));
    }
    if series.len() < n {
        return Err(CoreError::InsufficientData(format!(
            "SMA requires {} samples, got {}",
            n,
            series.len()
        )));
    }
    let window = &series[series.len() - n..];
    let sum: Decimal = window.iter().copied().sum();
    Ok((sum / Decimal::from(n)).round_dp(8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn averages_trailing_window() {
        let series = vec![dec!(1), dec!(2), dec!(3), dec!(4), dec!(5)];
        assert_eq!(sma_last(&series, 3).unwrap(), dec!(4));
    }

    #[test]
    fn insufficient_data_errors() {
        let series = vec![dec!(1), dec!(2)];
        assert!(sma_last(&series, 3).is_err());
    }
}
