//! Indicator math over bar history. Plain f64; prices convert at the seam.

use rust_decimal::prelude::ToPrimitive;

use crate::domain::types::Bar;

/// Simple moving average of the last `period` closes. `None` while the
/// history is shorter than `period`.
pub fn sma(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }
    let sum: f64 = bars[bars.len() - period..]
        .iter()
        .map(|b| b.close.to_f64().unwrap_or(0.0))
        .sum();
    Some(sum / period as f64)
}

/// Average True Range over `period` bars using true-range averaging.
///
/// TR = max(high - low, |high - prev_close|, |low - prev_close|); needs
/// `period + 1` bars for the previous close of the oldest range.
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let window = &bars[bars.len() - (period + 1)..];
    let mut sum = 0.0;
    for pair in window.windows(2) {
        let prev_close = pair[0].close.to_f64().unwrap_or(0.0);
        let high = pair[1].high.to_f64().unwrap_or(0.0);
        let low = pair[1].low.to_f64().unwrap_or(0.0);
        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        sum += tr;
    }
    Some(sum / period as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal::prelude::FromPrimitive;

    fn bar(close: f64, high: f64, low: f64) -> Bar {
        Bar {
            symbol: "TEST".to_string(),
            timeframe: "1Min".to_string(),
            timestamp: Utc::now(),
            open: Decimal::from_f64(close).unwrap(),
            high: Decimal::from_f64(high).unwrap(),
            low: Decimal::from_f64(low).unwrap(),
            close: Decimal::from_f64(close).unwrap(),
            volume: Decimal::from(1000),
        }
    }

    #[test]
    fn sma_needs_enough_bars() {
        let bars: Vec<Bar> = (1..=4).map(|i| bar(i as f64, i as f64, i as f64)).collect();
        assert_eq!(sma(&bars, 5), None);
        assert_eq!(sma(&bars, 4), Some(2.5));
        assert_eq!(sma(&bars, 2), Some(3.5));
    }

    #[test]
    fn atr_uses_true_range_against_previous_close() {
        // Gap down: high-low is small but |high - prev_close| is large.
        let bars = vec![
            bar(100.0, 101.0, 99.0),
            bar(90.0, 91.0, 89.0),
            bar(90.5, 91.0, 90.0),
        ];
        let atr2 = atr(&bars, 2).unwrap();
        // TR1 = max(2, |91-100|, |89-100|) = 11; TR2 = max(1, 0.5, 0.5) = 1.
        assert!((atr2 - 6.0).abs() < 1e-9);
    }

    #[test]
    fn atr_requires_period_plus_one_bars() {
        let bars: Vec<Bar> = (0..14).map(|i| bar(100.0 + i as f64, 101.0, 99.0)).collect();
        assert_eq!(atr(&bars, 14), None);
        let bars: Vec<Bar> = (0..15).map(|i| bar(100.0 + i as f64, 101.0, 99.0)).collect();
        assert!(atr(&bars, 14).is_some());
    }
}
