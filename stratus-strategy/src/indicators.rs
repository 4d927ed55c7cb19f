//! Indicator math over closed bars. All functions are pure and return `None`
//! until enough history has accumulated.

use crate::series::BarSeries;
use rust_decimal::Decimal;

/// Simple moving average of the final `period` values.
pub fn sma(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: Decimal = values[values.len() - period..].iter().copied().sum();
    Some(sum / Decimal::from(period as u64))
}

/// Exponential moving average over all supplied values, seeded with the first.
pub fn ema(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let multiplier = Decimal::from(2u64) / Decimal::from(period as u64 + 1);
    let mut value = values[0];
    for price in &values[1..] {
        value = (*price - value) * multiplier + value;
    }
    Some(value)
}

/// Relative Strength Index with Wilder smoothing.
pub fn rsi(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }

    let mut gain_sum = Decimal::ZERO;
    let mut loss_sum = Decimal::ZERO;
    for window in values[..period + 1].windows(2) {
        let delta = window[1] - window[0];
        if delta >= Decimal::ZERO {
            gain_sum += delta;
        } else {
            loss_sum -= delta;
        }
    }
    let period_dec = Decimal::from(period as u64);
    let mut avg_gain = gain_sum / period_dec;
    let mut avg_loss = loss_sum / period_dec;

    for window in values[period..].windows(2) {
        let delta = window[1] - window[0];
        let (gain, loss) = if delta >= Decimal::ZERO {
            (delta, Decimal::ZERO)
        } else {
            (Decimal::ZERO, -delta)
        };
        avg_gain = (avg_gain * (period_dec - Decimal::ONE) + gain) / period_dec;
        avg_loss = (avg_loss * (period_dec - Decimal::ONE) + loss) / period_dec;
    }

    if avg_loss.is_zero() {
        return Some(Decimal::ONE_HUNDRED);
    }
    let rs = avg_gain / avg_loss;
    Some(Decimal::ONE_HUNDRED - Decimal::ONE_HUNDRED / (Decimal::ONE + rs))
}

/// True range of bar `index` in the series.
fn true_range(series: &BarSeries, index: usize) -> Option<Decimal> {
    let bar = series.get(index)?;
    let high_low = bar.high - bar.low;
    match index.checked_sub(1).and_then(|prev| series.get(prev)) {
        Some(prev) => {
            let high_close = (bar.high - prev.close).abs();
            let low_close = (bar.low - prev.close).abs();
            Some(high_low.max(high_close).max(low_close))
        }
        None => Some(high_low),
    }
}

/// Average True Range with Wilder smoothing over the final bars of `series`.
pub fn atr(series: &BarSeries, period: usize) -> Option<Decimal> {
    if period == 0 || series.len() < period + 1 {
        return None;
    }

    let period_dec = Decimal::from(period as u64);
    let mut value = Decimal::ZERO;
    for index in 1..=period {
        value += true_range(series, index)?;
    }
    value /= period_dec;

    for index in period + 1..series.len() {
        value = (value * (period_dec - Decimal::ONE) + true_range(series, index)?) / period_dec;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use stratus_model::market::{Candle, CandlePeriod};

    fn decimals(values: &[i64]) -> Vec<Decimal> {
        values.iter().map(|v| Decimal::from(*v)).collect()
    }

    #[test]
    fn test_sma_requires_full_period() {
        let values = decimals(&[1, 2, 3]);
        assert_eq!(sma(&values, 4), None);
        assert_eq!(sma(&values, 3), Some(dec!(2)));
        assert_eq!(sma(&values, 2), Some(dec!(2.5)));
    }

    #[test]
    fn test_ema_converges_toward_recent_values() {
        let values = decimals(&[10, 10, 10, 20, 20, 20]);
        let ema = ema(&values, 3).unwrap();
        assert!(ema > dec!(15) && ema < dec!(20));
    }

    #[test]
    fn test_rsi_extremes() {
        // Monotonic rise: RSI pegged at 100.
        let rising = decimals(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(rsi(&rising, 5), Some(Decimal::ONE_HUNDRED));

        // Monotonic fall: RSI at 0.
        let falling = decimals(&[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(rsi(&falling, 5), Some(Decimal::ZERO));
    }

    fn bar(high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            period: CandlePeriod::Minute1,
            open_time: Utc::now(),
            close_time: Utc::now(),
            open: close,
            high,
            low,
            close,
            volume: dec!(1),
            closed: true,
        }
    }

    #[test]
    fn test_atr_constant_range() {
        let mut series = BarSeries::new(16);
        // Every bar spans exactly 2 with no gaps: ATR must be 2.
        for n in 0..8 {
            let base = Decimal::from(10 + n);
            series.push(bar(base + dec!(2), base, base + dec!(1)));
        }
        let atr = atr(&series, 4).unwrap();
        assert!(atr >= dec!(2) && atr < dec!(2.5));
    }

    #[test]
    fn test_atr_needs_history() {
        let mut series = BarSeries::new(16);
        series.push(bar(dec!(12), dec!(10), dec!(11)));
        assert_eq!(atr(&series, 4), None);
    }
}
