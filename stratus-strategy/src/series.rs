use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use stratus_model::market::Candle;

/// Bounded ring buffer of the most recent closed bars, oldest first.
///
/// Bounds worker memory: pushing beyond `capacity` evicts the oldest bar.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BarSeries {
    capacity: usize,
    bars: VecDeque<Candle>,
}

impl BarSeries {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            bars: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Append a closed bar, evicting the oldest when full.
    pub fn push(&mut self, candle: Candle) {
        if self.bars.len() == self.capacity {
            self.bars.pop_front();
        }
        self.bars.push_back(candle);
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bar `index` from the oldest (0) to the newest (`len - 1`).
    pub fn get(&self, index: usize) -> Option<&Candle> {
        self.bars.get(index)
    }

    pub fn last(&self) -> Option<&Candle> {
        self.bars.back()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &Candle> {
        self.bars.iter()
    }

    /// Closing prices, oldest first.
    pub fn closes(&self) -> Vec<Decimal> {
        self.bars.iter().map(|bar| bar.close).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use stratus_model::market::CandlePeriod;

    fn candle(close: Decimal) -> Candle {
        Candle {
            period: CandlePeriod::Minute1,
            open_time: Utc::now(),
            close_time: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            closed: true,
        }
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut series = BarSeries::new(3);
        for n in 1..=5 {
            series.push(candle(Decimal::from(n)));
        }
        assert_eq!(series.len(), 3);
        assert_eq!(series.closes(), vec![dec!(3), dec!(4), dec!(5)]);
        assert_eq!(series.last().unwrap().close, dec!(5));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut series = BarSeries::new(4);
        series.push(candle(dec!(10)));
        series.push(candle(dec!(11)));

        let json = serde_json::to_value(&series).unwrap();
        let restored: BarSeries = serde_json::from_value(json).unwrap();
        assert_eq!(restored, series);
    }
}
