use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use stratus_model::{exchange::ExchangeId, instrument::Symbol};

/// Short-TTL last-price cache fed by the market streams.
///
/// Serves repeated reads without touching the exchange. The TTL must stay
/// strictly shorter than any trading decision horizon - a stale read is
/// worse than no read.
#[derive(Debug, Clone)]
pub struct PriceCache {
    ttl: Duration,
    prices: Arc<RwLock<HashMap<(ExchangeId, Symbol), (Decimal, Instant)>>>,
}

impl PriceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            prices: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn insert(&self, exchange: ExchangeId, symbol: &Symbol, price: Decimal) {
        self.prices
            .write()
            .insert((exchange, symbol.clone()), (price, Instant::now()));
    }

    /// The cached price, unless it has expired.
    pub fn get(&self, exchange: ExchangeId, symbol: &Symbol) -> Option<Decimal> {
        let prices = self.prices.read();
        let (price, at) = prices.get(&(exchange, symbol.clone()))?;
        (at.elapsed() <= self.ttl).then_some(*price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fresh_hit_and_expiry() {
        let cache = PriceCache::new(Duration::from_millis(50));
        let symbol = Symbol::new("BTC/USDT");

        assert_eq!(cache.get(ExchangeId::Mock, &symbol), None);
        cache.insert(ExchangeId::Mock, &symbol, dec!(50000));
        assert_eq!(cache.get(ExchangeId::Mock, &symbol), Some(dec!(50000)));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get(ExchangeId::Mock, &symbol), None);
    }
}
