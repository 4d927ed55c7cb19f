use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use stratus_model::{exchange::ExchangeId, instrument::Symbol, strategy::StrategyId};

/// Dotted-segment routing key, eg/ `market_data.binance_spot.BTC/USDT`.
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
    derive_more::From,
)]
pub struct RoutingKey(pub SmolStr);

impl RoutingKey {
    pub fn new<S: AsRef<str>>(key: S) -> Self {
        Self(SmolStr::new(key))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// The delivery class this key belongs to.
    pub fn class(&self) -> DeliveryClass {
        DeliveryClass::of(self)
    }
}

/// Constructors for the stable routing-key schema.
pub mod keys {
    use super::*;

    /// `market_data.<exchange>.<symbol>` - connector to workers.
    pub fn market_data(exchange: ExchangeId, symbol: &Symbol) -> RoutingKey {
        RoutingKey::new(format!("market_data.{}.{}", exchange.as_str(), symbol))
    }

    /// `request.capital.allocation.<strategy_id>` - worker to Capital Manager.
    pub fn capital_request(strategy_id: StrategyId) -> RoutingKey {
        RoutingKey::new(format!("request.capital.allocation.{strategy_id}"))
    }

    /// `commands.execute_trade` - Capital Manager to connector.
    pub fn execute_trade() -> RoutingKey {
        RoutingKey::new("commands.execute_trade")
    }

    /// `events.trade_executed` - connector to anyone.
    pub fn trade_executed() -> RoutingKey {
        RoutingKey::new("events.trade_executed")
    }

    /// `events.trade_failed` - connector to anyone.
    pub fn trade_failed() -> RoutingKey {
        RoutingKey::new("events.trade_failed")
    }

    /// `events.capital.denied.<strategy_id>` - Capital Manager to worker.
    pub fn capital_denied(strategy_id: StrategyId) -> RoutingKey {
        RoutingKey::new(format!("events.capital.denied.{strategy_id}"))
    }

    /// `alerts.<code>` - anyone to observers.
    pub fn alert(code: &str) -> RoutingKey {
        RoutingKey::new(format!("alerts.{code}"))
    }

    /// `commands.control.<op>` - operator surface to the Core Engine.
    pub fn control(op: &str) -> RoutingKey {
        RoutingKey::new(format!("commands.control.{op}"))
    }

    /// `commands.worker.<strategy_id>` - Core Engine to a specific worker.
    pub fn worker_control(strategy_id: StrategyId) -> RoutingKey {
        RoutingKey::new(format!("commands.worker.{strategy_id}"))
    }

    /// `system.ready` - Core Engine, once reconciliation completes.
    pub fn system_ready() -> RoutingKey {
        RoutingKey::new("system.ready")
    }

    /// `system.halt` - Core Engine, on emergency halt.
    pub fn system_halt() -> RoutingKey {
        RoutingKey::new("system.halt")
    }

    /// `system.clock.tick.<interval>` - scheduler ticks for time-driven
    /// strategies.
    pub fn clock_tick(interval: &str) -> RoutingKey {
        RoutingKey::new(format!("system.clock.tick.{interval}"))
    }

    /// `system.health.<component>` - component heartbeats.
    pub fn health(component: &str) -> RoutingKey {
        RoutingKey::new(format!("system.health.{component}"))
    }
}

/// Subscription pattern over routing keys: `*` matches exactly one dotted
/// segment, `#` matches any remaining tail.
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
    derive_more::From,
)]
pub struct RoutingPattern(pub SmolStr);

impl RoutingPattern {
    pub fn new<S: AsRef<str>>(pattern: S) -> Self {
        Self(SmolStr::new(pattern))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Whether this pattern contains no wildcard segments.
    pub fn is_concrete(&self) -> bool {
        !self.0.split('.').any(|segment| segment == "*" || segment == "#")
    }

    /// Whether `key` matches this pattern.
    pub fn matches(&self, key: &RoutingKey) -> bool {
        let mut pattern = self.0.split('.');
        let mut segments = key.segments();
        loop {
            match (pattern.next(), segments.next()) {
                (Some("#"), _) => return true,
                (Some("*"), Some(_)) => continue,
                (Some(expected), Some(actual)) if expected == actual => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }

    /// The [`DeliveryClass`] consumed through this pattern.
    ///
    /// Patterns must not straddle classes; the class of the pattern root
    /// governs queue bounds and acknowledgement behaviour.
    pub fn class(&self) -> DeliveryClass {
        DeliveryClass::of(&RoutingKey(self.0.clone()))
    }
}

/// Delivery semantics, keyed off the routing-key root.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, derive_more::Display)]
pub enum DeliveryClass {
    /// Durable, consumer-acknowledged, redelivered on unack, bounded queue
    /// (publish fails when saturated).
    Command,
    /// Durable fanout; consumers must be idempotent.
    Event,
    /// Best-effort fanout; bounded queue that drops the oldest frame on
    /// overflow. Per-key FIFO is preserved.
    MarketData,
}

impl DeliveryClass {
    pub fn of(key: &RoutingKey) -> Self {
        let mut segments = key.segments();
        match (segments.next(), segments.next()) {
            (Some("market_data"), _) => DeliveryClass::MarketData,
            (Some("system"), Some("clock")) => DeliveryClass::MarketData,
            (Some("system"), Some("health")) => DeliveryClass::MarketData,
            (Some("commands"), _) | (Some("request"), _) => DeliveryClass::Command,
            _ => DeliveryClass::Event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_single_segment_wildcard() {
        let pattern = RoutingPattern::new("market_data.binance_spot.*");
        assert!(pattern.matches(&RoutingKey::new("market_data.binance_spot.BTC/USDT")));
        assert!(!pattern.matches(&RoutingKey::new("market_data.mock.BTC/USDT")));
        assert!(!pattern.matches(&RoutingKey::new("market_data.binance_spot")));
    }

    #[test]
    fn test_pattern_tail_wildcard() {
        let pattern = RoutingPattern::new("events.#");
        assert!(pattern.matches(&RoutingKey::new("events.trade_executed")));
        assert!(pattern.matches(&RoutingKey::new("events.capital.denied.3")));
        assert!(!pattern.matches(&RoutingKey::new("alerts.reconcile.orphan")));
    }

    #[test]
    fn test_pattern_exact() {
        let pattern = RoutingPattern::new("commands.execute_trade");
        assert!(pattern.is_concrete());
        assert!(pattern.matches(&keys::execute_trade()));
        assert!(!pattern.matches(&RoutingKey::new("commands.execute_trade.x")));
    }

    #[test]
    fn test_delivery_class_of_key() {
        assert_eq!(
            keys::market_data(ExchangeId::Mock, &Symbol::new("BTC/USDT")).class(),
            DeliveryClass::MarketData
        );
        assert_eq!(keys::clock_tick("1m").class(), DeliveryClass::MarketData);
        assert_eq!(keys::health("engine").class(), DeliveryClass::MarketData);
        assert_eq!(keys::execute_trade().class(), DeliveryClass::Command);
        assert_eq!(
            keys::capital_request(StrategyId(9)).class(),
            DeliveryClass::Command
        );
        assert_eq!(keys::trade_executed().class(), DeliveryClass::Event);
        assert_eq!(keys::alert("rate_limit").class(), DeliveryClass::Event);
        assert_eq!(keys::system_ready().class(), DeliveryClass::Event);
    }
}
