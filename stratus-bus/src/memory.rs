use crate::{
    error::BusError,
    key::{DeliveryClass, RoutingPattern},
    AckToken, Delivery, Envelope, MessageBus, Subscription,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Default per-consumer bound for Command-class queues.
pub const DEFAULT_PREFETCH: usize = 64;

/// Default per-consumer bound for MarketData-class queues.
pub const DEFAULT_MARKET_DEPTH: usize = 256;

/// In-memory topic exchange.
///
/// Every `(pattern, group)` pair owns one bounded queue; subscribers sharing
/// the pair compete for deliveries, distinct pairs each receive a copy.
/// Command-class queues reject publishes when full; MarketData-class queues
/// drop their oldest frame instead, signalling `alerts.bus.lagging`.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    bindings: RwLock<Vec<Arc<Binding>>>,
    prefetch: usize,
    market_depth: usize,
}

#[derive(Debug)]
struct Binding {
    pattern: RoutingPattern,
    group: String,
    class: DeliveryClass,
    capacity: usize,
    queue: Mutex<BindingQueue>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct BindingQueue {
    items: VecDeque<Envelope>,
    closed: bool,
    dropped: u64,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_PREFETCH, DEFAULT_MARKET_DEPTH)
    }
}

impl InMemoryBus {
    pub fn new(prefetch: usize, market_depth: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                bindings: RwLock::new(Vec::new()),
                prefetch,
                market_depth,
            }),
        }
    }

    /// Close every binding; `recv` returns `None` once drained.
    pub fn close(&self) {
        for binding in self.inner.bindings.read().iter() {
            binding.queue.lock().closed = true;
            binding.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError> {
        let matching: Vec<Arc<Binding>> = self
            .inner
            .bindings
            .read()
            .iter()
            .filter(|binding| binding.pattern.matches(&envelope.key))
            .cloned()
            .collect();

        let mut lagging = Vec::new();
        for binding in matching {
            let mut queue = binding.queue.lock();
            if queue.closed {
                continue;
            }
            match binding.class {
                DeliveryClass::Command if queue.items.len() >= binding.capacity => {
                    return Err(BusError::QueueFull {
                        group: binding.group.clone(),
                        pattern: binding.pattern.as_str().to_string(),
                    });
                }
                DeliveryClass::MarketData if queue.items.len() >= binding.capacity => {
                    // Never the newest: the oldest frame is the one sacrificed.
                    queue.items.pop_front();
                    queue.dropped += 1;
                    if queue.dropped == 1 || queue.dropped % 1000 == 0 {
                        lagging.push((binding.pattern.clone(), queue.dropped));
                    }
                }
                _ => {}
            }
            queue.items.push_back(envelope.clone());
            binding.notify.notify_one();
        }

        for (pattern, dropped) in lagging {
            warn!(%pattern, dropped, "market data consumer lagging, dropping oldest frames");
            let alert = stratus_model::event::Alert::warning(
                "bus.lagging",
                format!("dropped {dropped} frames for slow consumer on {pattern}"),
            );
            let alert = Envelope::new(
                crate::key::keys::alert("bus.lagging"),
                serde_json::to_value(&alert).unwrap_or_default(),
            );
            // Recursion bottoms out: alert keys are Event class and unbounded.
            Box::pin(self.publish(alert)).await?;
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: RoutingPattern,
        group: &str,
    ) -> Result<Subscription, BusError> {
        let mut bindings = self.inner.bindings.write();

        let binding = bindings
            .iter()
            .find(|binding| binding.pattern == pattern && binding.group == group)
            .cloned()
            .unwrap_or_else(|| {
                let class = pattern.class();
                let capacity = match class {
                    DeliveryClass::Command => self.inner.prefetch,
                    DeliveryClass::MarketData => self.inner.market_depth,
                    DeliveryClass::Event => usize::MAX,
                };
                debug!(%pattern, group, %class, "new bus binding");
                let binding = Arc::new(Binding {
                    pattern: pattern.clone(),
                    group: group.to_string(),
                    class,
                    capacity,
                    queue: Mutex::new(BindingQueue::default()),
                    notify: Notify::new(),
                });
                bindings.push(Arc::clone(&binding));
                binding
            });

        Ok(MemorySubscription { binding }.into())
    }
}

/// Subscriber handle onto one in-memory binding.
#[derive(Debug)]
pub struct MemorySubscription {
    binding: Arc<Binding>,
}

impl MemorySubscription {
    pub(crate) async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let notified = self.binding.notify.notified();
            {
                let mut queue = self.binding.queue.lock();
                if let Some(envelope) = queue.items.pop_front() {
                    let ack = matches!(self.binding.class, DeliveryClass::Command).then(|| {
                        AckToken::Memory(MemoryAck {
                            binding: Arc::clone(&self.binding),
                            envelope: Some(envelope.clone()),
                        })
                    });
                    return Some(Delivery::new(envelope, ack));
                }
                if queue.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

/// Unacked command deliveries are returned to the front of their queue when
/// the token drops, preserving redelivery order.
pub(crate) struct MemoryAck {
    binding: Arc<Binding>,
    envelope: Option<Envelope>,
}

impl MemoryAck {
    pub(crate) fn settle(mut self) {
        self.envelope = None;
    }
}

impl Drop for MemoryAck {
    fn drop(&mut self) {
        if let Some(envelope) = self.envelope.take() {
            let mut queue = self.binding.queue.lock();
            if !queue.closed {
                warn!(key = %envelope.key, "unacked command delivery re-queued");
                queue.items.push_front(envelope);
                self.binding.notify.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{keys, RoutingKey};
    use stratus_model::{exchange::ExchangeId, instrument::Symbol, strategy::StrategyId};

    fn envelope(key: RoutingKey) -> Envelope {
        Envelope::new(key, serde_json::json!({"n": 1}))
    }

    #[tokio::test]
    async fn test_fanout_to_distinct_groups() {
        let bus = InMemoryBus::default();
        let mut a = bus
            .subscribe(RoutingPattern::new("events.#"), "group-a")
            .await
            .unwrap();
        let mut b = bus
            .subscribe(RoutingPattern::new("events.#"), "group-b")
            .await
            .unwrap();

        bus.publish(envelope(keys::trade_executed())).await.unwrap();

        assert_eq!(a.recv().await.unwrap().key(), &keys::trade_executed());
        assert_eq!(b.recv().await.unwrap().key(), &keys::trade_executed());
    }

    #[tokio::test]
    async fn test_competing_consumers_share_one_queue() {
        let bus = InMemoryBus::default();
        let mut a = bus
            .subscribe(RoutingPattern::new("commands.execute_trade"), "connector")
            .await
            .unwrap();
        let _b = bus
            .subscribe(RoutingPattern::new("commands.execute_trade"), "connector")
            .await
            .unwrap();

        bus.publish(envelope(keys::execute_trade())).await.unwrap();

        // Only one copy exists; `a` drains it.
        let delivery = a.recv().await.unwrap();
        delivery.ack().await;
    }

    #[tokio::test]
    async fn test_market_data_drops_oldest_on_overflow() {
        let bus = InMemoryBus::new(DEFAULT_PREFETCH, 2);
        let key = keys::market_data(ExchangeId::Mock, &Symbol::new("BTC/USDT"));
        let mut sub = bus
            .subscribe(RoutingPattern::new("market_data.mock.#"), "worker")
            .await
            .unwrap();

        for n in 0..4 {
            let envelope = Envelope::new(key.clone(), serde_json::json!({ "n": n }));
            bus.publish(envelope).await.unwrap();
        }

        // Frames 0 and 1 were dropped; 2 and 3 survive in order.
        let first = sub.recv().await.unwrap();
        assert_eq!(first.envelope.payload["n"], 2);
        let second = sub.recv().await.unwrap();
        assert_eq!(second.envelope.payload["n"], 3);
    }

    #[tokio::test]
    async fn test_command_queue_full_fails_publish() {
        let bus = InMemoryBus::new(1, DEFAULT_MARKET_DEPTH);
        let _sub = bus
            .subscribe(
                RoutingPattern::new("request.capital.allocation.*"),
                "capital",
            )
            .await
            .unwrap();

        let key = keys::capital_request(StrategyId(1));
        bus.publish(envelope(key.clone())).await.unwrap();
        let result = bus.publish(envelope(key)).await;
        assert!(matches!(result, Err(BusError::QueueFull { .. })));
    }

    #[tokio::test]
    async fn test_unacked_command_redelivered() {
        let bus = InMemoryBus::default();
        let mut sub = bus
            .subscribe(RoutingPattern::new("commands.execute_trade"), "connector")
            .await
            .unwrap();

        bus.publish(envelope(keys::execute_trade())).await.unwrap();

        // Simulate a consumer crash: delivery dropped without ack.
        drop(sub.recv().await.unwrap());

        let redelivered = sub.recv().await.unwrap();
        assert_eq!(redelivered.key(), &keys::execute_trade());
        redelivered.ack().await;
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_close() {
        let bus = InMemoryBus::default();
        let mut sub = bus
            .subscribe(RoutingPattern::new("events.#"), "observer")
            .await
            .unwrap();
        bus.close();
        assert!(sub.recv().await.is_none());
    }
}
