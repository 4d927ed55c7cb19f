#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity)]

//! # Stratus-Bus
//! The sole inter-component transport. Topics are names; routing keys carry
//! structure (`market_data.<exchange>.<symbol>`, `commands.execute_trade`,
//! ...). No Stratus component ever invokes another directly - everything
//! crosses one of the [`MessageBus`] implementations in this crate.
//!
//! Two brokers share the contract:
//! * [`memory::InMemoryBus`] - topic exchange over tokio channels, for tests
//!   and single-process deployments.
//! * [`redis::RedisBus`] - Redis streams for the durable command queues,
//!   pub/sub for events and market data, for multi-process deployments.

use crate::error::BusError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::Debug;

/// Routing keys, patterns, and constructors for the stable key schema.
pub mod key;

/// All [`BusError`] variants.
pub mod error;

/// In-memory topic exchange.
pub mod memory;

/// Redis-backed broker.
pub mod redis;

pub use key::{DeliveryClass, RoutingKey, RoutingPattern};

/// Versioned JSON envelope carried by every bus message. Consumers must
/// ignore unknown fields to allow forward evolution.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Envelope {
    pub v: u8,
    pub key: RoutingKey,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    pub const VERSION: u8 = 1;

    pub fn new(key: RoutingKey, payload: serde_json::Value) -> Self {
        Self {
            v: Self::VERSION,
            key,
            payload,
            published_at: Utc::now(),
        }
    }
}

/// A message handed to a subscriber.
///
/// Command-class deliveries must be [`acked`](Delivery::ack); dropping one
/// unacked re-queues it for redelivery.
#[derive(Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    ack: Option<AckToken>,
}

impl Delivery {
    pub(crate) fn new(envelope: Envelope, ack: Option<AckToken>) -> Self {
        Self { envelope, ack }
    }

    pub fn key(&self) -> &RoutingKey {
        &self.envelope.key
    }

    /// Deserialize the payload into the expected type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_value(self.envelope.payload.clone())
            .map_err(|error| BusError::Payload {
                key: self.envelope.key.clone(),
                error: error.to_string(),
            })
    }

    /// Acknowledge this delivery. A no-op for Event and MarketData classes.
    pub async fn ack(mut self) {
        if let Some(token) = self.ack.take() {
            token.settle().await;
        }
    }
}

/// Backend-specific acknowledgement.
pub(crate) enum AckToken {
    Memory(memory::MemoryAck),
    Redis(redis::RedisAck),
}

impl Debug for AckToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AckToken::Memory(_) => write!(f, "AckToken::Memory"),
            AckToken::Redis(_) => write!(f, "AckToken::Redis"),
        }
    }
}

impl AckToken {
    async fn settle(self) {
        match self {
            AckToken::Memory(ack) => ack.settle(),
            AckToken::Redis(ack) => ack.settle().await,
        }
    }
}

/// A consumer binding created by [`MessageBus::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    inner: SubscriptionInner,
}

#[derive(Debug)]
enum SubscriptionInner {
    Memory(memory::MemorySubscription),
    Redis(redis::RedisSubscription),
}

impl Subscription {
    /// Receive the next delivery, or `None` once the bus has shut down.
    pub async fn recv(&mut self) -> Option<Delivery> {
        match &mut self.inner {
            SubscriptionInner::Memory(sub) => sub.recv().await,
            SubscriptionInner::Redis(sub) => sub.recv().await,
        }
    }
}

impl From<memory::MemorySubscription> for Subscription {
    fn from(sub: memory::MemorySubscription) -> Self {
        Self {
            inner: SubscriptionInner::Memory(sub),
        }
    }
}

impl From<redis::RedisSubscription> for Subscription {
    fn from(sub: redis::RedisSubscription) -> Self {
        Self {
            inner: SubscriptionInner::Redis(sub),
        }
    }
}

/// The transport contract shared by every broker backend.
#[async_trait]
pub trait MessageBus: Send + Sync + Debug {
    /// Publish an [`Envelope`] to all subscriptions whose pattern matches its
    /// key. Command-class publishes fail with [`BusError::QueueFull`] when a
    /// matching consumer's bounded queue is saturated.
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError>;

    /// Bind a consumer to every key matching `pattern`. `group` names the
    /// consumer group for durable classes - subscribers sharing a group
    /// compete for deliveries; distinct groups each receive a copy.
    async fn subscribe(&self, pattern: RoutingPattern, group: &str)
        -> Result<Subscription, BusError>;
}

/// Serialize `payload` and publish it under `key`.
pub async fn publish_json<T: Serialize>(
    bus: &dyn MessageBus,
    key: RoutingKey,
    payload: &T,
) -> Result<(), BusError> {
    let payload = serde_json::to_value(payload).map_err(|error| BusError::Payload {
        key: key.clone(),
        error: error.to_string(),
    })?;
    bus.publish(Envelope::new(key, payload)).await
}
