use crate::{
    error::BusError,
    key::{DeliveryClass, RoutingKey, RoutingPattern},
    AckToken, Delivery, Envelope, MessageBus, Subscription,
};
use async_trait::async_trait;
use futures::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::fmt::Debug;
use tracing::{debug, warn};
use uuid::Uuid;

/// Retention hint for durable streams - old entries are trimmed approximately
/// beyond this count.
const STREAM_MAXLEN: usize = 16_384;

/// Durable queue family of a command-class key or pattern.
///
/// The routing schema is a stable contract, which lets the broker shard
/// command queues by family: all capital allocation requests share one stream
/// (the Capital Manager subscribes with a trailing wildcard), operator
/// commands share another, and remaining command keys map to their own stream
/// (eg/ per-worker stop queues). Wildcard tails are stripped so a concrete
/// key and the pattern that consumes it agree on the stream name.
fn queue_family(key: &str) -> String {
    if key.starts_with("request.capital.allocation") {
        "request.capital.allocation".to_string()
    } else if key.starts_with("commands.control") {
        "commands.control".to_string()
    } else {
        key.split('.')
            .take_while(|segment| *segment != "*" && *segment != "#")
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Poll block interval for consumer-group reads.
const BLOCK_MS: usize = 1_000;

/// Redis-backed broker for multi-process deployments.
///
/// * Command class - one stream per queue family (`request.capital.allocation`,
///   `commands.execute_trade`, ...) consumed through consumer groups with
///   explicit XACK; unacked entries stay in the pending list and are replayed
///   to the group on restart.
/// * Event class - a single `events` stream per deployment, consumer group per
///   subscriber group, acked on delivery (consumers are idempotent by
///   contract).
/// * MarketData class - plain pub/sub channels; best-effort by design.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    manager: ConnectionManager,
    namespace: String,
}

impl Debug for RedisBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBus")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl RedisBus {
    /// Connect to the broker at `url`, namespacing every key under
    /// `namespace` so deployments can share one Redis.
    pub async fn connect(url: &str, namespace: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)
            .map_err(|error| BusError::Unavailable(error.to_string()))?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            manager,
            namespace: namespace.to_string(),
        })
    }

    /// Stream carrying the durable queue family of `key`.
    fn command_stream(&self, key: &str) -> String {
        format!("{}:q:{}", self.namespace, queue_family(key))
    }

    fn events_stream(&self) -> String {
        format!("{}:events", self.namespace)
    }

    fn channel(&self, key: &RoutingKey) -> String {
        format!("{}:md:{}", self.namespace, key)
    }

    /// Redis glob for a market-data subscription pattern. Our `*`/`#` both
    /// widen to the redis `*` glob; exact matching is re-checked client-side.
    fn channel_glob(&self, pattern: &RoutingPattern) -> String {
        let glob = pattern
            .as_str()
            .split('.')
            .map(|segment| match segment {
                "*" | "#" => "*",
                other => other,
            })
            .collect::<Vec<_>>()
            .join(".");
        format!("{}:md:{}", self.namespace, glob)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            // Group already exists - fine, we are re-attaching.
            Err(error) if error.code() == Some("BUSYGROUP") => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn xadd(&self, stream: &str, json: &str) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        redis::cmd("XADD")
            .arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAXLEN)
            .arg("*")
            .arg("envelope")
            .arg(json)
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError> {
        let json = serde_json::to_string(&envelope).map_err(|error| BusError::Payload {
            key: envelope.key.clone(),
            error: error.to_string(),
        })?;

        match envelope.key.class() {
            DeliveryClass::Command => {
                let stream = self.command_stream(envelope.key.as_str());
                self.xadd(&stream, &json).await
            }
            DeliveryClass::Event => self.xadd(&self.events_stream(), &json).await,
            DeliveryClass::MarketData => {
                let mut conn = self.manager.clone();
                conn.publish::<_, _, ()>(self.channel(&envelope.key), json)
                    .await?;
                Ok(())
            }
        }
    }

    async fn subscribe(
        &self,
        pattern: RoutingPattern,
        group: &str,
    ) -> Result<Subscription, BusError> {
        match pattern.class() {
            DeliveryClass::MarketData => {
                let conn = self
                    .client
                    .get_async_connection()
                    .await
                    .map_err(BusError::from)?;
                let mut pubsub = conn.into_pubsub();
                pubsub.psubscribe(self.channel_glob(&pattern)).await?;
                debug!(%pattern, group, "redis pub/sub subscription");
                Ok(RedisSubscription::PubSub {
                    messages: Box::pin(pubsub.into_on_message()),
                    pattern,
                }
                .into())
            }
            class => {
                let stream = match class {
                    DeliveryClass::Command => self.command_stream(pattern.as_str()),
                    _ => self.events_stream(),
                };
                self.ensure_group(&stream, group).await?;
                let conn = self
                    .client
                    .get_async_connection()
                    .await
                    .map_err(BusError::from)?;
                debug!(%pattern, group, stream, "redis stream subscription");
                Ok(RedisSubscription::Stream {
                    conn,
                    ack_conn: self.manager.clone(),
                    stream,
                    group: group.to_string(),
                    consumer: format!("consumer-{}", Uuid::new_v4().simple()),
                    pattern,
                    auto_ack: matches!(class, DeliveryClass::Event),
                    backlog_done: false,
                }
                .into())
            }
        }
    }
}

/// Subscriber handle onto a Redis stream consumer group or pub/sub pattern.
pub enum RedisSubscription {
    Stream {
        conn: redis::aio::Connection,
        ack_conn: ConnectionManager,
        stream: String,
        group: String,
        consumer: String,
        pattern: RoutingPattern,
        auto_ack: bool,
        /// Pending entries from a previous incarnation are drained first.
        backlog_done: bool,
    },
    PubSub {
        messages: futures::stream::BoxStream<'static, redis::Msg>,
        pattern: RoutingPattern,
    },
}

impl Debug for RedisSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedisSubscription::Stream { stream, group, .. } => f
                .debug_struct("RedisSubscription::Stream")
                .field("stream", stream)
                .field("group", group)
                .finish(),
            RedisSubscription::PubSub { pattern, .. } => f
                .debug_struct("RedisSubscription::PubSub")
                .field("pattern", pattern)
                .finish(),
        }
    }
}

/// `XREADGROUP` reply shape: `[(stream, [(id, [(field, value), ...]), ...])]`.
type ReadReply = Vec<(String, Vec<(String, Vec<(String, String)>)>)>;

impl RedisSubscription {
    pub(crate) async fn recv(&mut self) -> Option<Delivery> {
        match self {
            RedisSubscription::PubSub { messages, pattern } => loop {
                let msg = messages.next().await?;
                let json: String = match msg.get_payload() {
                    Ok(json) => json,
                    Err(error) => {
                        warn!(%error, "discarding non-utf8 market data frame");
                        continue;
                    }
                };
                match serde_json::from_str::<Envelope>(&json) {
                    Ok(envelope) if pattern.matches(&envelope.key) => {
                        return Some(Delivery::new(envelope, None));
                    }
                    Ok(_) => continue,
                    Err(error) => {
                        warn!(%error, "discarding undecodable market data frame");
                        continue;
                    }
                }
            },
            RedisSubscription::Stream {
                conn,
                ack_conn,
                stream,
                group,
                consumer,
                pattern,
                auto_ack,
                backlog_done,
            } => loop {
                let cursor = if *backlog_done { ">" } else { "0" };
                let reply: ReadReply = redis::cmd("XREADGROUP")
                    .arg("GROUP")
                    .arg(group.as_str())
                    .arg(consumer.as_str())
                    .arg("COUNT")
                    .arg(1)
                    .arg("BLOCK")
                    .arg(BLOCK_MS)
                    .arg("STREAMS")
                    .arg(stream.as_str())
                    .arg(cursor)
                    .query_async(conn)
                    .await
                    .unwrap_or_default();

                let entry = reply
                    .into_iter()
                    .next()
                    .and_then(|(_, entries)| entries.into_iter().next());

                let Some((id, fields)) = entry else {
                    // Empty backlog read means the pending list is drained.
                    *backlog_done = true;
                    continue;
                };

                let ack = RedisAck {
                    conn: ack_conn.clone(),
                    stream: stream.clone(),
                    group: group.clone(),
                    id: id.clone(),
                };

                let Some(json) = fields
                    .into_iter()
                    .find_map(|(field, value)| (field == "envelope").then_some(value))
                else {
                    ack.settle().await;
                    continue;
                };

                match serde_json::from_str::<Envelope>(&json) {
                    Ok(envelope) if pattern.matches(&envelope.key) => {
                        if *auto_ack {
                            ack.settle().await;
                            return Some(Delivery::new(envelope, None));
                        }
                        return Some(Delivery::new(envelope, Some(AckToken::Redis(ack))));
                    }
                    Ok(_) => {
                        // Same stream, different consumer's key family filter.
                        ack.settle().await;
                        continue;
                    }
                    Err(error) => {
                        warn!(%error, id, stream = stream.as_str(), "discarding undecodable entry");
                        ack.settle().await;
                        continue;
                    }
                }
            },
        }
    }
}

/// Outstanding `XACK` for a consumer-group delivery.
pub(crate) struct RedisAck {
    conn: ConnectionManager,
    stream: String,
    group: String,
    id: String,
}

impl RedisAck {
    pub(crate) async fn settle(mut self) {
        let result: Result<i64, redis::RedisError> = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.id)
            .query_async(&mut self.conn)
            .await;
        if let Err(error) = result {
            warn!(%error, stream = self.stream, id = self.id, "XACK failed; entry will be redelivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_family_publisher_and_consumer_agree() {
        // Publisher keys and the patterns that consume them land on the same
        // stream.
        assert_eq!(
            queue_family("request.capital.allocation.7"),
            queue_family("request.capital.allocation.*")
        );
        assert_eq!(
            queue_family("commands.control.start_strategy"),
            queue_family("commands.control.*")
        );
        assert_eq!(
            queue_family("commands.execute_trade"),
            "commands.execute_trade"
        );
        assert_eq!(queue_family("commands.worker.3"), "commands.worker.3");
        assert_ne!(
            queue_family("commands.worker.3"),
            queue_family("commands.worker.4")
        );
    }
}
