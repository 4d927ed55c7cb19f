//! Market data streaming: one reconnecting websocket session per exchange,
//! normalised frames out on `market_data.<exchange>.<symbol>`, and a circuit
//! breaker that serves candles over REST polling while the socket is
//! unhealthy.

use crate::{cache::PriceCache, client::ExecutionClient, error::ExchangeError};
use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use stratus_bus::{key::keys, publish_json, MessageBus};
use stratus_model::{
    event::Alert,
    exchange::ExchangeId,
    instrument::Symbol,
    market::{Candle, CandlePeriod, MarketDataKind, MarketEvent, Ticker},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Exponential backoff between websocket reconnection attempts.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectionBackoffPolicy {
    pub backoff_ms_initial: u64,
    pub backoff_multiplier: u32,
    pub backoff_ms_max: u64,
}

impl Default for ReconnectionBackoffPolicy {
    fn default() -> Self {
        Self {
            backoff_ms_initial: 125,
            backoff_multiplier: 2,
            backoff_ms_max: 60_000,
        }
    }
}

/// Circuit breaker switching symbols to REST polling while the websocket is
/// unhealthy, and back once it recovers.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed sessions before the circuit opens.
    pub failure_threshold: u32,
    /// REST poll cadence while the circuit is open.
    pub poll_interval: Duration,
    /// How long the circuit stays open before a half-open websocket retry.
    pub recovery_after: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            poll_interval: Duration::from_secs(5),
            recovery_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketStreamConfig {
    pub exchange: ExchangeId,
    pub ws_base_url: String,
    pub symbols: Vec<Symbol>,
    pub period: CandlePeriod,
    pub backoff: ReconnectionBackoffPolicy,
    pub breaker: CircuitBreakerConfig,
}

/// Run the market data pipeline for one exchange until the task is aborted.
///
/// `rest` is the same venue's REST surface, used by the circuit breaker's
/// polling fallback.
pub async fn run_market_stream(
    bus: Arc<dyn MessageBus>,
    cache: PriceCache,
    rest: Arc<dyn ExecutionClient>,
    config: MarketStreamConfig,
) {
    let mut backoff_ms = config.backoff.backoff_ms_initial;
    let mut consecutive_failures = 0u32;

    loop {
        info!(exchange = %config.exchange, attempt = consecutive_failures + 1, "market stream connecting");
        match run_session(&bus, &cache, &config).await {
            Ok(()) => {
                // Clean session end (remote close): reconnect promptly.
                consecutive_failures = 0;
                backoff_ms = config.backoff.backoff_ms_initial;
            }
            Err(error) => {
                consecutive_failures += 1;
                warn!(
                    exchange = %config.exchange,
                    %error,
                    consecutive_failures,
                    "market stream session failed"
                );
            }
        }

        if consecutive_failures >= config.breaker.failure_threshold {
            // Circuit open: symbols degrade to REST polling for the recovery
            // window, then a half-open websocket retry.
            let alert = Alert::warning(
                "market_data.degraded",
                format!(
                    "{} websocket unhealthy after {consecutive_failures} failures; polling REST",
                    config.exchange
                ),
            );
            let _ = publish_json(bus.as_ref(), keys::alert("market_data.degraded"), &alert).await;

            poll_rest(&bus, &cache, rest.as_ref(), &config).await;
            consecutive_failures = 0;
            backoff_ms = config.backoff.backoff_ms_initial;
            continue;
        }

        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        backoff_ms = (backoff_ms * config.backoff.backoff_multiplier as u64)
            .min(config.backoff.backoff_ms_max);
    }
}

/// One websocket session: connect, subscribe, pump frames until the socket
/// errors or closes.
async fn run_session(
    bus: &Arc<dyn MessageBus>,
    cache: &PriceCache,
    config: &MarketStreamConfig,
) -> Result<(), ExchangeError> {
    let streams = config
        .symbols
        .iter()
        .flat_map(|symbol| {
            let name = symbol.as_ref().replace('/', "").to_lowercase();
            [
                format!("{name}@kline_{}", config.period.as_str()),
                format!("{name}@trade"),
            ]
        })
        .collect::<Vec<_>>()
        .join("/");
    let url = format!("{}/stream?streams={}", config.ws_base_url, streams);

    let (mut socket, _) = connect_async(url.as_str())
        .await
        .map_err(|error| ExchangeError::Transient(error.to_string()))?;
    info!(exchange = %config.exchange, symbols = config.symbols.len(), "market stream connected");

    while let Some(frame) = socket.next().await {
        let frame = frame.map_err(|error| ExchangeError::Transient(error.to_string()))?;
        match frame {
            Message::Text(text) => {
                if let Some(event) = normalize(config.exchange, &text) {
                    cache.insert(event.exchange, &event.symbol, event.price());
                    let key = keys::market_data(event.exchange, &event.symbol);
                    if let Err(error) = publish_json(bus.as_ref(), key, &event).await {
                        warn!(%error, "market data publish failed");
                    }
                } else {
                    debug!("ignoring unrecognised frame");
                }
            }
            Message::Ping(payload) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|error| ExchangeError::Transient(error.to_string()))?;
            }
            Message::Close(_) => return Ok(()),
            _ => {}
        }
    }
    Ok(())
}

/// REST polling fallback while the circuit is open: latest closed candle per
/// symbol each interval.
async fn poll_rest(
    bus: &Arc<dyn MessageBus>,
    cache: &PriceCache,
    rest: &dyn ExecutionClient,
    config: &MarketStreamConfig,
) {
    let deadline = tokio::time::Instant::now() + config.breaker.recovery_after;
    let mut interval = tokio::time::interval(config.breaker.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    while tokio::time::Instant::now() < deadline {
        interval.tick().await;
        for symbol in &config.symbols {
            match rest.candles(symbol, config.period, 1).await {
                Ok(candles) => {
                    for candle in candles {
                        let event = MarketEvent::new(
                            config.exchange,
                            symbol.clone(),
                            candle.close_time,
                            Utc::now(),
                            MarketDataKind::Candle(candle),
                        );
                        cache.insert(config.exchange, symbol, event.price());
                        let key = keys::market_data(config.exchange, symbol);
                        let _ = publish_json(bus.as_ref(), key, &event).await;
                    }
                }
                Err(error) => {
                    warn!(%symbol, %error, "REST polling fallback failed");
                }
            }
        }
    }
    info!(exchange = %config.exchange, "circuit half-open; retrying websocket");
}

#[derive(Debug, Deserialize)]
struct CombinedFrame {
    #[allow(dead_code)]
    stream: String,
    data: StreamData,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
enum StreamData {
    #[serde(rename = "kline")]
    Kline {
        s: String,
        k: KlinePayload,
    },
    #[serde(rename = "trade")]
    Trade {
        s: String,
        p: Decimal,
        q: Decimal,
        #[serde(rename = "T")]
        time: i64,
    },
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "i")]
    interval: String,
    o: Decimal,
    h: Decimal,
    l: Decimal,
    c: Decimal,
    v: Decimal,
    /// Whether this update closed the bar.
    x: bool,
}

/// Normalise a raw combined-stream frame into a [`MarketEvent`], or `None`
/// for frames we do not consume.
fn normalize(exchange: ExchangeId, text: &str) -> Option<MarketEvent> {
    let frame: CombinedFrame = serde_json::from_str(text).ok()?;
    match frame.data {
        StreamData::Kline { s, k } => {
            let symbol = crate::client::binance_symbol(&s)?;
            let period = match k.interval.as_str() {
                "1m" => CandlePeriod::Minute1,
                "5m" => CandlePeriod::Minute5,
                "15m" => CandlePeriod::Minute15,
                "1h" => CandlePeriod::Hour1,
                "4h" => CandlePeriod::Hour4,
                "1d" => CandlePeriod::Day1,
                _ => return None,
            };
            let close_time = millis(k.close_time);
            Some(MarketEvent::new(
                exchange,
                symbol,
                close_time,
                Utc::now(),
                MarketDataKind::Candle(Candle {
                    period,
                    open_time: millis(k.open_time),
                    close_time,
                    open: k.o,
                    high: k.h,
                    low: k.l,
                    close: k.c,
                    volume: k.v,
                    closed: k.x,
                }),
            ))
        }
        StreamData::Trade { s, p, q, time } => {
            let symbol = crate::client::binance_symbol(&s)?;
            Some(MarketEvent::new(
                exchange,
                symbol,
                millis(time),
                Utc::now(),
                MarketDataKind::Ticker(Ticker::new(p, q)),
            ))
        }
    }
}

fn millis(timestamp: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_millis_opt(timestamp)
        .single()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_normalize_closed_kline() {
        let text = r#"{
            "stream": "btcusdt@kline_1m",
            "data": {
                "e": "kline", "E": 1700000000123, "s": "BTCUSDT",
                "k": {
                    "t": 1700000000000, "T": 1700000059999, "s": "BTCUSDT",
                    "i": "1m", "o": "50000.0", "h": "50100.0", "l": "49950.0",
                    "c": "50050.0", "v": "12.5", "x": true
                }
            }
        }"#;
        let event = normalize(ExchangeId::BinanceSpot, text).unwrap();
        assert_eq!(event.symbol, Symbol::new("BTC/USDT"));
        let candle = event.closed_candle().unwrap();
        assert_eq!(candle.close, dec!(50050.0));
        assert_eq!(candle.period, CandlePeriod::Minute1);
    }

    #[test]
    fn test_normalize_trade_tick() {
        let text = r#"{
            "stream": "ethusdt@trade",
            "data": {"e": "trade", "s": "ETHUSDT", "p": "2000.5", "q": "0.3", "T": 1700000000123}
        }"#;
        let event = normalize(ExchangeId::BinanceSpot, text).unwrap();
        assert_eq!(event.symbol, Symbol::new("ETH/USDT"));
        assert_eq!(event.price(), dec!(2000.5));
        assert!(event.closed_candle().is_none());
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize(ExchangeId::BinanceSpot, "not json").is_none());
        assert!(normalize(ExchangeId::BinanceSpot, r#"{"stream":"x","data":{"e":"depth"}}"#).is_none());
    }
}
