#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments)]

//! # Stratus-Exchange
//! The only component that talks to external exchanges - the anti-corruption
//! layer. External chaos in, normalised events out:
//!
//! * [`client::ExecutionClient`] - the small internal contract every venue
//!   implements (orders, cancels, balances, candles). Shipping clients:
//!   a Binance-style spot venue and an in-process [`client::mock`] used for
//!   `dry_run` and tests.
//! * [`stream`] - reconnecting websocket market data with a circuit breaker
//!   that falls back to REST polling.
//! * [`limit`] - per-endpoint token buckets sized under published limits.
//! * [`connector`] - the runtime consuming `commands.execute_trade` and
//!   emitting exactly one terminal event per order.
//!
//! Credentials come from an injected [`secret::SecretProvider`] and never
//! appear in logs or messages.

pub mod cache;
pub mod client;
pub mod connector;
pub mod error;
pub mod limit;
pub mod secret;
pub mod stream;
