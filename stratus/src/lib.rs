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

//! # Stratus
//! A distributed, message-bus-driven trading pipeline: market data flows from
//! the Exchange Connector to isolated Strategy Workers, proposals flow to the
//! Capital Manager, approved orders flow back through the connector, and the
//! Core Engine supervises the lot - reconciling the journal against exchange
//! truth before a single order is allowed out.
//!
//! This crate is the Core Engine plus the deployment surface:
//! * [`config`] - the JSON system configuration shared by every binary.
//! * [`logging`] - tracing initialisers (plain and JSON).
//! * [`engine`] - startup sequencing, the State Reconciliation Protocol,
//!   worker supervision, the scheduler, operator commands and health
//!   aggregation.
//! * [`system`] - wiring helpers the four component binaries share.
//!
//! The components themselves live in their own crates (`stratus-bus`,
//! `stratus-store`, `stratus-exchange`, `stratus-strategy`,
//! `stratus-capital`) and in their own OS processes at runtime.

pub mod config;
pub mod engine;
pub mod logging;
pub mod system;

// Consumed by the binaries, not the library.
use clap as _;
