#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity)]

//! # Stratus-Capital
//! The one and only authority that turns a strategy proposal into an
//! `execute_trade` command. Every order in the system originates here.
//!
//! A proposal passes through, in order: portfolio resolution, the portfolio
//! rule chain, position sizing, and an atomic capital reservation. The first
//! failure aborts the pipeline and publishes
//! `events.capital.denied.<strategy_id>` with a stable reason.
//!
//! After the trade, the manager settles terminal events back into positions
//! and the capital ledger - idempotently, keyed by the trade journal's
//! write-once settlement marker.

/// The portfolio rule chain.
pub mod rules;

/// Position sizing models: FixedFractional, VolatilityAdjusted, fractional
/// Kelly.
pub mod sizing;

/// The Capital Manager runtime: proposal intake, settlement, reservation
/// timeout sweeping.
pub mod manager;

pub use manager::{CapitalManager, CapitalManagerConfig};

/// A refusal, carrying the stable reason code surfaced on
/// `events.capital.denied`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub reason: smol_str::SmolStr,
    pub detail: String,
}

impl Denial {
    pub fn new(reason: &str, detail: impl Into<String>) -> Self {
        Self {
            reason: smol_str::SmolStr::new(reason),
            detail: detail.into(),
        }
    }
}

/// All errors produced by the Capital Manager that are not proposal denials.
#[derive(Debug, thiserror::Error)]
pub enum CapitalError {
    #[error("bus error: {0}")]
    Bus(#[from] stratus_bus::error::BusError),

    #[error("store error: {0}")]
    Store(#[from] stratus_store::error::StoreError),
}
