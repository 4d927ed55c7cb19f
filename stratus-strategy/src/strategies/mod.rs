//! Built-in strategies, selected by the `strategy_type` tag of their
//! configuration row.

pub mod dca;
pub mod rsi_reversion;
pub mod sma_cross;

pub use dca::Dca;
pub use rsi_reversion::RsiReversion;
pub use sma_cross::SmaCross;
