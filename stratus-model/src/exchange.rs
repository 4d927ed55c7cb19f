use serde::{Deserialize, Serialize};

/// Unique identifier for an exchange venue.
///
/// ### Notes
/// Spot and derivative APIs of the same operator are distinct variants, since
/// they are served by distinct endpoints with distinct wire formats.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
)]
#[serde(rename = "exchange", rename_all = "snake_case")]
pub enum ExchangeId {
    /// In-process mock venue used for tests and `dry_run` deployments.
    Mock,
    BinanceSpot,
}

impl ExchangeId {
    /// Return the &str representation of this [`ExchangeId`].
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeId::Mock => "mock",
            ExchangeId::BinanceSpot => "binance_spot",
        }
    }
}

impl std::str::FromStr for ExchangeId {
    type Err = crate::error::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mock" => Ok(ExchangeId::Mock),
            "binance_spot" => Ok(ExchangeId::BinanceSpot),
            other => Err(crate::error::ParseError::Exchange(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_exchange_id_str_round_trip() {
        for exchange in [ExchangeId::Mock, ExchangeId::BinanceSpot] {
            assert_eq!(ExchangeId::from_str(exchange.as_str()).unwrap(), exchange);
        }
    }
}
