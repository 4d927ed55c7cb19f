use crate::exchange::ExchangeId;
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, StrExt};
use std::borrow::Borrow;

/// Uppercase `SmolStr` trading pair symbol in internal notation, eg/ "BTC/USDT".
///
/// Exchange specific representations (eg/ Binance "BTCUSDT") are translated at
/// the connector boundary and never leak inward.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, derive_more::Display,
)]
pub struct Symbol(SmolStr);

impl Symbol {
    /// Construct a new uppercase [`Symbol`] from the provided `Into<SmolStr>`.
    pub fn new<S>(symbol: S) -> Self
    where
        S: Into<SmolStr>,
    {
        let symbol = symbol.into();
        if symbol.chars().all(|c| !c.is_lowercase()) {
            Self(symbol)
        } else {
            Self(symbol.to_uppercase_smolstr())
        }
    }

    /// Return the internal `SmolStr` representation.
    pub fn name(&self) -> &SmolStr {
        &self.0
    }

    /// Base asset of the pair ("BTC" of "BTC/USDT"), if the symbol is a pair.
    pub fn base(&self) -> Option<&str> {
        self.0.split_once('/').map(|(base, _)| base)
    }

    /// Quote asset of the pair ("USDT" of "BTC/USDT"), if the symbol is a pair.
    pub fn quote(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, quote)| quote)
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<SmolStr> for Symbol {
    fn from(value: SmolStr) -> Self {
        Self::new(value)
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        self.0.borrow()
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        SmolStr::deserialize(deserializer).map(Symbol::new)
    }
}

/// A [`Symbol`] traded on a specific [`ExchangeId`] venue.
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
    derive_more::Constructor,
)]
#[display("{exchange}:{symbol}")]
pub struct Market {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_uppercases() {
        assert_eq!(Symbol::new("btc/usdt"), Symbol::new("BTC/USDT"));
        assert_eq!(Symbol::new("BTC/USDT").name(), "BTC/USDT");
    }

    #[test]
    fn test_symbol_base_quote() {
        let symbol = Symbol::new("eth/usdt");
        assert_eq!(symbol.base(), Some("ETH"));
        assert_eq!(symbol.quote(), Some("USDT"));
    }
}
