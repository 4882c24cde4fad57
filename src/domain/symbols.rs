use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// GICS-like sector buckets for concentration checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sector {
    Technology,
    CommunicationServices,
    ConsumerDiscretionary,
    ConsumerStaples,
    Energy,
    Financials,
    Healthcare,
    Industrials,
    Materials,
    RealEstate,
    Utilities,
    Unknown,
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetClass {
    Equity,
    Bond,
    Crypto,
    Commodity,
    RealEstate,
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Static symbol classification: crypto vs equity, sector, asset class.
///
/// The universe is fixed at startup; everything here is a lookup into
/// config-provided tables.
#[derive(Debug, Clone, Default)]
pub struct SymbolClassifier {
    crypto: HashSet<String>,
    equities: HashSet<String>,
    sectors: HashMap<String, Sector>,
    asset_classes: HashMap<String, AssetClass>,
}

impl SymbolClassifier {
    pub fn new(
        crypto: impl IntoIterator<Item = String>,
        equities: impl IntoIterator<Item = String>,
        sectors: HashMap<String, Sector>,
        asset_classes: HashMap<String, AssetClass>,
    ) -> Self {
        Self {
            crypto: crypto.into_iter().collect(),
            equities: equities.into_iter().collect(),
            sectors,
            asset_classes,
        }
    }

    pub fn is_crypto(&self, symbol: &str) -> bool {
        self.crypto.contains(symbol)
    }

    pub fn is_equity(&self, symbol: &str) -> bool {
        self.equities.contains(symbol)
    }

    /// Every tracked symbol, equities first.
    pub fn universe(&self) -> Vec<String> {
        let mut all: Vec<String> = self.equities.iter().cloned().collect();
        all.sort();
        let mut crypto: Vec<String> = self.crypto.iter().cloned().collect();
        crypto.sort();
        all.extend(crypto);
        all
    }

    pub fn sector(&self, symbol: &str) -> Sector {
        self.sectors.get(symbol).copied().unwrap_or(Sector::Unknown)
    }

    /// Explicit mapping wins; otherwise the crypto/equity lists decide.
    pub fn asset_class(&self, symbol: &str) -> Option<AssetClass> {
        if let Some(class) = self.asset_classes.get(symbol) {
            return Some(*class);
        }
        if self.is_crypto(symbol) {
            Some(AssetClass::Crypto)
        } else if self.is_equity(symbol) {
            Some(AssetClass::Equity)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> SymbolClassifier {
        let mut sectors = HashMap::new();
        sectors.insert("AAPL".to_string(), Sector::Technology);
        sectors.insert("XOM".to_string(), Sector::Energy);
        let mut classes = HashMap::new();
        classes.insert("GLD".to_string(), AssetClass::Commodity);
        SymbolClassifier::new(
            vec!["BTC/USD".to_string(), "ETH/USD".to_string()],
            vec!["AAPL".to_string(), "XOM".to_string(), "GLD".to_string()],
            sectors,
            classes,
        )
    }

    #[test]
    fn crypto_and_equity_tags() {
        let c = classifier();
        assert!(c.is_crypto("BTC/USD"));
        assert!(!c.is_crypto("AAPL"));
        assert!(c.is_equity("AAPL"));
        assert!(!c.is_equity("BTC/USD"));
    }

    #[test]
    fn sector_defaults_to_unknown() {
        let c = classifier();
        assert_eq!(c.sector("AAPL"), Sector::Technology);
        assert_eq!(c.sector("BTC/USD"), Sector::Unknown);
    }

    #[test]
    fn asset_class_overrides_and_defaults() {
        let c = classifier();
        assert_eq!(c.asset_class("GLD"), Some(AssetClass::Commodity));
        assert_eq!(c.asset_class("AAPL"), Some(AssetClass::Equity));
        assert_eq!(c.asset_class("ETH/USD"), Some(AssetClass::Crypto));
        assert_eq!(c.asset_class("UNLISTED"), None);
    }

    #[test]
    fn universe_lists_everything_once() {
        let c = classifier();
        let universe = c.universe();
        assert_eq!(universe.len(), 5);
        assert!(universe.contains(&"BTC/USD".to_string()));
        assert!(universe.contains(&"AAPL".to_string()));
    }
}
