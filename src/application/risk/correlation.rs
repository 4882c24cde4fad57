//! Correlation and concentration limits.
//!
//! Works off static tables: pairwise correlation coefficients keyed
//! `"A:B"` (either ordering), plus the classifier's sector and asset-class
//! maps. A candidate that is already held passes straight through: closing
//! a position never increases concentration.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::CorrelationConfig;
use crate::domain::symbols::{Sector, SymbolClassifier};

/// Outcome of the concentration check; the block reason feeds the filter
/// skip log line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConcentrationCheck {
    Allow,
    Block(String),
}

pub struct CorrelationService {
    config: CorrelationConfig,
    classifier: Arc<SymbolClassifier>,
}

impl CorrelationService {
    pub fn new(config: CorrelationConfig, classifier: Arc<SymbolClassifier>) -> Self {
        Self { config, classifier }
    }

    fn lookup(&self, a: &str, b: &str) -> Option<f64> {
        let table: &HashMap<String, f64> = &self.config.static_correlations;
        table
            .get(&format!("{}:{}", a, b))
            .or_else(|| table.get(&format!("{}:{}", b, a)))
            .copied()
    }

    /// Evaluate a candidate entry against the currently held symbols.
    pub fn check(
        &self,
        candidate: &str,
        held_symbols: &[String],
        max_concurrent_positions: usize,
    ) -> ConcentrationCheck {
        if !self.config.enabled {
            return ConcentrationCheck::Allow;
        }
        // Reversal pass-through.
        if held_symbols.iter().any(|h| h == candidate) {
            return ConcentrationCheck::Allow;
        }

        for held in held_symbols {
            if let Some(corr) = self.lookup(candidate, held)
                && corr > self.config.max_correlation
            {
                return ConcentrationCheck::Block(format!(
                    "correlation {:.2} between {} and held {} exceeds {:.2}",
                    corr, candidate, held, self.config.max_correlation
                ));
            }
        }

        let sector = self.classifier.sector(candidate);
        if sector != Sector::Unknown && max_concurrent_positions > 0 {
            let in_sector = held_symbols
                .iter()
                .filter(|h| self.classifier.sector(h) == sector)
                .count();
            let projected = (in_sector + 1) as f64 / max_concurrent_positions as f64;
            if projected > self.config.max_sector_pct {
                return ConcentrationCheck::Block(format!(
                    "sector {} would hold {:.0}% of book, cap {:.0}%",
                    sector,
                    projected * 100.0,
                    self.config.max_sector_pct * 100.0
                ));
            }
        }

        if let Some(class) = self.classifier.asset_class(candidate)
            && max_concurrent_positions > 0
        {
            let in_class = held_symbols
                .iter()
                .filter(|h| self.classifier.asset_class(h) == Some(class))
                .count();
            let projected = (in_class + 1) as f64 / max_concurrent_positions as f64;
            if projected > self.config.max_asset_class_pct {
                return ConcentrationCheck::Block(format!(
                    "asset class {} would hold {:.0}% of book, cap {:.0}%",
                    class,
                    projected * 100.0,
                    self.config.max_asset_class_pct * 100.0
                ));
            }
        }

        ConcentrationCheck::Allow
    }
}
