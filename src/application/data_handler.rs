//! Per-symbol bar intake.
//!
//! Keeps a bounded in-memory ring per symbol, persists every new bar, and
//! rejects duplicates and out-of-order deliveries so downstream consumers
//! see each symbol's bars exactly once, in broker-emitted order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

use crate::domain::errors::StoreError;
use crate::domain::repositories::StateRepository;
use crate::domain::types::Bar;

const RING_CAPACITY: usize = 200;

pub struct DataHandler {
    repository: Arc<dyn StateRepository>,
    rings: HashMap<String, VecDeque<Bar>>,
    timeframe: String,
}

impl DataHandler {
    pub fn new(repository: Arc<dyn StateRepository>, timeframe: &str) -> Self {
        Self {
            repository,
            rings: HashMap::new(),
            timeframe: timeframe.to_string(),
        }
    }

    /// Ingest one bar. Returns true when the bar is new; duplicates and
    /// stale bars are dropped without touching the store.
    pub async fn ingest(&mut self, bar: &Bar) -> Result<bool, StoreError> {
        if bar.timeframe != self.timeframe {
            debug!(symbol = %bar.symbol, timeframe = %bar.timeframe, "ignoring bar on foreign timeframe");
            return Ok(false);
        }

        let ring = self.rings.entry(bar.symbol.clone()).or_default();
        if let Some(last) = ring.back()
            && bar.timestamp <= last.timestamp
        {
            debug!(
                symbol = %bar.symbol,
                ts = %bar.timestamp,
                "duplicate or out-of-order bar dropped"
            );
            return Ok(false);
        }

        self.repository.insert_bar(bar).await?;
        ring.push_back(bar.clone());
        while ring.len() > RING_CAPACITY {
            ring.pop_front();
        }
        Ok(true)
    }

    /// Latest timestamp seen for a symbol, if any.
    pub fn last_seen(&self, symbol: &str) -> Option<chrono::DateTime<chrono::Utc>> {
        self.rings
            .get(symbol)
            .and_then(|r| r.back())
            .map(|b| b.timestamp)
    }

    pub fn history(&self, symbol: &str) -> Vec<Bar> {
        self.rings
            .get(symbol)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::{Database, SqliteStateRepository};
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn bar(minute: i64) -> Bar {
        Bar {
            symbol: "AAPL".to_string(),
            timeframe: "1Min".to_string(),
            timestamp: Utc::now() + Duration::minutes(minute),
            open: dec!(100),
            high: dec!(101),
            low: dec!(99),
            close: dec!(100.5),
            volume: dec!(1000),
        }
    }

    async fn handler() -> (DataHandler, Arc<dyn StateRepository>) {
        let db = Database::in_memory().await.unwrap();
        let repo: Arc<dyn StateRepository> = Arc::new(SqliteStateRepository::new(db));
        (DataHandler::new(repo.clone(), "1Min"), repo)
    }

    #[tokio::test]
    async fn new_bars_are_persisted_in_order() {
        let (mut handler, repo) = handler().await;
        assert!(handler.ingest(&bar(0)).await.unwrap());
        assert!(handler.ingest(&bar(1)).await.unwrap());
        assert_eq!(repo.recent_bars("AAPL", "1Min", 10).await.unwrap().len(), 2);
        assert_eq!(handler.history("AAPL").len(), 2);
    }

    #[tokio::test]
    async fn duplicates_and_stale_bars_are_dropped() {
        let (mut handler, repo) = handler().await;
        let first = bar(5);
        assert!(handler.ingest(&first).await.unwrap());
        assert!(!handler.ingest(&first).await.unwrap());
        assert!(!handler.ingest(&bar(2)).await.unwrap());
        assert_eq!(repo.recent_bars("AAPL", "1Min", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn foreign_timeframe_is_ignored() {
        let (mut handler, _repo) = handler().await;
        let mut other = bar(0);
        other.timeframe = "5Min".to_string();
        assert!(!handler.ingest(&other).await.unwrap());
    }
}
