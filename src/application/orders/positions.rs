//! Position tracking maintenance.
//!
//! Rows live in the store (`position_tracking`); this service owns the
//! mutations. A row is created on the first BUY fill and deleted once the
//! position is flat. Bars refresh the ATR and ratchet the trailing stop;
//! the stop never moves down.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::errors::StoreError;
use crate::domain::repositories::StateRepository;
use crate::domain::types::PositionTracking;

pub struct PositionTracker {
    repository: Arc<dyn StateRepository>,
    trailing_stop_percent: f64,
}

impl PositionTracker {
    pub fn new(repository: Arc<dyn StateRepository>, trailing_stop_percent: f64) -> Self {
        Self {
            repository,
            trailing_stop_percent,
        }
    }

    fn trailing_candidate(&self, price: Decimal) -> Decimal {
        let pct = Decimal::from_f64(self.trailing_stop_percent).unwrap_or_default();
        price * (Decimal::ONE - pct)
    }

    /// Apply a BUY fill: create the row on first entry, otherwise fold the
    /// fill into a weighted average entry price.
    pub async fn apply_buy_fill(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        atr: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let position = match self.repository.get_position(symbol).await? {
            Some(mut existing) => {
                let total = existing.quantity + quantity;
                if total > Decimal::ZERO {
                    existing.entry_price = (existing.entry_price * existing.quantity
                        + price * quantity)
                        / total;
                }
                existing.quantity = total;
                if let Some(atr) = atr {
                    existing.atr_value = atr;
                }
                existing.last_update_at = now;
                existing
            }
            None => {
                info!(symbol, %quantity, %price, "opening tracked position");
                PositionTracking {
                    symbol: symbol.to_string(),
                    quantity,
                    entry_price: price,
                    atr_value: atr.unwrap_or(0.0),
                    trailing_stop_price: self.trailing_candidate(price),
                    last_update_at: now,
                    pending_exit: false,
                }
            }
        };
        self.repository.upsert_position(&position).await
    }

    /// Apply a SELL fill and return the realized PnL. Deletes the row and
    /// its backoff state once flat.
    pub async fn apply_sell_fill(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Decimal, StoreError> {
        let Some(mut position) = self.repository.get_position(symbol).await? else {
            warn!(symbol, "sell fill for untracked position");
            return Ok(Decimal::ZERO);
        };

        let closed = quantity.min(position.quantity);
        let realized = (price - position.entry_price) * closed;
        position.quantity -= quantity;
        position.last_update_at = now;

        if position.quantity <= Decimal::ZERO {
            info!(symbol, %realized, "position flat, dropping tracking row");
            self.repository.delete_position(symbol).await?;
            self.repository.clear_exit_attempts(symbol).await?;
        } else {
            self.repository.upsert_position(&position).await?;
        }
        Ok(realized)
    }

    /// Refresh ATR and ratchet the trailing stop from a new close.
    pub async fn refresh_market_state(
        &self,
        symbol: &str,
        close: Decimal,
        atr: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let Some(mut position) = self.repository.get_position(symbol).await? else {
            return Ok(());
        };

        if let Some(atr) = atr {
            position.atr_value = atr;
        }
        let candidate = self.trailing_candidate(close);
        if candidate > position.trailing_stop_price {
            debug!(
                symbol,
                from = %position.trailing_stop_price,
                to = %candidate,
                "trailing stop raised"
            );
            position.trailing_stop_price = candidate;
        }
        position.last_update_at = now;
        self.repository.upsert_position(&position).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::{Database, SqliteStateRepository};
    use rust_decimal_macros::dec;

    async fn tracker() -> (PositionTracker, Arc<dyn StateRepository>) {
        let db = Database::in_memory().await.unwrap();
        let repo: Arc<dyn StateRepository> = Arc::new(SqliteStateRepository::new(db));
        (PositionTracker::new(repo.clone(), 0.02), repo)
    }

    #[tokio::test]
    async fn buy_fill_creates_row_with_trailing_stop() {
        let (tracker, repo) = tracker().await;
        tracker
            .apply_buy_fill("AAPL", dec!(10), dec!(150), Some(2.0), Utc::now())
            .await
            .unwrap();
        let pos = repo.get_position("AAPL").await.unwrap().unwrap();
        assert_eq!(pos.quantity, dec!(10));
        assert_eq!(pos.entry_price, dec!(150));
        assert_eq!(pos.atr_value, 2.0);
        assert_eq!(pos.trailing_stop_price, dec!(147.00));
        assert!(!pos.pending_exit);
    }

    #[tokio::test]
    async fn second_buy_weights_the_entry_price() {
        let (tracker, repo) = tracker().await;
        tracker
            .apply_buy_fill("AAPL", dec!(10), dec!(100), None, Utc::now())
            .await
            .unwrap();
        tracker
            .apply_buy_fill("AAPL", dec!(10), dec!(110), None, Utc::now())
            .await
            .unwrap();
        let pos = repo.get_position("AAPL").await.unwrap().unwrap();
        assert_eq!(pos.quantity, dec!(20));
        assert_eq!(pos.entry_price, dec!(105));
    }

    #[tokio::test]
    async fn sell_to_flat_deletes_row_and_backoff() {
        let (tracker, repo) = tracker().await;
        tracker
            .apply_buy_fill("AAPL", dec!(10), dec!(100), Some(2.0), Utc::now())
            .await
            .unwrap();
        repo.record_exit_attempt("AAPL", Utc::now(), 1, 300).await.unwrap();

        let realized = tracker
            .apply_sell_fill("AAPL", dec!(10), dec!(110), Utc::now())
            .await
            .unwrap();
        assert_eq!(realized, dec!(100));
        assert!(repo.get_position("AAPL").await.unwrap().is_none());
        assert_eq!(repo.exit_backoff_seconds("AAPL", Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn partial_sell_keeps_the_row() {
        let (tracker, repo) = tracker().await;
        tracker
            .apply_buy_fill("AAPL", dec!(10), dec!(100), None, Utc::now())
            .await
            .unwrap();
        let realized = tracker
            .apply_sell_fill("AAPL", dec!(4), dec!(105), Utc::now())
            .await
            .unwrap();
        assert_eq!(realized, dec!(20));
        let pos = repo.get_position("AAPL").await.unwrap().unwrap();
        assert_eq!(pos.quantity, dec!(6));
    }

    #[tokio::test]
    async fn trailing_stop_only_ratchets_up() {
        let (tracker, repo) = tracker().await;
        tracker
            .apply_buy_fill("AAPL", dec!(10), dec!(100), Some(2.0), Utc::now())
            .await
            .unwrap();

        tracker
            .refresh_market_state("AAPL", dec!(110), Some(2.5), Utc::now())
            .await
            .unwrap();
        let pos = repo.get_position("AAPL").await.unwrap().unwrap();
        assert_eq!(pos.trailing_stop_price, dec!(107.80));
        assert_eq!(pos.atr_value, 2.5);

        // Price retreats: the stop stays put.
        tracker
            .refresh_market_state("AAPL", dec!(104), None, Utc::now())
            .await
            .unwrap();
        let pos = repo.get_position("AAPL").await.unwrap().unwrap();
        assert_eq!(pos.trailing_stop_price, dec!(107.80));
    }

    #[tokio::test]
    async fn untracked_sell_is_a_noop() {
        let (tracker, _repo) = tracker().await;
        let realized = tracker
            .apply_sell_fill("GHOST", dec!(1), dec!(10), Utc::now())
            .await
            .unwrap();
        assert_eq!(realized, Decimal::ZERO);
    }
}
