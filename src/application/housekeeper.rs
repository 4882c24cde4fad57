//! Recurring maintenance: equity snapshots, the daily reset, and the
//! market-open circuit-breaker reset.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info};

use crate::application::risk::circuit_breaker::CircuitBreaker;
use crate::domain::errors::StoreError;
use crate::domain::ports::Broker;
use crate::domain::repositories::StateRepository;
use crate::domain::session::TradingSession;
use crate::domain::types::state_keys;

pub struct Housekeeper {
    repository: Arc<dyn StateRepository>,
    broker: Arc<dyn Broker>,
    breaker: Arc<CircuitBreaker>,
    session: TradingSession,
}

impl Housekeeper {
    pub fn new(
        repository: Arc<dyn StateRepository>,
        broker: Arc<dyn Broker>,
        breaker: Arc<CircuitBreaker>,
        session: TradingSession,
    ) -> Self {
        Self {
            repository,
            broker,
            breaker,
            session,
        }
    }

    /// One housekeeping pass: snapshot equity, then run the daily reset and
    /// breaker reset when their windows arrive.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.snapshot_equity(now).await;
        self.daily_reset(now).await?;
        self.breaker_reset_at_open(now).await?;
        Ok(())
    }

    async fn snapshot_equity(&self, now: DateTime<Utc>) {
        match self.broker.get_account().await {
            Ok(account) => {
                if let Err(e) = self
                    .repository
                    .insert_equity_snapshot(now, account.portfolio_value)
                    .await
                {
                    error!(error = %e, "failed to persist equity snapshot");
                }
            }
            Err(e) => {
                error!(error = %e, "account fetch failed, skipping equity snapshot");
            }
        }
    }

    /// Clear the daily counters once per exchange-local weekday, at or
    /// after the session open.
    async fn daily_reset(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        if !self.session.past_open_today(now) {
            return Ok(());
        }
        let today = self.session.local_date(now).to_string();
        let last = self
            .repository
            .get_state(state_keys::DAILY_RESET_DATE)
            .await?;
        if last.as_deref() == Some(today.as_str()) {
            return Ok(());
        }

        self.repository
            .set_state(state_keys::DAILY_TRADE_COUNT, "0")
            .await?;
        self.repository
            .set_state(state_keys::DAILY_REALIZED_PNL, "0")
            .await?;
        self.repository
            .set_state(state_keys::DAILY_RESET_DATE, &today)
            .await?;
        self.breaker.reset().await?;
        info!(date = %today, "daily counters reset");
        Ok(())
    }

    /// Reset the breaker once per day, but only while the broker clock says
    /// the market is actually open.
    async fn breaker_reset_at_open(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let clock = match self.broker.get_clock().await {
            Ok(clock) => clock,
            Err(e) => {
                error!(error = %e, "clock fetch failed, skipping breaker reset check");
                return Ok(());
            }
        };
        if !clock.is_open {
            return Ok(());
        }
        let today = self.session.local_date(now).to_string();
        let last = self
            .repository
            .get_state(state_keys::BREAKER_RESET_DATE)
            .await?;
        if last.as_deref() == Some(today.as_str()) {
            return Ok(());
        }
        self.breaker.reset().await?;
        self.repository
            .set_state(state_keys::BREAKER_RESET_DATE, &today)
            .await?;
        Ok(())
    }
}
