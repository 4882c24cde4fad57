//! Periodic exit scan.
//!
//! Every tracked position is checked against ATR stop, ATR target and
//! trailing stop, in that priority. The fixed-percentage rules in the
//! config exist only for degraded ATR-less operation and are skipped while
//! the ATR is valid; a position without a valid ATR is skipped entirely
//! because no risk level can be formed for it.
//!
//! Lock discipline: `pending_exit` is set only after the exit signal has
//! been published. A failed publish leaves the position unlocked, so a
//! later scan retries instead of dead-locking on a phantom exit.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ExitConfig;
use crate::domain::errors::StoreError;
use crate::domain::events::{Event, ExitSignal};
use crate::domain::ports::{Broker, MarketData};
use crate::domain::repositories::StateRepository;
use crate::domain::symbols::SymbolClassifier;
use crate::domain::types::{ExitReason, PositionTracking};
use crate::infrastructure::event_bus::EventBus;

/// Decide whether a position should be exited at the given price.
///
/// Caller guarantees a valid ATR; the fixed-percentage fallbacks are
/// deliberately not consulted here.
pub fn evaluate_exit_rules(
    position: &PositionTracking,
    price: Decimal,
    config: &ExitConfig,
) -> Option<ExitReason> {
    let entry = position.entry_price.to_f64().unwrap_or(0.0);
    let price_f = price.to_f64().unwrap_or(0.0);
    let atr = position.atr_value;

    if price_f <= entry - atr * config.atr_stop_loss_multiplier {
        return Some(ExitReason::AtrStopLoss);
    }
    if price_f >= entry + atr * config.atr_profit_target_multiplier {
        return Some(ExitReason::AtrProfitTarget);
    }
    if position.trailing_stop_price > Decimal::ZERO && price <= position.trailing_stop_price {
        return Some(ExitReason::TrailingStop);
    }
    None
}

pub struct ExitEngine {
    repository: Arc<dyn StateRepository>,
    broker: Arc<dyn Broker>,
    market_data: Arc<dyn MarketData>,
    classifier: Arc<SymbolClassifier>,
    bus: EventBus,
    config: ExitConfig,
}

impl ExitEngine {
    pub fn new(
        repository: Arc<dyn StateRepository>,
        broker: Arc<dyn Broker>,
        market_data: Arc<dyn MarketData>,
        classifier: Arc<SymbolClassifier>,
        bus: EventBus,
        config: ExitConfig,
    ) -> Self {
        Self {
            repository,
            broker,
            market_data,
            classifier,
            bus,
            config,
        }
    }

    /// One scan over every tracked position. Returns the number of exit
    /// signals published.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let clock = match self.broker.get_clock().await {
            Ok(clock) => Some(clock),
            Err(e) => {
                warn!(error = %e, "clock fetch failed, treating market as closed for this scan");
                None
            }
        };
        let market_open = clock.map(|c| c.is_open).unwrap_or(false);

        let mut published = 0usize;
        for position in self.repository.all_positions().await? {
            if !market_open && !self.classifier.is_crypto(&position.symbol) {
                continue;
            }

            if position.pending_exit {
                let backoff = self
                    .repository
                    .exit_backoff_seconds(&position.symbol, now)
                    .await?;
                if backoff > 0 {
                    debug!(symbol = %position.symbol, backoff, "exit pending, backoff active");
                    continue;
                }
            }

            // No valid ATR, no risk levels.
            if !position.atr_value.is_finite() || position.atr_value <= 0.0 {
                debug!(symbol = %position.symbol, atr = position.atr_value, "skipping position without valid ATR");
                continue;
            }

            let price = match self.market_data.get_snapshot(&position.symbol).await {
                Ok(snapshot) => snapshot.mid(),
                Err(e) => {
                    warn!(symbol = %position.symbol, error = %e, "snapshot fetch failed, skipping");
                    continue;
                }
            };
            if price <= Decimal::ZERO {
                warn!(symbol = %position.symbol, %price, "non-positive snapshot price, skipping");
                continue;
            }

            let Some(reason) = evaluate_exit_rules(&position, price, &self.config) else {
                continue;
            };

            let signal = ExitSignal {
                symbol: position.symbol.clone(),
                quantity: position.quantity,
                reason,
                price,
                timestamp: now,
            };

            // Publish first; only a delivered signal may lock the position.
            match self.bus.publish_exit(Event::ExitSignal(signal)) {
                Ok(()) => {
                    self.repository
                        .set_pending_exit(&position.symbol, true)
                        .await?;
                    let attempt = self
                        .repository
                        .record_exit_attempt(
                            &position.symbol,
                            now,
                            self.config.backoff_base_seconds,
                            self.config.backoff_max_seconds,
                        )
                        .await?;
                    info!(
                        symbol = %position.symbol,
                        %reason,
                        %price,
                        attempt,
                        "exit signal published"
                    );
                    published += 1;
                }
                Err(e) => {
                    warn!(
                        symbol = %position.symbol,
                        error = %e,
                        "exit publish failed, position left unlocked"
                    );
                    self.repository
                        .record_exit_attempt(
                            &position.symbol,
                            now,
                            self.config.backoff_base_seconds,
                            self.config.backoff_max_seconds,
                        )
                        .await?;
                }
            }
        }

        Ok(published)
    }
}
