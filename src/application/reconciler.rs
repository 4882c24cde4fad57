//! Broker reconciliation.
//!
//! At startup and on a fixed cadence, the local order intents and position
//! tracking rows are diffed against what the broker reports. Correctable
//! drift (stale intents, quantity mismatches, orphaned local rows) is
//! repaired in place; a position the broker holds that this system never
//! intended is uncorrectable and halts trading. Every run persists a JSON
//! report.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{error, info, warn};

use crate::domain::errors::{BrokerError, StoreError};
use crate::domain::ports::Broker;
use crate::domain::repositories::StateRepository;
use crate::domain::types::{OrderState, PositionTracking, state_keys};

/// Broker failures in a row before health is marked degraded.
const DEGRADED_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct Discrepancy {
    pub kind: String,
    pub subject: String,
    pub detail: String,
    pub corrected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub broker_equity: Decimal,
    pub broker_open_orders: usize,
    pub broker_positions: usize,
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconciliationReport {
    pub fn uncorrectable(&self) -> usize {
        self.discrepancies.iter().filter(|d| !d.corrected).count()
    }

    pub fn is_clean(&self) -> bool {
        self.uncorrectable() == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

pub struct Reconciler {
    repository: Arc<dyn StateRepository>,
    broker: Arc<dyn Broker>,
    consecutive_failures: AtomicU32,
}

impl Reconciler {
    pub fn new(repository: Arc<dyn StateRepository>, broker: Arc<dyn Broker>) -> Self {
        Self {
            repository,
            broker,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Startup reconciliation. Returns false when an uncorrectable
    /// discrepancy was found; the caller must refuse to enter the event
    /// loop.
    pub async fn run_startup(&self) -> Result<bool, ReconcileError> {
        let report = self.diff().await?;
        self.persist(&report).await?;

        if report.is_clean() {
            self.repository
                .set_state(state_keys::TRADING_HALTED, "false")
                .await?;
            info!(
                discrepancies = report.discrepancies.len(),
                "startup reconciliation clean"
            );
            Ok(true)
        } else {
            self.repository
                .set_state(state_keys::TRADING_HALTED, "true")
                .await?;
            error!(
                uncorrectable = report.uncorrectable(),
                "startup reconciliation found uncorrectable discrepancies, trading halted"
            );
            Ok(false)
        }
    }

    /// Periodic reconciliation. Broker failures are tolerated up to a
    /// threshold before health flips to degraded; a clean diff clears the
    /// trading halt.
    pub async fn run_periodic(&self) {
        match self.diff().await {
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(error = %e, failures, "periodic reconciliation failed");
                if failures >= DEGRADED_AFTER_FAILURES {
                    if let Err(store_err) = self
                        .repository
                        .set_state(state_keys::BROKER_HEALTH, "degraded")
                        .await
                    {
                        error!(error = %store_err, "failed to mark broker health degraded");
                    }
                }
            }
            Ok(report) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                let halted = !report.is_clean();
                let result: Result<(), StoreError> = async {
                    self.repository
                        .set_state(state_keys::BROKER_HEALTH, "ok")
                        .await?;
                    self.repository
                        .set_state(
                            state_keys::TRADING_HALTED,
                            if halted { "true" } else { "false" },
                        )
                        .await?;
                    self.persist(&report).await
                }
                .await;
                if let Err(e) = result {
                    error!(error = %e, "failed to persist reconciliation outcome");
                }
                if halted {
                    error!(
                        uncorrectable = report.uncorrectable(),
                        "periodic reconciliation found uncorrectable discrepancies"
                    );
                }
            }
        }
    }

    async fn persist(&self, report: &ReconciliationReport) -> Result<(), StoreError> {
        let json = serde_json::to_string(report).unwrap_or_else(|e| {
            format!("{{\"error\":\"report serialization failed: {}\"}}", e)
        });
        self.repository
            .insert_reconciliation_report(report.timestamp, &json)
            .await
    }

    /// Compute the diff and apply every correctable repair.
    pub async fn diff(&self) -> Result<ReconciliationReport, ReconcileError> {
        let now = Utc::now();
        let account = self.broker.get_account().await?;
        let broker_orders = self.broker.get_open_orders().await?;
        let broker_positions = self.broker.get_positions().await?;

        let mut discrepancies = Vec::new();

        // Broker-side open orders vs local intents.
        for order in &broker_orders {
            match self
                .repository
                .get_order_intent(&order.client_order_id)
                .await?
            {
                Some(intent) => {
                    let stale_state = intent.state != order.state;
                    let missing_broker_id = intent.broker_order_id.is_none();
                    if stale_state || missing_broker_id {
                        self.repository
                            .update_order_intent(
                                &order.client_order_id,
                                Some(&order.broker_order_id),
                                order.state,
                                now,
                            )
                            .await?;
                        discrepancies.push(Discrepancy {
                            kind: "intent_synced".to_string(),
                            subject: order.client_order_id.clone(),
                            detail: format!(
                                "local {} synced to broker {}",
                                intent.state, order.state
                            ),
                            corrected: true,
                        });
                    }
                }
                None => {
                    discrepancies.push(Discrepancy {
                        kind: "unknown_open_order".to_string(),
                        subject: order.client_order_id.clone(),
                        detail: format!(
                            "broker holds open order {} for {} with no local intent",
                            order.broker_order_id, order.symbol
                        ),
                        corrected: false,
                    });
                }
            }
        }

        // Local open intents the broker no longer knows. A pre-submit
        // crash leaves PendingNew with no broker id; anything else either
        // filled (the position diff below sees it) or died at the broker.
        for intent in self.repository.open_order_intents().await? {
            let known = broker_orders
                .iter()
                .any(|o| o.client_order_id == intent.client_order_id);
            if known {
                continue;
            }
            self.repository
                .update_order_intent(&intent.client_order_id, None, OrderState::Expired, now)
                .await?;
            discrepancies.push(Discrepancy {
                kind: "intent_expired".to_string(),
                subject: intent.client_order_id.clone(),
                detail: format!(
                    "open intent ({}) not among broker open orders, marked Expired",
                    intent.state
                ),
                corrected: true,
            });
        }

        // Broker positions vs local tracking.
        let local_positions = self.repository.all_positions().await?;
        for broker_pos in broker_positions.iter().filter(|p| p.quantity != Decimal::ZERO) {
            match local_positions.iter().find(|l| l.symbol == broker_pos.symbol) {
                Some(local) => {
                    if local.quantity != broker_pos.quantity {
                        let mut updated = local.clone();
                        updated.quantity = broker_pos.quantity;
                        updated.last_update_at = now;
                        self.repository.upsert_position(&updated).await?;
                        discrepancies.push(Discrepancy {
                            kind: "position_quantity_synced".to_string(),
                            subject: broker_pos.symbol.clone(),
                            detail: format!(
                                "local {} synced to broker {}",
                                local.quantity, broker_pos.quantity
                            ),
                            corrected: true,
                        });
                    }
                }
                None => {
                    if self
                        .repository
                        .symbol_has_order_intent(&broker_pos.symbol)
                        .await?
                    {
                        // We traded this name; adopt the broker's view. The
                        // ATR stays zero until the next bar refreshes it.
                        self.repository
                            .upsert_position(&PositionTracking {
                                symbol: broker_pos.symbol.clone(),
                                quantity: broker_pos.quantity,
                                entry_price: broker_pos.avg_entry_price,
                                atr_value: 0.0,
                                trailing_stop_price: Decimal::ZERO,
                                last_update_at: now,
                                pending_exit: false,
                            })
                            .await?;
                        discrepancies.push(Discrepancy {
                            kind: "position_adopted".to_string(),
                            subject: broker_pos.symbol.clone(),
                            detail: format!(
                                "broker position {} adopted into tracking",
                                broker_pos.quantity
                            ),
                            corrected: true,
                        });
                    } else {
                        discrepancies.push(Discrepancy {
                            kind: "unknown_position".to_string(),
                            subject: broker_pos.symbol.clone(),
                            detail: format!(
                                "broker reports {} of {} with no local intent on record",
                                broker_pos.quantity, broker_pos.symbol
                            ),
                            corrected: false,
                        });
                    }
                }
            }
        }

        // Local tracking the broker does not back.
        for local in &local_positions {
            let backed = broker_positions
                .iter()
                .any(|p| p.symbol == local.symbol && p.quantity != Decimal::ZERO);
            if !backed {
                self.repository.delete_position(&local.symbol).await?;
                self.repository.clear_exit_attempts(&local.symbol).await?;
                discrepancies.push(Discrepancy {
                    kind: "position_dropped".to_string(),
                    subject: local.symbol.clone(),
                    detail: "local tracking row has no broker position behind it".to_string(),
                    corrected: true,
                });
            }
        }

        Ok(ReconciliationReport {
            timestamp: now,
            broker_equity: account.portfolio_value,
            broker_open_orders: broker_orders.len(),
            broker_positions: broker_positions.len(),
            discrepancies,
        })
    }
}
