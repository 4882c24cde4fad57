//! Peak-equity drawdown monitor.
//!
//! Tracks peak equity over a rolling lookback window and walks the
//! Normal → Warning → Halt → Emergency ladder. Escalation is immediate;
//! descent only happens with auto-recovery (or an explicit manual request)
//! and only once the drawdown has fallen below the level's recovery
//! threshold, so the ladder cannot flap around a boundary.
//!
//! Hot paths never read the store: the resolved level sits in a shared
//! cache refreshed on every tick.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::DrawdownConfig;
use crate::domain::errors::{BrokerError, StoreError};
use crate::domain::ports::Broker;
use crate::domain::repositories::StateRepository;
use crate::domain::types::{DrawdownLevel, DrawdownState};

/// In-memory view of the current level, consulted synchronously by the
/// gating pipeline.
pub struct DrawdownCache {
    level: RwLock<DrawdownLevel>,
    warning_multiplier: f64,
}

impl DrawdownCache {
    pub fn new(warning_multiplier: f64) -> Self {
        Self {
            level: RwLock::new(DrawdownLevel::Normal),
            warning_multiplier,
        }
    }

    pub async fn level(&self) -> DrawdownLevel {
        *self.level.read().await
    }

    pub async fn set_level(&self, level: DrawdownLevel) {
        *self.level.write().await = level;
    }

    /// Sizing multiplier for new entries: reduced in Warning, full
    /// elsewhere (Halt and Emergency block entries outright).
    pub async fn position_multiplier(&self) -> f64 {
        match self.level().await {
            DrawdownLevel::Warning => self.warning_multiplier,
            _ => 1.0,
        }
    }
}

/// Level implied by thresholds alone, first crossed wins (descending).
fn escalation_level(drawdown_pct: f64, config: &DrawdownConfig) -> DrawdownLevel {
    if drawdown_pct >= config.emergency_threshold_pct {
        DrawdownLevel::Emergency
    } else if drawdown_pct >= config.halt_threshold_pct {
        DrawdownLevel::Halt
    } else if drawdown_pct >= config.warning_threshold_pct {
        DrawdownLevel::Warning
    } else {
        DrawdownLevel::Normal
    }
}

/// Level implied by recovery thresholds; a drawdown still above a level's
/// recovery threshold keeps that level.
fn recovery_level(drawdown_pct: f64, config: &DrawdownConfig) -> DrawdownLevel {
    if drawdown_pct >= config.emergency_recovery_pct {
        DrawdownLevel::Emergency
    } else if drawdown_pct >= config.halt_recovery_pct {
        DrawdownLevel::Halt
    } else if drawdown_pct >= config.warning_recovery_pct {
        DrawdownLevel::Warning
    } else {
        DrawdownLevel::Normal
    }
}

/// Resolve the next level from the current one.
pub fn resolve_level(
    current: DrawdownLevel,
    drawdown_pct: f64,
    config: &DrawdownConfig,
    recovery_allowed: bool,
) -> DrawdownLevel {
    let escalated = escalation_level(drawdown_pct, config);
    if escalated >= current {
        return escalated;
    }
    if recovery_allowed {
        // Descend, but never past what the recovery thresholds permit.
        escalated.max(recovery_level(drawdown_pct, config))
    } else {
        current
    }
}

/// Outcome of one monitor tick.
#[derive(Debug, Clone)]
pub struct DrawdownTick {
    pub state: DrawdownState,
    /// Set when the level changed this tick.
    pub transition: Option<(DrawdownLevel, DrawdownLevel)>,
}

impl DrawdownTick {
    pub fn entered_emergency(&self) -> bool {
        matches!(self.transition, Some((_, DrawdownLevel::Emergency)))
    }
}

pub struct DrawdownMonitor {
    repository: Arc<dyn StateRepository>,
    broker: Arc<dyn Broker>,
    cache: Arc<DrawdownCache>,
    config: DrawdownConfig,
}

impl DrawdownMonitor {
    pub fn new(
        repository: Arc<dyn StateRepository>,
        broker: Arc<dyn Broker>,
        cache: Arc<DrawdownCache>,
        config: DrawdownConfig,
    ) -> Self {
        Self {
            repository,
            broker,
            cache,
            config,
        }
    }

    /// Seed the cache from persisted state on startup.
    pub async fn hydrate(&self) -> Result<(), StoreError> {
        if let Some(state) = self.repository.drawdown_state().await? {
            self.cache.set_level(state.level).await;
            info!(level = %state.level, "drawdown state rehydrated");
        }
        Ok(())
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<DrawdownTick, DrawdownError> {
        let account = self.broker.get_account().await?;
        let equity = account.portfolio_value;

        let mut state = match self.repository.drawdown_state().await? {
            Some(state) => state,
            None => DrawdownState {
                level: DrawdownLevel::Normal,
                peak_equity: equity,
                current_drawdown_pct: 0.0,
                last_updated: now,
                last_peak_reset_time: now,
                manual_recovery_requested: false,
            },
        };

        let window = chrono::Duration::days(self.config.lookback_days);
        if now - state.last_peak_reset_time > window {
            // Window rolled: the old peak no longer binds. Re-derive from
            // the stored equity curve instead of trusting a stale maximum.
            let mut peak = equity;
            for (_, snapshot) in self.repository.equity_curve_since(now - window).await? {
                if snapshot > peak {
                    peak = snapshot;
                }
            }
            state.peak_equity = peak;
            state.last_peak_reset_time = now;
            info!(peak = %peak, "drawdown lookback window rolled, peak reset");
        } else if equity > state.peak_equity {
            state.peak_equity = equity;
        }

        let drawdown_pct = if state.peak_equity > Decimal::ZERO {
            ((state.peak_equity - equity) / state.peak_equity)
                .to_f64()
                .unwrap_or(0.0)
                .max(0.0)
        } else {
            0.0
        };

        let recovery_allowed = self.config.enable_auto_recovery || state.manual_recovery_requested;
        let previous = state.level;
        let next = resolve_level(previous, drawdown_pct, &self.config, recovery_allowed);
        if next < previous {
            state.manual_recovery_requested = false;
        }

        state.level = next;
        state.current_drawdown_pct = drawdown_pct;
        state.last_updated = now;

        self.repository.save_drawdown_state(&state).await?;
        self.cache.set_level(next).await;

        let transition = (previous != next).then_some((previous, next));
        if let Some((from, to)) = transition {
            if to > from {
                warn!(
                    from = %from,
                    to = %to,
                    drawdown_pct = format!("{:.2}%", drawdown_pct * 100.0),
                    peak = %state.peak_equity,
                    equity = %equity,
                    "drawdown level escalated"
                );
            } else {
                info!(
                    from = %from,
                    to = %to,
                    drawdown_pct = format!("{:.2}%", drawdown_pct * 100.0),
                    "drawdown level recovered"
                );
            }
        }

        Ok(DrawdownTick { state, transition })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DrawdownError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
