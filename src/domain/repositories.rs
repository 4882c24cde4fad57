//! State repository contract.
//!
//! The repository owns every piece of durable state in the engine: bot
//! state, order intents, fills, position tracking, signal gates, the
//! circuit breaker, drawdown state, the equity curve, bars, exit-attempt
//! backoff and reconciliation reports. Components receive it as an
//! `Arc<dyn StateRepository>` capability and never reach the storage
//! engine directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;

use crate::domain::errors::StoreError;
use crate::domain::types::{
    Bar, DrawdownState, Fill, OrderIntent, OrderState, PositionTracking,
};

#[async_trait]
pub trait StateRepository: Send + Sync {
    // --- bot state key/value ---

    async fn get_state(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set_state(&self, key: &str, value: &str) -> Result<(), StoreError>;

    // --- signal gates ---

    /// Atomic check-and-accept under a serialisable transaction.
    ///
    /// Rejects when the gate already accepted `bar_ts` (same-bar dedupe) or
    /// when `now` is still inside the cooldown window; otherwise records the
    /// acceptance with a monotonically non-decreasing `last_accepted_ts` and
    /// returns true.
    async fn gate_try_accept(
        &self,
        gate: &str,
        bar_ts: DateTime<Utc>,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Result<bool, StoreError>;

    // --- order intents ---

    /// Write-ahead insert, idempotent by `client_order_id`: silently returns
    /// when the row already exists.
    async fn save_order_intent(&self, intent: &OrderIntent) -> Result<(), StoreError>;

    async fn get_order_intent(
        &self,
        client_order_id: &str,
    ) -> Result<Option<OrderIntent>, StoreError>;

    /// Fails with [`StoreError::IntentNotFound`] when the row is absent.
    async fn update_order_intent(
        &self,
        client_order_id: &str,
        broker_order_id: Option<&str>,
        state: OrderState,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Every intent not yet in a terminal state, for the recovery scan.
    async fn open_order_intents(&self) -> Result<Vec<OrderIntent>, StoreError>;

    /// Whether any intent (in any state) was ever recorded for the symbol.
    async fn symbol_has_order_intent(&self, symbol: &str) -> Result<bool, StoreError>;

    // --- fills ---

    /// Idempotent on `(broker_order_id, dedupe_key)`; returns false when the
    /// fill was already recorded (redelivery).
    async fn insert_fill(&self, fill: &Fill) -> Result<bool, StoreError>;

    // --- position tracking ---

    async fn get_position(&self, symbol: &str) -> Result<Option<PositionTracking>, StoreError>;
    async fn all_positions(&self) -> Result<Vec<PositionTracking>, StoreError>;
    async fn upsert_position(&self, position: &PositionTracking) -> Result<(), StoreError>;
    async fn delete_position(&self, symbol: &str) -> Result<(), StoreError>;
    async fn set_pending_exit(&self, symbol: &str, pending: bool) -> Result<(), StoreError>;

    // --- exit backoff ---

    /// Bump the attempt counter and schedule the next retry at
    /// `now + min(base · 2^(n-1), max)` seconds. Returns the new count.
    async fn record_exit_attempt(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
        base_seconds: u64,
        max_seconds: u64,
    ) -> Result<u32, StoreError>;

    /// Remaining backoff in whole seconds; zero when no attempt is recorded
    /// or the retry window has passed.
    async fn exit_backoff_seconds(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn clear_exit_attempts(&self, symbol: &str) -> Result<(), StoreError>;

    // --- circuit breaker ---

    async fn circuit_breaker_count(&self) -> Result<u32, StoreError>;
    async fn save_circuit_breaker_count(&self, count: u32) -> Result<(), StoreError>;

    // --- drawdown ---

    async fn drawdown_state(&self) -> Result<Option<DrawdownState>, StoreError>;
    async fn save_drawdown_state(&self, state: &DrawdownState) -> Result<(), StoreError>;

    // --- equity curve ---

    /// Idempotent by timestamp.
    async fn insert_equity_snapshot(
        &self,
        timestamp: DateTime<Utc>,
        equity: Decimal,
    ) -> Result<(), StoreError>;

    async fn equity_curve_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, Decimal)>, StoreError>;

    // --- bars ---

    /// Idempotent by `(symbol, timeframe, timestamp)`.
    async fn insert_bar(&self, bar: &Bar) -> Result<(), StoreError>;

    /// Most recent bars, ascending chronological.
    async fn recent_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Bar>, StoreError>;

    // --- reconciliation ---

    async fn insert_reconciliation_report(
        &self,
        timestamp: DateTime<Utc>,
        report_json: &str,
    ) -> Result<(), StoreError>;
}

/// Backoff ladder shared by the repository implementation and its callers.
pub fn backoff_delay_seconds(attempt_count: u32, base_seconds: u64, max_seconds: u64) -> u64 {
    if attempt_count == 0 {
        return 0;
    }
    let exp = (attempt_count - 1).min(31);
    base_seconds.saturating_mul(1u64 << exp).min(max_seconds)
}
