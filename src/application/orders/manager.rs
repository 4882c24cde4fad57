//! Idempotent order submission.
//!
//! The submit flow is gate → persist intent → submit → update → publish.
//! The intent row is written before the broker is contacted (write-ahead),
//! and its deterministic id makes the whole flow replay-safe: a crashed
//! process that re-handles the same signal finds the row, sees the broker
//! order id, and stops.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::application::orders::positions::PositionTracker;
use crate::application::risk::circuit_breaker::CircuitBreaker;
use crate::application::risk::drawdown::DrawdownCache;
use crate::application::risk::manager::{GateContext, RiskCheckError, RiskManager};
use crate::application::risk::sizer::PositionSizer;
use crate::domain::errors::{EngineError, RiskDecision, RiskError, StoreError};
use crate::domain::events::{Event, ExitSignal, OrderIntentEvent, OrderUpdate};
use crate::domain::ids::{entry_order_id, exit_order_id, flatten_order_id};
use crate::domain::ports::Broker;
use crate::domain::repositories::StateRepository;
use crate::domain::types::{
    Fill, OrderIntent, OrderSide, OrderState, Signal, TradeAction, state_keys,
};
use crate::infrastructure::event_bus::EventBus;

pub struct OrderManager {
    repository: Arc<dyn StateRepository>,
    broker: Arc<dyn Broker>,
    bus: EventBus,
    sizer: PositionSizer,
    risk: Arc<RiskManager>,
    drawdown: Arc<DrawdownCache>,
    breaker: Arc<CircuitBreaker>,
    tracker: Arc<PositionTracker>,
    dry_run: bool,
    exit_backoff_base: u64,
    exit_backoff_max: u64,
}

impl OrderManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn StateRepository>,
        broker: Arc<dyn Broker>,
        bus: EventBus,
        sizer: PositionSizer,
        risk: Arc<RiskManager>,
        drawdown: Arc<DrawdownCache>,
        breaker: Arc<CircuitBreaker>,
        tracker: Arc<PositionTracker>,
        dry_run: bool,
        exit_backoff_base: u64,
        exit_backoff_max: u64,
    ) -> Self {
        Self {
            repository,
            broker,
            bus,
            sizer,
            risk,
            drawdown,
            breaker,
            tracker,
            dry_run,
            exit_backoff_base,
            exit_backoff_max,
        }
    }

    /// Handle one strategy signal. Returns the derived client order id, or
    /// `None` when the signal was filtered or gated away.
    pub async fn handle_signal(&self, signal: &Signal) -> Result<Option<String>, EngineError> {
        let now = Utc::now();
        let action = TradeAction::from_side(signal.side);
        let price = if signal.limit_price > Decimal::ZERO {
            signal.limit_price
        } else {
            signal.metadata.current_price
        };

        // Quantity: explicit, or sized from equity for entries; exits of a
        // long-only book unwind the tracked quantity.
        let mut sized_quantity = None;
        let mut quantity = signal.quantity;
        if quantity.is_zero() {
            match action {
                TradeAction::EnterLong => {
                    let account = self.broker.get_account().await?;
                    let sized = self
                        .sizer
                        .quantity(account.portfolio_value, price)
                        .map_err(|e| EngineError::Internal(e.to_string()))?;
                    sized_quantity = Some(sized);
                    quantity = sized;
                }
                TradeAction::ExitLong => {
                    match self.repository.get_position(&signal.symbol).await? {
                        Some(position) if position.quantity > Decimal::ZERO => {
                            quantity = position.quantity;
                        }
                        _ => {
                            debug!(symbol = %signal.symbol, "exit signal with no tracked position, skipping");
                            return Ok(None);
                        }
                    }
                }
            }
        }

        // The drawdown multiplier shrinks new exposure only; exits always
        // unwind the full requested quantity.
        if action.is_entry() {
            let multiplier = Decimal::from_f64(self.drawdown.position_multiplier().await)
                .unwrap_or(Decimal::ONE);
            quantity = quantity * multiplier;
        }
        quantity = quantity.floor().max(Decimal::ONE);

        match self
            .risk
            .evaluate(&GateContext {
                signal,
                quantity,
                sized_quantity,
                price,
                now,
            })
            .await?
        {
            RiskDecision::Pass => {}
            RiskDecision::Skip(reason) => {
                info!(symbol = %signal.symbol, side = %signal.side, reason, "signal filtered");
                return Ok(None);
            }
            RiskDecision::Halt { tier, reason } => {
                return Err(RiskError { tier, reason }.into());
            }
        }

        let client_order_id = entry_order_id(
            &signal.strategy,
            &signal.symbol,
            &signal.timeframe,
            signal.signal_ts,
            signal.side,
        );

        let existing = self.repository.get_order_intent(&client_order_id).await?;
        if let Some(intent) = &existing
            && intent.broker_order_id.is_some()
        {
            debug!(client_order_id, "order already in flight, nothing to do");
            return Ok(Some(client_order_id));
        }

        if action.is_entry() && existing.is_none() {
            // Position block: one tracked position per symbol.
            if let Some(position) = self.repository.get_position(&signal.symbol).await?
                && position.quantity != Decimal::ZERO
            {
                info!(symbol = %signal.symbol, "entry blocked, position already open");
                return Ok(None);
            }

            // Same-bar gate: the bar timestamp is the dedupe key; polling
            // cadence provides the rate limit, so cooldown is zero.
            let gate = format!("entry_gate:{}:{}", signal.symbol, signal.timeframe);
            if !self
                .repository
                .gate_try_accept(&gate, signal.signal_ts, now, Duration::ZERO)
                .await?
            {
                info!(symbol = %signal.symbol, gate, "entry gate rejected duplicate bar");
                return Ok(None);
            }
        }

        self.repository
            .save_order_intent(&OrderIntent {
                client_order_id: client_order_id.clone(),
                broker_order_id: None,
                symbol: signal.symbol.clone(),
                side: signal.side,
                quantity,
                limit_price: Some(price),
                state: OrderState::PendingNew,
                created_at: now,
                updated_at: None,
            })
            .await?;

        if self.dry_run {
            info!(
                client_order_id,
                symbol = %signal.symbol,
                side = %signal.side,
                %quantity,
                "dry run: intent persisted, broker not contacted"
            );
            return Ok(Some(client_order_id));
        }

        // Submission is single-shot; retries belong to replayed signals,
        // which land on the same id.
        let order = match self
            .broker
            .submit_order(&signal.symbol, signal.side, quantity, Some(price), &client_order_id)
            .await
        {
            Err(e) => {
                if let Err(store_err) = self.breaker.record_failure().await {
                    error!(error = %store_err, "failed to persist circuit breaker count");
                }
                return Err(EngineError::Broker(e));
            }
            Ok(order) => order,
        };

        self.repository
            .update_order_intent(
                &client_order_id,
                Some(&order.broker_order_id),
                order.state,
                Utc::now(),
            )
            .await?;
        self.breaker.reset().await?;

        info!(
            client_order_id,
            broker_order_id = %order.broker_order_id,
            symbol = %signal.symbol,
            side = %signal.side,
            %quantity,
            "order submitted"
        );

        self.bus.publish(Event::OrderIntent(OrderIntentEvent {
            client_order_id: client_order_id.clone(),
            broker_order_id: Some(order.broker_order_id),
            symbol: signal.symbol.clone(),
            side: signal.side,
            quantity,
            state: order.state,
            timestamp: Utc::now(),
        }));

        Ok(Some(client_order_id))
    }

    /// Submit an exit requested by the exit engine. The id is daily-unique
    /// per symbol, so a rescan after a crash lands on the same intent.
    pub async fn submit_exit(&self, exit: &ExitSignal) -> Result<Option<String>, EngineError> {
        let now = Utc::now();

        match self.risk.evaluate_exit(&exit.symbol).await? {
            RiskDecision::Halt { tier, reason } => {
                return Err(RiskError { tier, reason }.into());
            }
            _ => {}
        }

        let side = OrderSide::Sell;
        let client_order_id = exit_order_id(&exit.symbol, now.date_naive(), side);

        // A terminally failed exit intent is retryable under the same id;
        // anything else already holding a broker id is in flight or done.
        if let Some(intent) = self.repository.get_order_intent(&client_order_id).await?
            && intent.broker_order_id.is_some()
            && !intent.state.is_terminal_failure()
        {
            debug!(client_order_id, "exit already in flight");
            return Ok(Some(client_order_id));
        }

        self.repository
            .save_order_intent(&OrderIntent {
                client_order_id: client_order_id.clone(),
                broker_order_id: None,
                symbol: exit.symbol.clone(),
                side,
                quantity: exit.quantity,
                limit_price: Some(exit.price),
                state: OrderState::PendingNew,
                created_at: now,
                updated_at: None,
            })
            .await?;

        if self.dry_run {
            info!(client_order_id, symbol = %exit.symbol, reason = %exit.reason, "dry run: exit intent persisted");
            return Ok(Some(client_order_id));
        }

        let order = match self
            .broker
            .submit_order(&exit.symbol, side, exit.quantity, Some(exit.price), &client_order_id)
            .await
        {
            Err(e) => {
                if let Err(store_err) = self.breaker.record_failure().await {
                    error!(error = %store_err, "failed to persist circuit breaker count");
                }
                // Extend the backoff ladder so the scan does not hammer a
                // failing broker.
                if let Err(store_err) = self
                    .repository
                    .record_exit_attempt(&exit.symbol, now, self.exit_backoff_base, self.exit_backoff_max)
                    .await
                {
                    error!(error = %store_err, "failed to record exit attempt");
                }
                return Err(EngineError::Broker(e));
            }
            Ok(order) => order,
        };

        self.repository
            .update_order_intent(
                &client_order_id,
                Some(&order.broker_order_id),
                order.state,
                Utc::now(),
            )
            .await?;
        self.breaker.reset().await?;

        info!(
            client_order_id,
            broker_order_id = %order.broker_order_id,
            symbol = %exit.symbol,
            reason = %exit.reason,
            quantity = %exit.quantity,
            "exit order submitted"
        );

        self.bus.publish(Event::OrderIntent(OrderIntentEvent {
            client_order_id: client_order_id.clone(),
            broker_order_id: Some(order.broker_order_id),
            symbol: exit.symbol.clone(),
            side,
            quantity: exit.quantity,
            state: order.state,
            timestamp: Utc::now(),
        }));

        Ok(Some(client_order_id))
    }

    /// Flatten every broker-reported position with per-day deterministic
    /// ids. Per-symbol failures are logged and skipped.
    pub async fn flatten_positions(&self) -> Result<usize, EngineError> {
        let positions = self.broker.get_positions().await?;
        let today = Utc::now().date_naive();
        let mut submitted = 0usize;

        for position in positions {
            if position.quantity == Decimal::ZERO {
                continue;
            }
            let side = if position.quantity > Decimal::ZERO {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            };
            let quantity = position.quantity.abs();
            let client_order_id = flatten_order_id(&position.symbol, today, side);

            let result: Result<bool, EngineError> = async {
                if let Some(intent) = self.repository.get_order_intent(&client_order_id).await?
                    && intent.broker_order_id.is_some()
                    && !intent.state.is_terminal_failure()
                {
                    return Ok(false);
                }

                self.repository
                    .save_order_intent(&OrderIntent {
                        client_order_id: client_order_id.clone(),
                        broker_order_id: None,
                        symbol: position.symbol.clone(),
                        side,
                        quantity,
                        limit_price: None,
                        state: OrderState::PendingNew,
                        created_at: Utc::now(),
                        updated_at: None,
                    })
                    .await?;

                if self.dry_run {
                    info!(client_order_id, symbol = %position.symbol, "dry run: flatten intent persisted");
                    return Ok(false);
                }

                let order = self
                    .broker
                    .submit_order(&position.symbol, side, quantity, None, &client_order_id)
                    .await?;
                self.repository
                    .update_order_intent(
                        &client_order_id,
                        Some(&order.broker_order_id),
                        order.state,
                        Utc::now(),
                    )
                    .await?;

                self.bus.publish(Event::OrderIntent(OrderIntentEvent {
                    client_order_id: client_order_id.clone(),
                    broker_order_id: Some(order.broker_order_id),
                    symbol: position.symbol.clone(),
                    side,
                    quantity,
                    state: order.state,
                    timestamp: Utc::now(),
                }));
                Ok(true)
            }
            .await;

            match result {
                Ok(true) => {
                    submitted += 1;
                    warn!(symbol = %position.symbol, %quantity, "position flattened");
                }
                Ok(false) => {}
                Err(e) => {
                    error!(symbol = %position.symbol, error = %e, "flatten failed for symbol, continuing");
                }
            }
        }

        Ok(submitted)
    }

    /// Apply a broker execution report: dedupe the fill, advance the intent
    /// state machine, maintain position tracking and daily counters, and
    /// release the pending-exit lock on terminal failures.
    pub async fn handle_order_update(
        &self,
        update: &OrderUpdate,
        current_atr: Option<f64>,
    ) -> Result<(), EngineError> {
        let now = update.timestamp;

        let mut fill_applied = false;
        if update.filled_qty > Decimal::ZERO
            && let (Some(price), Some(dedupe_key)) = (update.filled_price, &update.dedupe_key)
        {
            fill_applied = self
                .repository
                .insert_fill(&Fill {
                    broker_order_id: update.broker_order_id.clone(),
                    client_order_id: update.client_order_id.clone(),
                    filled_qty: update.filled_qty,
                    filled_price: price,
                    dedupe_key: dedupe_key.clone(),
                    filled_at: now,
                })
                .await?;
            if !fill_applied {
                debug!(
                    broker_order_id = %update.broker_order_id,
                    dedupe_key,
                    "redelivered fill ignored"
                );
            }
        }

        match self.repository.get_order_intent(&update.client_order_id).await? {
            None => {
                warn!(
                    client_order_id = %update.client_order_id,
                    "order update for unknown intent"
                );
            }
            Some(previous) => {
                self.repository
                    .update_order_intent(
                        &update.client_order_id,
                        Some(&update.broker_order_id),
                        update.state,
                        now,
                    )
                    .await?;
                // One trade per order, counted on its first observed fill.
                if update.state.has_fills() && !previous.state.has_fills() {
                    self.bump_daily_trade_count().await?;
                }
            }
        }

        if fill_applied && let Some(price) = update.filled_price {
            match update.side {
                OrderSide::Buy => {
                    self.tracker
                        .apply_buy_fill(&update.symbol, update.filled_qty, price, current_atr, now)
                        .await?;
                }
                OrderSide::Sell => {
                    let realized = self
                        .tracker
                        .apply_sell_fill(&update.symbol, update.filled_qty, price, now)
                        .await?;
                    self.add_daily_realized_pnl(realized).await?;
                }
            }
        }

        // Terminal-failure hook: a dead exit order releases the lock and
        // schedules the next attempt on the backoff ladder.
        if update.state.is_terminal_failure()
            && let Some(position) = self.repository.get_position(&update.symbol).await?
            && position.pending_exit
        {
            self.repository.set_pending_exit(&update.symbol, false).await?;
            let attempt = self
                .repository
                .record_exit_attempt(&update.symbol, now, self.exit_backoff_base, self.exit_backoff_max)
                .await?;
            warn!(
                symbol = %update.symbol,
                state = %update.state,
                attempt,
                "exit order failed terminally, pending-exit lock released"
            );
        }

        Ok(())
    }

    async fn bump_daily_trade_count(&self) -> Result<(), StoreError> {
        let count: u32 = self
            .repository
            .get_state(state_keys::DAILY_TRADE_COUNT)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        self.repository
            .set_state(state_keys::DAILY_TRADE_COUNT, &(count + 1).to_string())
            .await
    }

    async fn add_daily_realized_pnl(&self, realized: Decimal) -> Result<(), StoreError> {
        if realized == Decimal::ZERO {
            return Ok(());
        }
        let current = self
            .repository
            .get_state(state_keys::DAILY_REALIZED_PNL)
            .await?
            .and_then(|v| Decimal::from_str(&v).ok())
            .unwrap_or(Decimal::ZERO);
        self.repository
            .set_state(state_keys::DAILY_REALIZED_PNL, &(current + realized).to_string())
            .await
    }
}
