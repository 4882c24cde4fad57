use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::types::{Bar, ExitReason, OrderSide, OrderState, Signal};

/// Everything that flows over the engine's event bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Bar(Bar),
    Signal(Signal),
    OrderIntent(OrderIntentEvent),
    OrderUpdate(OrderUpdate),
    ExitSignal(ExitSignal),
}

impl Event {
    /// Stable tag for subscriber discrimination and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Bar(_) => "bar",
            Event::Signal(_) => "signal",
            Event::OrderIntent(_) => "order_intent",
            Event::OrderUpdate(_) => "order_update",
            Event::ExitSignal(_) => "exit_signal",
        }
    }

    pub fn is_exit_signal(&self) -> bool {
        matches!(self, Event::ExitSignal(_))
    }
}

/// Published after an intent has been persisted and (unless dry-run) handed
/// to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntentEvent {
    pub client_order_id: String,
    pub broker_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub state: OrderState,
    pub timestamp: DateTime<Utc>,
}

/// Execution report arriving from the broker adaptor at the system boundary.
///
/// `dedupe_key` is the broker-supplied redelivery key; it is present whenever
/// the update carries a fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub broker_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub state: OrderState,
    pub filled_qty: Decimal,
    pub filled_price: Option<Decimal>,
    pub dedupe_key: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Emitted by the exit engine; rides the unbounded channel and is never
/// dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub symbol: String,
    pub quantity: Decimal,
    pub reason: ExitReason,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}
