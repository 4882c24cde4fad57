use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Lowercase form used in the canonical order-id input string.
    pub fn as_lower(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// What a signal means for our long-only book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeAction {
    EnterLong,
    ExitLong,
}

impl TradeAction {
    pub fn is_entry(&self) -> bool {
        matches!(self, TradeAction::EnterLong)
    }

    pub fn from_side(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => TradeAction::EnterLong,
            OrderSide::Sell => TradeAction::ExitLong,
        }
    }
}

/// Order lifecycle states, mirroring the broker's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    PendingNew,
    Accepted,
    PendingCancel,
    Canceled,
    Expired,
    Filled,
    PartiallyFilled,
    PendingReplace,
    Replaced,
    Rejected,
    Suspended,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            OrderState::PendingNew
                | OrderState::Accepted
                | OrderState::PendingCancel
                | OrderState::PendingReplace
        )
    }

    /// Terminal states that mean the order died without executing in full.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            OrderState::Canceled | OrderState::Expired | OrderState::Rejected
        )
    }

    pub fn has_fills(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::PartiallyFilled)
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderState::PendingNew => "PendingNew",
            OrderState::Accepted => "Accepted",
            OrderState::PendingCancel => "PendingCancel",
            OrderState::Canceled => "Canceled",
            OrderState::Expired => "Expired",
            OrderState::Filled => "Filled",
            OrderState::PartiallyFilled => "PartiallyFilled",
            OrderState::PendingReplace => "PendingReplace",
            OrderState::Replaced => "Replaced",
            OrderState::Rejected => "Rejected",
            OrderState::Suspended => "Suspended",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for OrderState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PendingNew" => Ok(OrderState::PendingNew),
            "Accepted" => Ok(OrderState::Accepted),
            "PendingCancel" => Ok(OrderState::PendingCancel),
            "Canceled" => Ok(OrderState::Canceled),
            "Expired" => Ok(OrderState::Expired),
            "Filled" => Ok(OrderState::Filled),
            "PartiallyFilled" => Ok(OrderState::PartiallyFilled),
            "PendingReplace" => Ok(OrderState::PendingReplace),
            "Replaced" => Ok(OrderState::Replaced),
            "Rejected" => Ok(OrderState::Rejected),
            "Suspended" => Ok(OrderState::Suspended),
            other => Err(format!("unknown order state: {}", other)),
        }
    }
}

/// A single OHLCV bar for one symbol and timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: String,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Coarse trend classification produced by the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    TrendingUp,
    TrendingDown,
    Ranging,
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Regime::TrendingUp => "TRENDING_UP",
            Regime::TrendingDown => "TRENDING_DOWN",
            Regime::Ranging => "RANGING",
        };
        write!(f, "{}", s)
    }
}

/// Everything the strategy knows about a signal at emission time.
///
/// `atr` is `None` while the history is too short to compute it; downstream
/// consumers must treat a missing ATR as disqualifying for exit-level math.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalMetadata {
    pub sma_pair: String,
    pub fast_sma: f64,
    pub medium_sma: f64,
    pub slow_sma: f64,
    pub atr: Option<f64>,
    pub confidence: f64,
    pub regime: Regime,
    pub regime_strength: f64,
    pub current_price: Decimal,
    pub bars_in_regime: u32,
}

/// A trade signal emitted by the strategy core.
///
/// `quantity` of zero is a sentinel meaning "let the sizer decide".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub strategy: String,
    pub symbol: String,
    pub timeframe: String,
    pub side: OrderSide,
    pub signal_ts: DateTime<Utc>,
    pub quantity: Decimal,
    pub limit_price: Decimal,
    pub metadata: SignalMetadata,
}

/// Why the exit engine wants out of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    AtrStopLoss,
    AtrProfitTarget,
    TrailingStop,
    StopLoss,
    ProfitTarget,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::AtrStopLoss => "ATR_STOP_LOSS",
            ExitReason::AtrProfitTarget => "ATR_PROFIT_TARGET",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::ProfitTarget => "PROFIT_TARGET",
        };
        write!(f, "{}", s)
    }
}

/// Durable record of an order we intend to (or did) hand to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub client_order_id: String,
    pub broker_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One execution report from the broker, deduplicated on
/// `(broker_order_id, dedupe_key)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub broker_order_id: String,
    pub client_order_id: String,
    pub filled_qty: Decimal,
    pub filled_price: Decimal,
    pub dedupe_key: String,
    pub filled_at: DateTime<Utc>,
}

/// Locally tracked open position, rehydrated from the store on startup.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionTracking {
    pub symbol: String,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub atr_value: f64,
    pub trailing_stop_price: Decimal,
    pub last_update_at: DateTime<Utc>,
    pub pending_exit: bool,
}

/// Drawdown escalation ladder. Ordering matters: later variants are worse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DrawdownLevel {
    Normal,
    Warning,
    Halt,
    Emergency,
}

impl fmt::Display for DrawdownLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DrawdownLevel::Normal => "Normal",
            DrawdownLevel::Warning => "Warning",
            DrawdownLevel::Halt => "Halt",
            DrawdownLevel::Emergency => "Emergency",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for DrawdownLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Normal" => Ok(DrawdownLevel::Normal),
            "Warning" => Ok(DrawdownLevel::Warning),
            "Halt" => Ok(DrawdownLevel::Halt),
            "Emergency" => Ok(DrawdownLevel::Emergency),
            other => Err(format!("unknown drawdown level: {}", other)),
        }
    }
}

/// Singleton drawdown state, survives restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawdownState {
    pub level: DrawdownLevel,
    pub peak_equity: Decimal,
    pub current_drawdown_pct: f64,
    pub last_updated: DateTime<Utc>,
    pub last_peak_reset_time: DateTime<Utc>,
    pub manual_recovery_requested: bool,
}

/// Exponential-backoff bookkeeping for exit submissions, one row per symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitAttempt {
    pub symbol: String,
    pub attempt_count: u32,
    pub last_attempt_at: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
}

/// Reserved keys in the bot-state key/value table.
pub mod state_keys {
    pub const DAILY_REALIZED_PNL: &str = "daily_realized_pnl";
    pub const DAILY_TRADE_COUNT: &str = "daily_trade_count";
    pub const DAILY_RESET_DATE: &str = "daily_reset_date";
    pub const TRADING_HALTED: &str = "trading_halted";
    pub const BROKER_HEALTH: &str = "broker_health";
    pub const BREAKER_RESET_DATE: &str = "breaker_reset_date";
}
