use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::errors::BrokerError;
use crate::domain::types::{Bar, OrderSide, OrderState};

/// Broker market clock. Never cached; every safety check that needs it
/// makes a fresh call.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketClock {
    pub is_open: bool,
    pub next_open: DateTime<Utc>,
    pub next_close: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub portfolio_value: Decimal,
    pub cash_available: Decimal,
    pub cash_reserved: Decimal,
    pub day_trade_count: u32,
    pub is_tradable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Broker's view of an order, returned from submission and open-order
/// queries.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderInfo {
    pub broker_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub state: OrderState,
}

/// Top-of-book snapshot used by the spread filter and the exit engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
    pub fetched_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// Brokerage port. Transport lives outside the core; implementations carry
/// their own timeouts (5 s default) and must not retry submissions.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_clock(&self) -> Result<MarketClock, BrokerError>;
    async fn get_account(&self) -> Result<Account, BrokerError>;
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;
    async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        limit_price: Option<Decimal>,
        client_order_id: &str,
    ) -> Result<OrderInfo, BrokerError>;
    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError>;
    async fn get_open_orders(&self) -> Result<Vec<OrderInfo>, BrokerError>;
}

/// Market data port: bar history (ascending chronological) and quote
/// snapshots. Implementations carry a 10 s default timeout.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Bar>, BrokerError>;
    async fn get_snapshot(&self, symbol: &str) -> Result<Snapshot, BrokerError>;
}
