//! Scriptable in-memory implementations of the broker and market-data
//! ports, used by the integration tests and the paper run mode.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::domain::errors::BrokerError;
use crate::domain::ports::{
    Account, Broker, BrokerPosition, MarketClock, MarketData, OrderInfo, Snapshot,
};
use crate::domain::types::{Bar, OrderSide, OrderState};

/// Record of one submit_order call, for assertions.
#[derive(Debug, Clone)]
pub struct SubmittedOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub client_order_id: String,
}

pub struct MockBroker {
    clock: Mutex<MarketClock>,
    account: Mutex<Account>,
    positions: Mutex<Vec<BrokerPosition>>,
    open_orders: Mutex<Vec<OrderInfo>>,
    submitted: Mutex<Vec<SubmittedOrder>>,
    /// Number of upcoming submissions to fail before succeeding again.
    fail_next_submissions: AtomicU32,
    submit_calls: AtomicU64,
    next_broker_id: AtomicU64,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            clock: Mutex::new(MarketClock {
                is_open: true,
                next_open: now,
                next_close: now + chrono::Duration::hours(6),
                fetched_at: now,
            }),
            account: Mutex::new(Account {
                portfolio_value: Decimal::from(100_000),
                cash_available: Decimal::from(100_000),
                cash_reserved: Decimal::ZERO,
                day_trade_count: 0,
                is_tradable: true,
            }),
            positions: Mutex::new(Vec::new()),
            open_orders: Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
            fail_next_submissions: AtomicU32::new(0),
            submit_calls: AtomicU64::new(0),
            next_broker_id: AtomicU64::new(1),
        }
    }

    pub fn set_market_open(&self, is_open: bool) {
        self.clock.lock().unwrap().is_open = is_open;
    }

    pub fn set_equity(&self, equity: Decimal) {
        let mut account = self.account.lock().unwrap();
        account.portfolio_value = equity;
        account.cash_available = equity;
    }

    pub fn set_positions(&self, positions: Vec<BrokerPosition>) {
        *self.positions.lock().unwrap() = positions;
    }

    pub fn set_open_orders(&self, orders: Vec<OrderInfo>) {
        *self.open_orders.lock().unwrap() = orders;
    }

    /// Fail the next `n` submissions with a transport error.
    pub fn fail_next_submissions(&self, n: u32) {
        self.fail_next_submissions.store(n, Ordering::SeqCst);
    }

    pub fn submit_call_count(&self) -> u64 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn submitted_orders(&self) -> Vec<SubmittedOrder> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn get_clock(&self) -> Result<MarketClock, BrokerError> {
        let mut clock = self.clock.lock().unwrap().clone();
        clock.fetched_at = Utc::now();
        Ok(clock)
    }

    async fn get_account(&self) -> Result<Account, BrokerError> {
        Ok(self.account.lock().unwrap().clone())
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        limit_price: Option<Decimal>,
        client_order_id: &str,
    ) -> Result<OrderInfo, BrokerError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_next_submissions.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_submissions.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::Transport("injected submission failure".into()));
        }

        self.submitted.lock().unwrap().push(SubmittedOrder {
            symbol: symbol.to_string(),
            side,
            quantity,
            limit_price,
            client_order_id: client_order_id.to_string(),
        });

        let id = self.next_broker_id.fetch_add(1, Ordering::SeqCst);
        Ok(OrderInfo {
            broker_order_id: format!("mock-{}", id),
            client_order_id: client_order_id.to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            state: OrderState::Accepted,
        })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let mut orders = self.open_orders.lock().unwrap();
        orders.retain(|o| o.broker_order_id != broker_order_id);
        Ok(())
    }

    async fn get_open_orders(&self) -> Result<Vec<OrderInfo>, BrokerError> {
        Ok(self.open_orders.lock().unwrap().clone())
    }
}

pub struct MockMarketData {
    bars: Mutex<HashMap<String, Vec<Bar>>>,
    snapshots: Mutex<HashMap<String, Snapshot>>,
    fail_snapshots: AtomicU32,
}

impl Default for MockMarketData {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMarketData {
    pub fn new() -> Self {
        Self {
            bars: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
            fail_snapshots: AtomicU32::new(0),
        }
    }

    pub fn set_bars(&self, symbol: &str, bars: Vec<Bar>) {
        self.bars.lock().unwrap().insert(symbol.to_string(), bars);
    }

    pub fn set_snapshot(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        self.snapshots.lock().unwrap().insert(
            symbol.to_string(),
            Snapshot {
                bid,
                ask,
                bid_size: Decimal::from(100),
                ask_size: Decimal::from(100),
                fetched_at: Utc::now(),
            },
        );
    }

    pub fn fail_next_snapshots(&self, n: u32) {
        self.fail_snapshots.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl MarketData for MockMarketData {
    async fn get_bars(
        &self,
        symbol: &str,
        _timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Bar>, BrokerError> {
        let bars = self.bars.lock().unwrap();
        let all = bars.get(symbol).cloned().unwrap_or_default();
        let start = all.len().saturating_sub(limit as usize);
        Ok(all[start..].to_vec())
    }

    async fn get_snapshot(&self, symbol: &str) -> Result<Snapshot, BrokerError> {
        let remaining = self.fail_snapshots.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_snapshots.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::Transport("injected snapshot failure".into()));
        }
        self.snapshots
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .ok_or_else(|| BrokerError::Transport(format!("no snapshot for {}", symbol)))
    }
}
