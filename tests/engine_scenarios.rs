//! End-to-end scenarios wired through the in-memory store and the mock
//! broker/market-data transports.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;

use tradewind::application::exit_engine::ExitEngine;
use tradewind::application::housekeeper::Housekeeper;
use tradewind::application::orders::{OrderManager, PositionTracker};
use tradewind::application::risk::{
    CircuitBreaker, CorrelationService, DrawdownCache, DrawdownMonitor, PositionSizer, RiskManager,
};
use tradewind::application::strategy::STRATEGY_NAME;
use tradewind::config::{
    CorrelationConfig, DrawdownConfig, ExitConfig, FilterConfig, RiskConfig,
};
use tradewind::domain::errors::{EngineError, RiskTier};
use tradewind::domain::events::Event;
use tradewind::domain::repositories::StateRepository;
use tradewind::domain::session::TradingSession;
use tradewind::domain::symbols::SymbolClassifier;
use tradewind::domain::types::{
    Bar, ExitReason, OrderSide, PositionTracking, Regime, Signal, SignalMetadata,
};
use tradewind::infrastructure::event_bus::{EventBus, EventReceivers};
use tradewind::infrastructure::mock::{MockBroker, MockMarketData};
use tradewind::infrastructure::persistence::{Database, SqliteStateRepository};

/// Everything a scenario needs, built over one shared database.
struct Harness {
    database: Database,
    repository: Arc<dyn StateRepository>,
    broker: Arc<MockBroker>,
    market_data: Arc<MockMarketData>,
    receivers: Option<EventReceivers>,
    drawdown: Arc<DrawdownCache>,
    breaker: Arc<CircuitBreaker>,
    orders: Arc<OrderManager>,
    housekeeper: Housekeeper,
    exit_engine: ExitEngine,
}

fn classifier() -> Arc<SymbolClassifier> {
    Arc::new(SymbolClassifier::new(
        vec!["BTC/USD".to_string()],
        vec!["AAPL".to_string(), "MSFT".to_string()],
        HashMap::new(),
        HashMap::new(),
    ))
}

fn session() -> TradingSession {
    TradingSession::new("America/New_York", "09:30", "16:00").unwrap()
}

impl Harness {
    async fn new() -> Self {
        let database = Database::in_memory().await.unwrap();
        Self::over(database).await
    }

    /// Build a fresh service stack over an existing database, simulating a
    /// process restart when called twice with the same handle.
    async fn over(database: Database) -> Self {
        let repository: Arc<dyn StateRepository> =
            Arc::new(SqliteStateRepository::new(database.clone()));
        let broker = Arc::new(MockBroker::new());
        let market_data = Arc::new(MockMarketData::new());
        market_data.set_snapshot("AAPL", dec!(150.00), dec!(150.05));
        market_data.set_snapshot("MSFT", dec!(400.00), dec!(400.10));
        market_data.set_snapshot("BTC/USD", dec!(50000), dec!(50010));

        let (bus, receivers) = EventBus::new(10_000);
        let breaker = Arc::new(CircuitBreaker::new(repository.clone()));
        breaker.hydrate().await.unwrap();
        let drawdown = Arc::new(DrawdownCache::new(0.5));

        let risk = Arc::new(RiskManager::new(
            repository.clone(),
            broker.clone(),
            market_data.clone(),
            CorrelationService::new(CorrelationConfig::default(), classifier()),
            drawdown.clone(),
            breaker.clone(),
            classifier(),
            session(),
            RiskConfig::default(),
            FilterConfig::default(),
            false,
        ));

        let tracker = Arc::new(PositionTracker::new(repository.clone(), 0.015));
        let orders = Arc::new(OrderManager::new(
            repository.clone(),
            broker.clone(),
            bus.clone(),
            PositionSizer::new(0.10, 0.01, 0.02).unwrap(),
            risk,
            drawdown.clone(),
            breaker.clone(),
            tracker.clone(),
            false,
            1,
            300,
        ));

        let housekeeper = Housekeeper::new(
            repository.clone(),
            broker.clone(),
            breaker.clone(),
            session(),
        );

        let exit_engine = ExitEngine::new(
            repository.clone(),
            broker.clone(),
            market_data.clone(),
            classifier(),
            bus.clone(),
            ExitConfig::default(),
        );

        Self {
            database,
            repository,
            broker,
            market_data,
            receivers: Some(receivers),
            drawdown,
            breaker,
            orders,
            housekeeper,
            exit_engine,
        }
    }

    async fn restart(self) -> Self {
        Self::over(self.database.clone()).await
    }
}

fn buy_signal(symbol: &str, signal_ts: DateTime<Utc>) -> Signal {
    Signal {
        strategy: STRATEGY_NAME.to_string(),
        symbol: symbol.to_string(),
        timeframe: "1Min".to_string(),
        side: OrderSide::Buy,
        signal_ts,
        quantity: Decimal::ZERO,
        limit_price: dec!(150),
        metadata: SignalMetadata {
            sma_pair: "10/30".to_string(),
            fast_sma: 151.0,
            medium_sma: 150.0,
            slow_sma: 149.0,
            atr: Some(2.0),
            confidence: 0.8,
            regime: Regime::TrendingUp,
            regime_strength: 1.0,
            current_price: dec!(150),
            bars_in_regime: 20,
        },
    }
}

fn signal_ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 21, 14, 30, 0).unwrap()
}

#[tokio::test]
async fn idempotent_submit_across_restart() {
    let harness = Harness::new().await;
    let signal = buy_signal("AAPL", signal_ts());

    let id = harness.orders.handle_signal(&signal).await.unwrap().unwrap();
    // First 16 hex chars of
    // sha256("sma_crossover_multi:AAPL:1Min:2024-02-21T14:30:00.0000000+00:00:buy").
    assert_eq!(id, "4658138278b7ed2d");
    assert_eq!(harness.broker.submit_call_count(), 1);

    // Restart: new service stack, same database, replayed signal.
    let harness = harness.restart().await;
    let id_again = harness.orders.handle_signal(&signal).await.unwrap().unwrap();
    assert_eq!(id_again, id);
    // The fresh broker instance was never contacted.
    assert_eq!(harness.broker.submit_call_count(), 0);

    let intent = harness.repository.get_order_intent(&id).await.unwrap().unwrap();
    assert!(intent.broker_order_id.is_some());
}

#[tokio::test]
async fn circuit_breaker_trips_and_resets_at_daily_reset() {
    let harness = Harness::new().await;

    harness.broker.fail_next_submissions(5);
    for i in 0..5 {
        let ts = signal_ts() + chrono::Duration::minutes(i);
        let err = harness
            .orders
            .handle_signal(&buy_signal("AAPL", ts))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Broker(_)));
    }
    assert_eq!(harness.breaker.count(), 5);

    // Next signal dies in the safety tier before any broker contact.
    let calls_before = harness.broker.submit_call_count();
    let err = harness
        .orders
        .handle_signal(&buy_signal("AAPL", signal_ts() + chrono::Duration::minutes(10)))
        .await
        .unwrap_err();
    match err {
        EngineError::Risk(risk) => {
            assert_eq!(risk.tier, RiskTier::Safety);
            assert!(risk.reason.contains("circuit breaker"));
        }
        other => panic!("expected risk error, got {other:?}"),
    }
    assert_eq!(harness.broker.submit_call_count(), calls_before);

    // Housekeeper daily reset on a weekday morning clears the breaker.
    let weekday_morning = Utc.with_ymd_and_hms(2024, 2, 21, 15, 0, 0).unwrap();
    harness.housekeeper.tick(weekday_morning).await.unwrap();
    assert_eq!(harness.breaker.count(), 0);

    let id = harness
        .orders
        .handle_signal(&buy_signal("AAPL", signal_ts() + chrono::Duration::minutes(20)))
        .await
        .unwrap();
    assert!(id.is_some());
}

#[tokio::test]
async fn same_bar_gate_rejects_duplicate_signals() {
    let harness = Harness::new().await;
    let ts = signal_ts();

    let first = harness
        .orders
        .handle_signal(&buy_signal("MSFT", ts))
        .await
        .unwrap();
    assert!(first.is_some());
    assert_eq!(harness.broker.submit_call_count(), 1);

    // Same bar, same symbol, but the first order is already in flight under
    // the same derived id, so the manager returns it without resubmitting.
    let second = harness
        .orders
        .handle_signal(&buy_signal("MSFT", ts))
        .await
        .unwrap();
    assert_eq!(second, first);
    assert_eq!(harness.broker.submit_call_count(), 1);

    // The gate itself also refuses the bar timestamp now.
    let accepted = harness
        .repository
        .gate_try_accept("entry_gate:MSFT:1Min", ts, Utc::now(), std::time::Duration::ZERO)
        .await
        .unwrap();
    assert!(!accepted);
}

#[tokio::test]
async fn gate_rejection_survives_restart() {
    let harness = Harness::new().await;
    let ts = signal_ts();
    assert!(harness
        .repository
        .gate_try_accept("entry_gate:AAPL:1Min", ts, Utc::now(), std::time::Duration::ZERO)
        .await
        .unwrap());

    let harness = harness.restart().await;
    assert!(!harness
        .repository
        .gate_try_accept("entry_gate:AAPL:1Min", ts, Utc::now(), std::time::Duration::ZERO)
        .await
        .unwrap());
}

#[tokio::test]
async fn drawdown_ladder_gates_orders_and_scales_size() {
    let harness = Harness::new().await;
    let monitor = DrawdownMonitor::new(
        harness.repository.clone(),
        harness.broker.clone(),
        harness.drawdown.clone(),
        DrawdownConfig::default(),
    );
    let now = Utc::now();

    harness.broker.set_equity(dec!(100000));
    monitor.tick(now).await.unwrap();

    // 3% drawdown: Warning, entries run at half size.
    harness.broker.set_equity(dec!(97000));
    monitor.tick(now).await.unwrap();
    let id = harness
        .orders
        .handle_signal(&buy_signal("AAPL", signal_ts()))
        .await
        .unwrap()
        .unwrap();
    let intent = harness.repository.get_order_intent(&id).await.unwrap().unwrap();
    // Sizer: min(97000*0.10/150, 97000*0.01/(150*0.02)) = 64.67 → 64; halved → 32.
    assert_eq!(intent.quantity, dec!(32));

    // 5% drawdown: Halt rejects new entries.
    harness.broker.set_equity(dec!(95000));
    monitor.tick(now).await.unwrap();
    let err = harness
        .orders
        .handle_signal(&buy_signal("AAPL", signal_ts() + chrono::Duration::minutes(1)))
        .await
        .unwrap_err();
    match err {
        EngineError::Risk(risk) => {
            assert_eq!(risk.tier, RiskTier::Risk);
            assert!(risk.reason.contains("Drawdown halt"));
        }
        other => panic!("expected halt, got {other:?}"),
    }

    // 10% drawdown: Emergency rejects everything.
    harness.broker.set_equity(dec!(90000));
    let tick = monitor.tick(now).await.unwrap();
    assert!(tick.entered_emergency());
    let err = harness
        .orders
        .handle_signal(&buy_signal("AAPL", signal_ts() + chrono::Duration::minutes(2)))
        .await
        .unwrap_err();
    match err {
        EngineError::Risk(risk) => {
            assert_eq!(risk.tier, RiskTier::Safety);
            assert!(risk.reason.contains("Drawdown emergency"));
        }
        other => panic!("expected emergency, got {other:?}"),
    }

    // Recovery to 3.5% with auto-recovery lands on Warning.
    harness.broker.set_equity(dec!(96500));
    let tick = monitor.tick(now).await.unwrap();
    assert_eq!(
        tick.state.level,
        tradewind::domain::types::DrawdownLevel::Warning
    );
    assert_eq!(harness.drawdown.position_multiplier().await, 0.5);
}

#[tokio::test]
async fn exit_signal_outruns_a_saturated_bus() {
    let (bus, mut receivers) = EventBus::new(100);

    let bar = |i: i64| {
        Event::Bar(Bar {
            symbol: "AAPL".to_string(),
            timeframe: "1Min".to_string(),
            timestamp: Utc::now() + chrono::Duration::minutes(i),
            open: dec!(100),
            high: dec!(101),
            low: dec!(99),
            close: dec!(100.5),
            volume: dec!(1000),
        })
    };

    // Saturate the normal channel; overflow is dropped and counted.
    for i in 0..150 {
        bus.publish(bar(i));
    }
    assert_eq!(bus.dropped_count(), 50);

    // Published last, dispatched first.
    bus.publish_exit(Event::ExitSignal(tradewind::domain::events::ExitSignal {
        symbol: "AAPL".to_string(),
        quantity: dec!(10),
        reason: ExitReason::AtrStopLoss,
        price: dec!(99),
        timestamp: Utc::now(),
    }))
    .unwrap();

    let first = receivers.try_recv_exit().expect("exit signal queued");
    assert!(matches!(first, Event::ExitSignal(_)));
    // Normal events are still all there behind it.
    let mut bars = 0;
    while receivers.try_recv_normal().is_some() {
        bars += 1;
    }
    assert_eq!(bars, 100);
}

#[tokio::test]
async fn atr_stop_beats_trailing_and_flows_to_the_broker() {
    let mut harness = Harness::new().await;

    // Position: entry 150, atr 2, trailing 147; stop level 150 - 3 = 147.
    harness
        .repository
        .upsert_position(&PositionTracking {
            symbol: "AAPL".to_string(),
            quantity: dec!(10),
            entry_price: dec!(150),
            atr_value: 2.0,
            trailing_stop_price: dec!(147),
            last_update_at: Utc::now(),
            pending_exit: false,
        })
        .await
        .unwrap();
    harness.market_data.set_snapshot("AAPL", dec!(146.85), dec!(146.95));

    let t0 = Utc::now();
    let published = harness.exit_engine.scan(t0).await.unwrap();
    assert_eq!(published, 1);

    let mut receivers = harness.receivers.take().unwrap();
    let exit = match receivers.try_recv_exit().unwrap() {
        Event::ExitSignal(exit) => exit,
        other => panic!("unexpected event {other:?}"),
    };
    assert_eq!(exit.reason, ExitReason::AtrStopLoss);
    assert_eq!(exit.quantity, dec!(10));

    // Lock discipline: pending only after the publish succeeded.
    let position = harness.repository.get_position("AAPL").await.unwrap().unwrap();
    assert!(position.pending_exit);

    // The dispatched exit reaches the broker under a daily-unique id.
    let id = harness.orders.submit_exit(&exit).await.unwrap().unwrap();
    assert_eq!(harness.broker.submit_call_count(), 1);
    let submitted = harness.broker.submitted_orders();
    assert_eq!(submitted[0].side, OrderSide::Sell);
    assert_eq!(submitted[0].client_order_id, id);

    // A second scan inside the backoff window stays quiet.
    assert_eq!(harness.exit_engine.scan(t0).await.unwrap(), 0);
}

#[tokio::test]
async fn fills_update_positions_and_daily_counters() {
    let harness = Harness::new().await;
    let signal = buy_signal("AAPL", signal_ts());
    let id = harness.orders.handle_signal(&signal).await.unwrap().unwrap();

    let update = tradewind::domain::events::OrderUpdate {
        broker_order_id: "mock-1".to_string(),
        client_order_id: id.clone(),
        symbol: "AAPL".to_string(),
        side: OrderSide::Buy,
        state: tradewind::domain::types::OrderState::Filled,
        filled_qty: dec!(64),
        filled_price: Some(dec!(150)),
        dedupe_key: Some("seq-1".to_string()),
        timestamp: Utc::now(),
    };
    harness.orders.handle_order_update(&update, Some(2.0)).await.unwrap();
    // Redelivery is a no-op.
    harness.orders.handle_order_update(&update, Some(2.0)).await.unwrap();

    let position = harness.repository.get_position("AAPL").await.unwrap().unwrap();
    assert_eq!(position.quantity, dec!(64));
    assert_eq!(position.entry_price, dec!(150));
    assert_eq!(position.atr_value, 2.0);

    assert_eq!(
        harness
            .repository
            .get_state(tradewind::domain::types::state_keys::DAILY_TRADE_COUNT)
            .await
            .unwrap(),
        Some("1".to_string())
    );

    // Entry blocked while the position is open.
    let blocked = harness
        .orders
        .handle_signal(&buy_signal("AAPL", signal_ts() + chrono::Duration::minutes(5)))
        .await
        .unwrap();
    assert!(blocked.is_none());

    // Sell fill closes the book and realizes PnL.
    let sell = tradewind::domain::events::OrderUpdate {
        broker_order_id: "mock-2".to_string(),
        client_order_id: "feedbeeffeedbeef".to_string(),
        symbol: "AAPL".to_string(),
        side: OrderSide::Sell,
        state: tradewind::domain::types::OrderState::Filled,
        filled_qty: dec!(64),
        filled_price: Some(dec!(155)),
        dedupe_key: Some("seq-2".to_string()),
        timestamp: Utc::now(),
    };
    harness.orders.handle_order_update(&sell, None).await.unwrap();
    assert!(harness.repository.get_position("AAPL").await.unwrap().is_none());
    assert_eq!(
        harness
            .repository
            .get_state(tradewind::domain::types::state_keys::DAILY_REALIZED_PNL)
            .await
            .unwrap(),
        Some("320".to_string())
    );
}

#[tokio::test]
async fn terminal_exit_failure_releases_the_lock() {
    let harness = Harness::new().await;
    harness
        .repository
        .upsert_position(&PositionTracking {
            symbol: "AAPL".to_string(),
            quantity: dec!(10),
            entry_price: dec!(150),
            atr_value: 2.0,
            trailing_stop_price: dec!(147),
            last_update_at: Utc::now(),
            pending_exit: true,
        })
        .await
        .unwrap();
    let exit_id = tradewind::domain::ids::exit_order_id(
        "AAPL",
        Utc::now().date_naive(),
        OrderSide::Sell,
    );
    harness
        .repository
        .save_order_intent(&tradewind::domain::types::OrderIntent {
            client_order_id: exit_id.clone(),
            broker_order_id: Some("mock-9".to_string()),
            symbol: "AAPL".to_string(),
            side: OrderSide::Sell,
            quantity: dec!(10),
            limit_price: None,
            state: tradewind::domain::types::OrderState::Accepted,
            created_at: Utc::now(),
            updated_at: None,
        })
        .await
        .unwrap();

    let rejection = tradewind::domain::events::OrderUpdate {
        broker_order_id: "mock-9".to_string(),
        client_order_id: exit_id,
        symbol: "AAPL".to_string(),
        side: OrderSide::Sell,
        state: tradewind::domain::types::OrderState::Rejected,
        filled_qty: Decimal::ZERO,
        filled_price: None,
        dedupe_key: None,
        timestamp: Utc::now(),
    };
    harness.orders.handle_order_update(&rejection, None).await.unwrap();

    let position = harness.repository.get_position("AAPL").await.unwrap().unwrap();
    assert!(!position.pending_exit);
    // A retry is scheduled on the backoff ladder.
    assert!(harness
        .repository
        .exit_backoff_seconds("AAPL", Utc::now() - chrono::Duration::seconds(1))
        .await
        .unwrap()
        > 0);
}
