//! Engine orchestration.
//!
//! Owns the component tree: every service hangs off the orchestrator and
//! receives its collaborators as injected read-only capabilities, so there
//! are no back-edges. Background jobs (bar polling, exit scan, drawdown
//! monitor, reconciler, housekeeper) run as cooperative timer tasks that
//! publish onto the bus or write through the repository; the single
//! dispatcher serialises all event handling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::data_handler::DataHandler;
use crate::application::exit_engine::ExitEngine;
use crate::application::housekeeper::Housekeeper;
use crate::application::orders::{OrderManager, PositionTracker};
use crate::application::reconciler::Reconciler;
use crate::application::risk::{
    CircuitBreaker, CorrelationService, DrawdownCache, DrawdownMonitor, PositionSizer, RiskManager,
};
use crate::application::strategy::StrategyCore;
use crate::config::Config;
use crate::domain::errors::EngineError;
use crate::domain::events::Event;
use crate::domain::ports::{Broker, MarketData};
use crate::domain::repositories::StateRepository;
use crate::domain::session::TradingSession;
use crate::infrastructure::event_bus::{DEFAULT_CAPACITY, Dispatcher, EventBus, EventHandler};

const RECONCILE_INTERVAL_SECONDS: u64 = 120;
const HOUSEKEEPING_INTERVAL_SECONDS: u64 = 60;

/// Event pipeline run by the dispatcher: bars feed the strategy, signals
/// and exits feed the order manager, updates maintain durable state.
struct Pipeline {
    data_handler: DataHandler,
    strategy: StrategyCore,
    orders: Arc<OrderManager>,
    tracker: Arc<PositionTracker>,
    bus: EventBus,
}

#[async_trait]
impl EventHandler for Pipeline {
    async fn handle(&mut self, event: Event) -> anyhow::Result<()> {
        match event {
            Event::Bar(bar) => {
                if !self.data_handler.ingest(&bar).await? {
                    return Ok(());
                }
                let signals = self.strategy.on_bar(&bar);
                // Held positions ride the fresh bar: ATR refresh plus the
                // trailing-stop ratchet.
                self.tracker
                    .refresh_market_state(
                        &bar.symbol,
                        bar.close,
                        self.strategy.current_atr(&bar.symbol),
                        bar.timestamp,
                    )
                    .await?;
                for signal in signals {
                    self.bus.publish(Event::Signal(signal));
                }
            }
            Event::Signal(signal) => {
                self.orders.handle_signal(&signal).await?;
            }
            Event::ExitSignal(exit) => {
                self.orders.submit_exit(&exit).await?;
            }
            Event::OrderUpdate(update) => {
                let atr = self.strategy.current_atr(&update.symbol);
                self.orders.handle_order_update(&update, atr).await?;
            }
            Event::OrderIntent(intent) => {
                debug!(
                    client_order_id = %intent.client_order_id,
                    symbol = %intent.symbol,
                    state = %intent.state,
                    "order intent observed"
                );
            }
        }
        Ok(())
    }
}

pub struct Engine {
    config: Config,
    repository: Arc<dyn StateRepository>,
    broker: Arc<dyn Broker>,
    market_data: Arc<dyn MarketData>,
    bus: EventBus,
    receivers: crate::infrastructure::event_bus::EventReceivers,
}

impl Engine {
    pub fn new(
        config: Config,
        repository: Arc<dyn StateRepository>,
        broker: Arc<dyn Broker>,
        market_data: Arc<dyn MarketData>,
    ) -> Self {
        let (bus, receivers) = EventBus::new(DEFAULT_CAPACITY);
        Self {
            config,
            repository,
            broker,
            market_data,
            bus,
            receivers,
        }
    }

    /// Bus handle for inbound adaptors: pushed bars and broker execution
    /// reports enter the system here.
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Run until the shutdown signal flips. Refuses to start when startup
    /// reconciliation finds uncorrectable discrepancies.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        let classifier = Arc::new(self.config.classifier());
        let session = TradingSession::new(
            &self.config.session.time_zone,
            &self.config.session.market_open_time,
            &self.config.session.market_close_time,
        )?;
        let universe = classifier.universe();
        if universe.is_empty() {
            return Err(EngineError::Internal(
                "no symbols configured, nothing to trade".to_string(),
            ));
        }

        let bus = self.bus.clone();
        let receivers = self.receivers;

        let breaker = Arc::new(CircuitBreaker::new(self.repository.clone()));
        breaker.hydrate().await?;

        let drawdown_cache = Arc::new(DrawdownCache::new(
            self.config.drawdown.warning_position_multiplier,
        ));
        let drawdown_monitor = Arc::new(DrawdownMonitor::new(
            self.repository.clone(),
            self.broker.clone(),
            drawdown_cache.clone(),
            self.config.drawdown.clone(),
        ));
        drawdown_monitor.hydrate().await?;

        let sizer = PositionSizer::new(
            self.config.risk.max_position_pct,
            self.config.risk.max_risk_per_trade_pct,
            self.config.risk.stop_loss_pct,
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;

        let risk = Arc::new(RiskManager::new(
            self.repository.clone(),
            self.broker.clone(),
            self.market_data.clone(),
            CorrelationService::new(self.config.correlation_limits.clone(), classifier.clone()),
            drawdown_cache.clone(),
            breaker.clone(),
            classifier.clone(),
            session.clone(),
            self.config.risk.clone(),
            self.config.filters.clone(),
            self.config.execution.kill_switch,
        ));

        let tracker = Arc::new(PositionTracker::new(
            self.repository.clone(),
            self.config.exit.trailing_stop_percent,
        ));

        let orders = Arc::new(OrderManager::new(
            self.repository.clone(),
            self.broker.clone(),
            bus.clone(),
            sizer,
            risk.clone(),
            drawdown_cache.clone(),
            breaker.clone(),
            tracker.clone(),
            self.config.execution.dry_run,
            self.config.exit.backoff_base_seconds,
            self.config.exit.backoff_max_seconds,
        ));

        let exit_engine = Arc::new(ExitEngine::new(
            self.repository.clone(),
            self.broker.clone(),
            self.market_data.clone(),
            classifier.clone(),
            bus.clone(),
            self.config.exit.clone(),
        ));

        let reconciler = Arc::new(Reconciler::new(self.repository.clone(), self.broker.clone()));
        let housekeeper = Arc::new(Housekeeper::new(
            self.repository.clone(),
            self.broker.clone(),
            breaker.clone(),
            session.clone(),
        ));

        // Startup reconciliation gates the event loop.
        let clean = reconciler
            .run_startup()
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        if !clean {
            return Err(EngineError::ReconciliationHalt);
        }

        let positions = self.repository.all_positions().await?;
        info!(
            symbols = universe.len(),
            open_positions = positions.len(),
            dry_run = self.config.execution.dry_run,
            "engine starting"
        );

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tasks.push(tokio::spawn(poll_bars(
            self.market_data.clone(),
            bus.clone(),
            universe.clone(),
            self.config.data.clone(),
            shutdown.clone(),
        )));

        tasks.push(tokio::spawn(run_interval(
            "exit_scan",
            self.config.exit.check_interval_seconds,
            shutdown.clone(),
            {
                let exit_engine = exit_engine.clone();
                move || {
                    let exit_engine = exit_engine.clone();
                    async move {
                        if let Err(e) = exit_engine.scan(Utc::now()).await {
                            error!(error = %e, "exit scan failed");
                        }
                    }
                }
            },
        )));

        if self.config.drawdown.enabled {
            let orders_for_flatten = orders.clone();
            let monitor = drawdown_monitor.clone();
            tasks.push(tokio::spawn(run_interval(
                "drawdown_monitor",
                self.config.drawdown.check_interval_seconds,
                shutdown.clone(),
                move || {
                    let monitor = monitor.clone();
                    let orders = orders_for_flatten.clone();
                    async move {
                        match monitor.tick(Utc::now()).await {
                            Err(e) => error!(error = %e, "drawdown tick failed"),
                            Ok(tick) => {
                                if tick.entered_emergency() {
                                    warn!("emergency drawdown, flattening all positions");
                                    if let Err(e) = orders.flatten_positions().await {
                                        error!(error = %e, "emergency flatten failed");
                                    }
                                }
                            }
                        }
                    }
                },
            )));
        }

        tasks.push(tokio::spawn(run_interval(
            "reconciler",
            RECONCILE_INTERVAL_SECONDS,
            shutdown.clone(),
            {
                let reconciler = reconciler.clone();
                move || {
                    let reconciler = reconciler.clone();
                    async move { reconciler.run_periodic().await }
                }
            },
        )));

        tasks.push(tokio::spawn(run_interval(
            "housekeeper",
            HOUSEKEEPING_INTERVAL_SECONDS,
            shutdown.clone(),
            {
                let housekeeper = housekeeper.clone();
                move || {
                    let housekeeper = housekeeper.clone();
                    async move {
                        if let Err(e) = housekeeper.tick(Utc::now()).await {
                            error!(error = %e, "housekeeping tick failed");
                        }
                    }
                }
            },
        )));

        let mut pipeline = Pipeline {
            data_handler: DataHandler::new(self.repository.clone(), &self.config.data.timeframe),
            strategy: StrategyCore::new(&universe, &self.config.data.timeframe),
            orders: orders.clone(),
            tracker,
            bus: bus.clone(),
        };

        Dispatcher::new(receivers, shutdown.clone())
            .run(&mut pipeline)
            .await;

        if self.config.execution.flatten_on_shutdown {
            info!("flatten-on-shutdown enabled, closing all positions");
            if let Err(e) = orders.flatten_positions().await {
                error!(error = %e, "shutdown flatten failed");
            }
        }

        for task in tasks {
            task.abort();
        }
        info!(dropped_events = bus.dropped_count(), "engine stopped");
        Ok(())
    }
}

/// Poll the market-data port and republish fresh bars onto the bus. The
/// first pass pulls the warmup window; later passes pull a short tail.
async fn poll_bars(
    market_data: Arc<dyn MarketData>,
    bus: EventBus,
    symbols: Vec<String>,
    config: crate::config::DataConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_seen: HashMap<String, DateTime<Utc>> = HashMap::new();
    let mut warmed = false;
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(config.poll_interval_seconds.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {}
        }

        let limit = if warmed { 3 } else { config.warmup_bars };
        for symbol in &symbols {
            match market_data.get_bars(symbol, &config.timeframe, limit).await {
                Ok(bars) => {
                    for bar in bars {
                        let fresh = last_seen
                            .get(symbol)
                            .map(|seen| bar.timestamp > *seen)
                            .unwrap_or(true);
                        if fresh {
                            last_seen.insert(symbol.clone(), bar.timestamp);
                            bus.publish(Event::Bar(bar));
                        }
                    }
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "bar poll failed");
                }
            }
        }
        warmed = true;
    }
}

/// Generic timer loop for background jobs.
async fn run_interval<F, Fut>(
    name: &'static str,
    interval_seconds: u64,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) where
    F: FnMut() -> Fut + Send,
    Fut: std::future::Future<Output = ()> + Send,
{
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(job = name, interval_seconds, "background job started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                job().await;
            }
        }
    }
    info!(job = name, "background job stopped");
}
