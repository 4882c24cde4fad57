//! Three-tier gating pipeline.
//!
//! Tier 1 (Safety) and Tier 2 (Risk) produce hard failures the order
//! manager raises; Tier 3 (Filter) produces soft skips that are logged and
//! swallowed. The tiers run in order and the first hit wins.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

use crate::application::risk::circuit_breaker::{CircuitBreaker, TRIP_THRESHOLD};
use crate::application::risk::correlation::{ConcentrationCheck, CorrelationService};
use crate::application::risk::drawdown::DrawdownCache;
use crate::config::{FilterConfig, RiskConfig};
use crate::domain::errors::{BrokerError, RiskDecision, RiskTier, StoreError};
use crate::domain::ports::{Broker, MarketData};
use crate::domain::repositories::StateRepository;
use crate::domain::session::TradingSession;
use crate::domain::symbols::SymbolClassifier;
use crate::domain::types::{DrawdownLevel, Signal, state_keys};

#[derive(Debug, thiserror::Error)]
pub enum RiskCheckError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl From<RiskCheckError> for crate::domain::errors::EngineError {
    fn from(err: RiskCheckError) -> Self {
        match err {
            RiskCheckError::Store(e) => Self::Store(e),
            RiskCheckError::Broker(e) => Self::Broker(e),
        }
    }
}

/// Point-in-time inputs for one gating run.
pub struct GateContext<'a> {
    pub signal: &'a Signal,
    /// Final order quantity after the drawdown multiplier and floor.
    pub quantity: Decimal,
    /// Raw sizer output, present when the signal carried the zero sentinel.
    pub sized_quantity: Option<Decimal>,
    pub price: Decimal,
    pub now: DateTime<Utc>,
}

pub struct RiskManager {
    repository: Arc<dyn StateRepository>,
    broker: Arc<dyn Broker>,
    market_data: Arc<dyn MarketData>,
    correlation: CorrelationService,
    drawdown: Arc<DrawdownCache>,
    breaker: Arc<CircuitBreaker>,
    classifier: Arc<SymbolClassifier>,
    session: TradingSession,
    risk_config: RiskConfig,
    filter_config: FilterConfig,
    kill_switch: bool,
}

impl RiskManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn StateRepository>,
        broker: Arc<dyn Broker>,
        market_data: Arc<dyn MarketData>,
        correlation: CorrelationService,
        drawdown: Arc<DrawdownCache>,
        breaker: Arc<CircuitBreaker>,
        classifier: Arc<SymbolClassifier>,
        session: TradingSession,
        risk_config: RiskConfig,
        filter_config: FilterConfig,
        kill_switch: bool,
    ) -> Self {
        Self {
            repository,
            broker,
            market_data,
            correlation,
            drawdown,
            breaker,
            classifier,
            session,
            risk_config,
            filter_config,
            kill_switch,
        }
    }

    fn hard(tier: RiskTier, reason: impl Into<String>) -> RiskDecision {
        RiskDecision::Halt {
            tier,
            reason: reason.into(),
        }
    }

    /// Full three-tier evaluation for strategy signals.
    pub async fn evaluate(&self, ctx: &GateContext<'_>) -> Result<RiskDecision, RiskCheckError> {
        if let Some(decision) = self.tier_safety(&ctx.signal.symbol).await? {
            return Ok(decision);
        }
        if let Some(decision) = self.tier_risk(ctx).await? {
            return Ok(decision);
        }
        if let Some(reason) = self.tier_filter(ctx).await? {
            return Ok(RiskDecision::Skip(reason));
        }
        Ok(RiskDecision::Pass)
    }

    /// Safety tier only. Exit submissions must not be starved by limits
    /// that exist to bound new exposure.
    pub async fn evaluate_exit(&self, symbol: &str) -> Result<RiskDecision, RiskCheckError> {
        Ok(self
            .tier_safety(symbol)
            .await?
            .unwrap_or(RiskDecision::Pass))
    }

    async fn tier_safety(&self, symbol: &str) -> Result<Option<RiskDecision>, RiskCheckError> {
        if self.kill_switch {
            return Ok(Some(Self::hard(RiskTier::Safety, "kill switch engaged")));
        }

        if let Some(halted) = self.repository.get_state(state_keys::TRADING_HALTED).await?
            && halted == "true"
        {
            return Ok(Some(Self::hard(
                RiskTier::Safety,
                "trading halted pending reconciliation",
            )));
        }

        if self.drawdown.level().await == DrawdownLevel::Emergency {
            return Ok(Some(Self::hard(RiskTier::Safety, "Drawdown emergency")));
        }

        let failures = self.breaker.count();
        if failures >= TRIP_THRESHOLD {
            return Ok(Some(Self::hard(
                RiskTier::Safety,
                format!("circuit breaker open after {} consecutive failures", failures),
            )));
        }

        // Fresh clock call every time; the broker clock is never cached.
        let clock = self.broker.get_clock().await?;
        if !clock.is_open && !self.classifier.is_crypto(symbol) {
            return Ok(Some(Self::hard(RiskTier::Safety, "market closed")));
        }

        Ok(None)
    }

    async fn tier_risk(&self, ctx: &GateContext<'_>) -> Result<Option<RiskDecision>, RiskCheckError> {
        if self.drawdown.level().await == DrawdownLevel::Halt {
            return Ok(Some(Self::hard(RiskTier::Risk, "Drawdown halt")));
        }

        let daily_pnl = self.daily_realized_pnl().await?;
        let max_loss = Decimal::try_from(self.risk_config.max_daily_loss).unwrap_or_default();
        if daily_pnl < -max_loss {
            return Ok(Some(Self::hard(
                RiskTier::Risk,
                format!("daily loss limit breached: pnl {} below -{}", daily_pnl, max_loss),
            )));
        }

        let trade_count = self.daily_trade_count().await?;
        if trade_count >= self.risk_config.max_trades_per_day {
            return Ok(Some(Self::hard(
                RiskTier::Risk,
                format!("daily trade limit reached: {}", trade_count),
            )));
        }

        let positions = self.broker.get_positions().await?;
        let held: Vec<String> = positions
            .iter()
            .filter(|p| p.quantity != Decimal::ZERO)
            .map(|p| p.symbol.clone())
            .collect();
        let already_held = held.iter().any(|h| h == &ctx.signal.symbol);
        if held.len() >= self.risk_config.max_concurrent_positions && !already_held {
            return Ok(Some(Self::hard(
                RiskTier::Risk,
                format!(
                    "position limit reached: {} of {}",
                    held.len(),
                    self.risk_config.max_concurrent_positions
                ),
            )));
        }

        if let Some(sized) = ctx.sized_quantity
            && sized < Decimal::ONE
        {
            return Ok(Some(Self::hard(
                RiskTier::Risk,
                format!("sized quantity {} below minimum of 1", sized),
            )));
        }

        Ok(None)
    }

    /// Returns the first filter skip reason, or `None` to pass.
    async fn tier_filter(&self, ctx: &GateContext<'_>) -> Result<Option<String>, RiskCheckError> {
        let metadata = &ctx.signal.metadata;

        if metadata.confidence < self.risk_config.min_signal_confidence {
            return Ok(Some(format!(
                "confidence {:.2} below minimum {:.2}",
                metadata.confidence, self.risk_config.min_signal_confidence
            )));
        }

        if metadata.bars_in_regime < self.risk_config.min_bars_in_regime {
            return Ok(Some(format!(
                "regime only {} bars old, need {}",
                metadata.bars_in_regime, self.risk_config.min_bars_in_regime
            )));
        }

        // Session-edge filter applies to exchange-traded names only; crypto
        // has no open or close.
        if self.classifier.is_equity(&ctx.signal.symbol) {
            let after_open = self.session.minutes_after_open(ctx.now);
            if after_open < self.filter_config.min_minutes_after_open {
                return Ok(Some(format!(
                    "only {} minutes after open, need {}",
                    after_open, self.filter_config.min_minutes_after_open
                )));
            }
            let before_close = self.session.minutes_before_close(ctx.now);
            if before_close < self.filter_config.min_minutes_before_close {
                return Ok(Some(format!(
                    "only {} minutes before close, need {}",
                    before_close, self.filter_config.min_minutes_before_close
                )));
            }
        }

        let positions = self.broker.get_positions().await?;
        let held: Vec<String> = positions
            .iter()
            .filter(|p| p.quantity != Decimal::ZERO)
            .map(|p| p.symbol.clone())
            .collect();
        if let ConcentrationCheck::Block(reason) = self.correlation.check(
            &ctx.signal.symbol,
            &held,
            self.risk_config.max_concurrent_positions,
        ) {
            return Ok(Some(reason));
        }

        // A snapshot fetch failure skips the spread check, not the signal.
        match self.market_data.get_snapshot(&ctx.signal.symbol).await {
            Ok(snapshot) => {
                if snapshot.bid > Decimal::ZERO {
                    let spread = ((snapshot.ask - snapshot.bid) / snapshot.bid)
                        .to_f64()
                        .unwrap_or(f64::MAX);
                    if spread > self.filter_config.max_spread_pct {
                        return Ok(Some(format!(
                            "spread {:.4} exceeds {:.4}",
                            spread, self.filter_config.max_spread_pct
                        )));
                    }
                }
            }
            Err(e) => {
                warn!(
                    symbol = %ctx.signal.symbol,
                    error = %e,
                    "snapshot fetch failed, skipping spread check"
                );
            }
        }

        Ok(None)
    }

    async fn daily_realized_pnl(&self) -> Result<Decimal, StoreError> {
        Ok(self
            .repository
            .get_state(state_keys::DAILY_REALIZED_PNL)
            .await?
            .and_then(|v| Decimal::from_str(&v).ok())
            .unwrap_or(Decimal::ZERO))
    }

    async fn daily_trade_count(&self) -> Result<u32, StoreError> {
        Ok(self
            .repository
            .get_state(state_keys::DAILY_TRADE_COUNT)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::strategy::STRATEGY_NAME;
    use crate::config::CorrelationConfig;
    use crate::domain::ports::BrokerPosition;
    use crate::domain::types::{OrderSide, Regime, SignalMetadata};
    use crate::infrastructure::mock::{MockBroker, MockMarketData};
    use crate::infrastructure::persistence::{Database, SqliteStateRepository};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    struct Fixture {
        repository: Arc<dyn StateRepository>,
        broker: Arc<MockBroker>,
        market_data: Arc<MockMarketData>,
        drawdown: Arc<DrawdownCache>,
        breaker: Arc<CircuitBreaker>,
        kill_switch: bool,
    }

    impl Fixture {
        async fn new() -> Self {
            let db = Database::in_memory().await.unwrap();
            let repository: Arc<dyn StateRepository> = Arc::new(SqliteStateRepository::new(db));
            let broker = Arc::new(MockBroker::new());
            let market_data = Arc::new(MockMarketData::new());
            market_data.set_snapshot("AAPL", dec!(150.00), dec!(150.05));
            market_data.set_snapshot("BTC/USD", dec!(50000), dec!(50010));
            Self {
                breaker: Arc::new(CircuitBreaker::new(repository.clone())),
                drawdown: Arc::new(DrawdownCache::new(0.5)),
                repository,
                broker,
                market_data,
                kill_switch: false,
            }
        }

        fn manager(&self) -> RiskManager {
            let mut sectors = HashMap::new();
            sectors.insert("AAPL".to_string(), crate::domain::symbols::Sector::Technology);
            let classifier = Arc::new(SymbolClassifier::new(
                vec!["BTC/USD".to_string()],
                vec!["AAPL".to_string(), "MSFT".to_string()],
                sectors,
                HashMap::new(),
            ));
            RiskManager::new(
                self.repository.clone(),
                self.broker.clone(),
                self.market_data.clone(),
                CorrelationService::new(CorrelationConfig::default(), classifier.clone()),
                self.drawdown.clone(),
                self.breaker.clone(),
                classifier,
                TradingSession::new("America/New_York", "09:30", "16:00").unwrap(),
                RiskConfig::default(),
                FilterConfig::default(),
                self.kill_switch,
            )
        }
    }

    fn signal(symbol: &str, confidence: f64, bars_in_regime: u32) -> Signal {
        Signal {
            strategy: STRATEGY_NAME.to_string(),
            symbol: symbol.to_string(),
            timeframe: "1Min".to_string(),
            side: OrderSide::Buy,
            signal_ts: Utc::now(),
            quantity: Decimal::ZERO,
            limit_price: dec!(150),
            metadata: SignalMetadata {
                sma_pair: "10/30".to_string(),
                fast_sma: 151.0,
                medium_sma: 150.0,
                slow_sma: 149.0,
                atr: Some(2.0),
                confidence,
                regime: Regime::TrendingUp,
                regime_strength: 1.0,
                current_price: dec!(150),
                bars_in_regime,
            },
        }
    }

    /// Mid-session weekday timestamp (2024-02-21 12:00 New York).
    fn midday() -> DateTime<Utc> {
        chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 2, 21, 17, 0, 0).unwrap()
    }

    fn ctx<'a>(signal: &'a Signal, now: DateTime<Utc>) -> GateContext<'a> {
        GateContext {
            signal,
            quantity: dec!(10),
            sized_quantity: Some(dec!(10)),
            price: dec!(150),
            now,
        }
    }

    #[tokio::test]
    async fn clean_signal_passes() {
        let fixture = Fixture::new().await;
        let manager = fixture.manager();
        let s = signal("AAPL", 0.8, 20);
        let decision = manager.evaluate(&ctx(&s, midday())).await.unwrap();
        assert_eq!(decision, RiskDecision::Pass);
    }

    #[tokio::test]
    async fn kill_switch_is_a_safety_failure() {
        let mut fixture = Fixture::new().await;
        fixture.kill_switch = true;
        let manager = fixture.manager();
        let s = signal("AAPL", 0.8, 20);
        match manager.evaluate(&ctx(&s, midday())).await.unwrap() {
            RiskDecision::Halt { tier, reason } => {
                assert_eq!(tier, RiskTier::Safety);
                assert!(reason.contains("kill switch"));
            }
            other => panic!("expected safety halt, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn emergency_drawdown_blocks_everything() {
        let fixture = Fixture::new().await;
        fixture.drawdown.set_level(DrawdownLevel::Emergency).await;
        let manager = fixture.manager();
        let s = signal("AAPL", 0.8, 20);
        match manager.evaluate(&ctx(&s, midday())).await.unwrap() {
            RiskDecision::Halt { tier, reason } => {
                assert_eq!(tier, RiskTier::Safety);
                assert!(reason.contains("emergency"));
            }
            other => panic!("expected safety halt, got {:?}", other),
        }
        // Exits are blocked too.
        assert!(matches!(
            manager.evaluate_exit("AAPL").await.unwrap(),
            RiskDecision::Halt { .. }
        ));
    }

    #[tokio::test]
    async fn tripped_breaker_blocks_signals() {
        let fixture = Fixture::new().await;
        for _ in 0..TRIP_THRESHOLD {
            fixture.breaker.record_failure().await.unwrap();
        }
        let manager = fixture.manager();
        let s = signal("AAPL", 0.8, 20);
        match manager.evaluate(&ctx(&s, midday())).await.unwrap() {
            RiskDecision::Halt { tier, reason } => {
                assert_eq!(tier, RiskTier::Safety);
                assert!(reason.contains("circuit breaker"));
            }
            other => panic!("expected safety halt, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn closed_market_blocks_equities_not_crypto() {
        let fixture = Fixture::new().await;
        fixture.broker.set_market_open(false);
        let manager = fixture.manager();

        let s = signal("AAPL", 0.8, 20);
        assert!(matches!(
            manager.evaluate(&ctx(&s, midday())).await.unwrap(),
            RiskDecision::Halt { tier: RiskTier::Safety, .. }
        ));

        let s = signal("BTC/USD", 0.8, 20);
        assert_eq!(
            manager.evaluate(&ctx(&s, midday())).await.unwrap(),
            RiskDecision::Pass
        );
    }

    #[tokio::test]
    async fn halt_drawdown_is_a_risk_failure() {
        let fixture = Fixture::new().await;
        fixture.drawdown.set_level(DrawdownLevel::Halt).await;
        let manager = fixture.manager();
        let s = signal("AAPL", 0.8, 20);
        match manager.evaluate(&ctx(&s, midday())).await.unwrap() {
            RiskDecision::Halt { tier, reason } => {
                assert_eq!(tier, RiskTier::Risk);
                assert!(reason.contains("halt"));
            }
            other => panic!("expected risk halt, got {:?}", other),
        }
        // Exits still pass under Halt.
        assert_eq!(manager.evaluate_exit("AAPL").await.unwrap(), RiskDecision::Pass);
    }

    #[tokio::test]
    async fn daily_loss_and_trade_limits() {
        let fixture = Fixture::new().await;
        fixture
            .repository
            .set_state(state_keys::DAILY_REALIZED_PNL, "-1500")
            .await
            .unwrap();
        let manager = fixture.manager();
        let s = signal("AAPL", 0.8, 20);
        assert!(matches!(
            manager.evaluate(&ctx(&s, midday())).await.unwrap(),
            RiskDecision::Halt { tier: RiskTier::Risk, .. }
        ));

        fixture
            .repository
            .set_state(state_keys::DAILY_REALIZED_PNL, "0")
            .await
            .unwrap();
        fixture
            .repository
            .set_state(state_keys::DAILY_TRADE_COUNT, "20")
            .await
            .unwrap();
        let manager = fixture.manager();
        assert!(matches!(
            manager.evaluate(&ctx(&s, midday())).await.unwrap(),
            RiskDecision::Halt { tier: RiskTier::Risk, .. }
        ));
    }

    #[tokio::test]
    async fn position_limit_allows_reversals() {
        let fixture = Fixture::new().await;
        let held = |symbol: &str| BrokerPosition {
            symbol: symbol.to_string(),
            quantity: dec!(10),
            avg_entry_price: dec!(100),
            current_price: dec!(101),
            unrealized_pnl: dec!(10),
        };
        fixture.broker.set_positions(vec![
            held("MSFT"),
            held("BTC/USD"),
            held("A"),
            held("B"),
            held("C"),
        ]);
        let manager = fixture.manager();

        // New name: blocked at the cap.
        let s = signal("AAPL", 0.8, 20);
        assert!(matches!(
            manager.evaluate(&ctx(&s, midday())).await.unwrap(),
            RiskDecision::Halt { tier: RiskTier::Risk, .. }
        ));

        // Already-held name: not a new position, allowed through tier 2.
        let s = signal("MSFT", 0.8, 20);
        let decision = manager.evaluate(&ctx(&s, midday())).await.unwrap();
        assert!(!matches!(decision, RiskDecision::Halt { .. }));
    }

    #[tokio::test]
    async fn sub_one_sized_quantity_fails_tier_two() {
        let fixture = Fixture::new().await;
        let manager = fixture.manager();
        let s = signal("AAPL", 0.8, 20);
        let mut c = ctx(&s, midday());
        c.sized_quantity = Some(Decimal::ZERO);
        assert!(matches!(
            manager.evaluate(&c).await.unwrap(),
            RiskDecision::Halt { tier: RiskTier::Risk, .. }
        ));
    }

    #[tokio::test]
    async fn low_confidence_and_young_regime_soft_skip() {
        let fixture = Fixture::new().await;
        let manager = fixture.manager();

        let s = signal("AAPL", 0.1, 20);
        assert!(matches!(
            manager.evaluate(&ctx(&s, midday())).await.unwrap(),
            RiskDecision::Skip(reason) if reason.contains("confidence")
        ));

        let s = signal("AAPL", 0.8, 3);
        assert!(matches!(
            manager.evaluate(&ctx(&s, midday())).await.unwrap(),
            RiskDecision::Skip(reason) if reason.contains("regime")
        ));
    }

    #[tokio::test]
    async fn session_edges_skip_equities_only() {
        let fixture = Fixture::new().await;
        let manager = fixture.manager();
        // 09:35 New York: five minutes after the open.
        let early = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 2, 21, 14, 35, 0).unwrap();

        let s = signal("AAPL", 0.8, 20);
        assert!(matches!(
            manager.evaluate(&ctx(&s, early)).await.unwrap(),
            RiskDecision::Skip(reason) if reason.contains("after open")
        ));

        let s = signal("BTC/USD", 0.8, 20);
        assert_eq!(manager.evaluate(&ctx(&s, early)).await.unwrap(), RiskDecision::Pass);
    }

    #[tokio::test]
    async fn wide_spread_skips_and_fetch_failure_passes() {
        let fixture = Fixture::new().await;
        fixture.market_data.set_snapshot("AAPL", dec!(100.00), dec!(101.00));
        let manager = fixture.manager();
        let s = signal("AAPL", 0.8, 20);
        assert!(matches!(
            manager.evaluate(&ctx(&s, midday())).await.unwrap(),
            RiskDecision::Skip(reason) if reason.contains("spread")
        ));

        // Snapshot failure: the spread check is skipped, not the signal.
        fixture.market_data.set_snapshot("AAPL", dec!(150.00), dec!(150.05));
        fixture.market_data.fail_next_snapshots(1);
        let manager = fixture.manager();
        assert_eq!(
            manager.evaluate(&ctx(&s, midday())).await.unwrap(),
            RiskDecision::Pass
        );
    }
}
