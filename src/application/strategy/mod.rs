//! Multi-timeframe SMA crossover strategy with ATR and regime detection.
//!
//! Three SMA pairs are watched per symbol; a crossover on any pair is
//! edge-triggered, so a pair emits at most one signal per bar and a symbol
//! at most three. Signals are suppressed until every tracked symbol has a
//! full history, so the first live bar cannot fire off a half-warmed book.

pub mod indicators;
pub mod regime;

use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use crate::domain::types::{Bar, OrderSide, Regime, Signal, SignalMetadata};
use indicators::{atr, sma};

/// Strategy identifier baked into every derived client order id.
pub const STRATEGY_NAME: &str = "sma_crossover_multi";

/// (fast, slow) SMA period pairs, fastest first.
pub const SMA_PAIRS: [(usize, usize); 3] = [(5, 15), (10, 30), (20, 50)];

pub const ATR_PERIOD: usize = 14;

/// Slowest SMA (50) plus a 10-bar buffer plus the ATR seed bar.
pub const REQUIRED_BARS: usize = 61;

/// Regime SMA triple: the medium pair plus the slowest period.
const REGIME_FAST: usize = 10;
const REGIME_MEDIUM: usize = 30;
const REGIME_SLOW: usize = 50;

const HISTORY_CAPACITY: usize = 120;

struct SymbolState {
    history: VecDeque<Bar>,
    /// Last observed (fast, slow) values per pair, for edge detection.
    prev_pairs: [Option<(f64, f64)>; SMA_PAIRS.len()],
    regime: Regime,
    bars_in_regime: u32,
}

impl SymbolState {
    fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            prev_pairs: [None; SMA_PAIRS.len()],
            regime: Regime::Ranging,
            bars_in_regime: 0,
        }
    }

    fn bars(&self) -> Vec<Bar> {
        self.history.iter().cloned().collect()
    }
}

pub struct StrategyCore {
    timeframe: String,
    states: HashMap<String, SymbolState>,
    announced_ready: bool,
}

impl StrategyCore {
    pub fn new(symbols: &[String], timeframe: &str) -> Self {
        let states = symbols
            .iter()
            .map(|s| (s.clone(), SymbolState::new()))
            .collect();
        Self {
            timeframe: timeframe.to_string(),
            states,
            announced_ready: false,
        }
    }

    /// True once every tracked symbol has a full warmup history.
    pub fn is_ready(&self) -> bool {
        !self.states.is_empty()
            && self
                .states
                .values()
                .all(|s| s.history.len() >= REQUIRED_BARS)
    }

    /// Current ATR for a symbol, if computable.
    pub fn current_atr(&self, symbol: &str) -> Option<f64> {
        let state = self.states.get(symbol)?;
        atr(&state.bars(), ATR_PERIOD)
    }

    /// Ingest one bar and return any crossover signals it produced.
    pub fn on_bar(&mut self, bar: &Bar) -> Vec<Signal> {
        let Some(state) = self.states.get_mut(&bar.symbol) else {
            return Vec::new();
        };
        if bar.timeframe != self.timeframe {
            return Vec::new();
        }
        // Out-of-order or replayed bars are the data handler's problem;
        // guard anyway so indicator windows stay monotonic.
        if let Some(last) = state.history.back()
            && bar.timestamp <= last.timestamp
        {
            return Vec::new();
        }

        state.history.push_back(bar.clone());
        while state.history.len() > HISTORY_CAPACITY {
            state.history.pop_front();
        }

        let bars = state.bars();
        let regime_inputs = (
            sma(&bars, REGIME_FAST),
            sma(&bars, REGIME_MEDIUM),
            sma(&bars, REGIME_SLOW),
        );
        let (current_regime, regime_strength) = match regime_inputs {
            (Some(fast), Some(medium), Some(slow)) => regime::classify(fast, medium, slow),
            _ => (Regime::Ranging, 0.0),
        };
        if current_regime == state.regime {
            state.bars_in_regime = state.bars_in_regime.saturating_add(1);
        } else {
            debug!(
                symbol = %bar.symbol,
                from = %state.regime,
                to = %current_regime,
                "regime change"
            );
            state.regime = current_regime;
            state.bars_in_regime = 1;
        }

        let atr_value = atr(&bars, ATR_PERIOD);
        let (fast_sma, medium_sma, slow_sma) = (
            regime_inputs.0.unwrap_or(0.0),
            regime_inputs.1.unwrap_or(0.0),
            regime_inputs.2.unwrap_or(0.0),
        );
        let slowest_pair = sma(&bars, SMA_PAIRS[2].0).zip(sma(&bars, SMA_PAIRS[2].1));

        let mut crossings: Vec<(usize, OrderSide)> = Vec::new();
        for (idx, (fast_period, slow_period)) in SMA_PAIRS.iter().enumerate() {
            let current = sma(&bars, *fast_period).zip(sma(&bars, *slow_period));
            if let (Some(prev), Some(cur)) = (state.prev_pairs[idx], current) {
                if prev.0 <= prev.1 && cur.0 > cur.1 {
                    crossings.push((idx, OrderSide::Buy));
                } else if prev.0 >= prev.1 && cur.0 < cur.1 {
                    crossings.push((idx, OrderSide::Sell));
                }
            }
            state.prev_pairs[idx] = current;
        }

        let regime_snapshot = state.regime;
        let bars_in_regime = state.bars_in_regime;

        if !self.is_ready() {
            return Vec::new();
        }
        if !self.announced_ready {
            self.announced_ready = true;
            info!("strategy warmup complete, signal generation enabled");
        }

        crossings
            .into_iter()
            .map(|(idx, side)| {
                let (fast_period, slow_period) = SMA_PAIRS[idx];
                let slowest_aligned = slowest_pair
                    .map(|(f, s)| match side {
                        OrderSide::Buy => f > s,
                        OrderSide::Sell => f < s,
                    })
                    .unwrap_or(false);
                let confidence = score_confidence(
                    regime_snapshot,
                    regime_strength,
                    side,
                    slowest_aligned,
                );
                Signal {
                    strategy: STRATEGY_NAME.to_string(),
                    symbol: bar.symbol.clone(),
                    timeframe: self.timeframe.clone(),
                    side,
                    signal_ts: bar.timestamp,
                    quantity: rust_decimal::Decimal::ZERO,
                    limit_price: bar.close,
                    metadata: SignalMetadata {
                        sma_pair: format!("{}/{}", fast_period, slow_period),
                        fast_sma,
                        medium_sma,
                        slow_sma,
                        atr: atr_value,
                        confidence,
                        regime: regime_snapshot,
                        regime_strength,
                        current_price: bar.close,
                        bars_in_regime,
                    },
                }
            })
            .collect()
    }
}

/// Base 0.8 when the regime agrees with the side, 0.5 when trending against
/// it, 0.2 when ranging; +0.1 if the slowest pair agrees; scaled by regime
/// strength and clamped to [0.1, 1].
fn score_confidence(
    regime: Regime,
    strength: f64,
    side: OrderSide,
    slowest_aligned: bool,
) -> f64 {
    let base = match (regime, side) {
        (Regime::TrendingUp, OrderSide::Buy) | (Regime::TrendingDown, OrderSide::Sell) => 0.8,
        (Regime::Ranging, _) => 0.2,
        _ => 0.5,
    };
    let bonus = if slowest_aligned { 0.1 } else { 0.0 };
    ((base + bonus) * strength).clamp(0.1, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal::prelude::FromPrimitive;

    fn bar_at(symbol: &str, minute: i64, close: f64) -> Bar {
        let ts = Utc.with_ymd_and_hms(2024, 2, 21, 10, 0, 0).unwrap() + Duration::minutes(minute);
        let price = Decimal::from_f64(close).unwrap();
        Bar {
            symbol: symbol.to_string(),
            timeframe: "1Min".to_string(),
            timestamp: ts,
            open: price,
            high: price + Decimal::ONE,
            low: price - Decimal::ONE,
            close: price,
            volume: Decimal::from(1000),
        }
    }

    fn warmed_core(symbol: &str, closes: &[f64]) -> StrategyCore {
        let mut core = StrategyCore::new(&[symbol.to_string()], "1Min");
        for (i, close) in closes.iter().enumerate() {
            core.on_bar(&bar_at(symbol, i as i64, *close));
        }
        core
    }

    #[test]
    fn suppresses_signals_until_every_symbol_is_warm() {
        let symbols = vec!["AAPL".to_string(), "MSFT".to_string()];
        let mut core = StrategyCore::new(&symbols, "1Min");

        // Warm only AAPL; a crossover on it must not emit.
        let mut emitted = Vec::new();
        for i in 0..70 {
            let close = if i < 60 { 100.0 } else { 110.0 + i as f64 };
            emitted.extend(core.on_bar(&bar_at("AAPL", i, close)));
        }
        assert!(!core.is_ready());
        assert!(emitted.is_empty());

        // Warm MSFT too; now AAPL crossovers flow.
        for i in 0..70 {
            core.on_bar(&bar_at("MSFT", i, 50.0));
        }
        assert!(core.is_ready());
    }

    #[test]
    fn flat_history_emits_nothing() {
        let closes: Vec<f64> = std::iter::repeat(100.0).take(80).collect();
        let mut core = warmed_core("AAPL", &closes);
        let signals = core.on_bar(&bar_at("AAPL", 80, 100.0));
        assert!(signals.is_empty());
    }

    #[test]
    fn breakout_triggers_buy_crossovers_once() {
        // Long flat stretch then a sharp rally: fast SMAs cross above slow.
        let mut closes: Vec<f64> = std::iter::repeat(100.0).take(70).collect();
        for i in 0..6 {
            closes.push(104.0 + i as f64 * 4.0);
        }
        let mut core = StrategyCore::new(&["AAPL".to_string()], "1Min");
        let mut all: Vec<Signal> = Vec::new();
        for (i, close) in closes.iter().enumerate() {
            all.extend(core.on_bar(&bar_at("AAPL", i as i64, *close)));
        }
        assert!(!all.is_empty(), "rally should produce at least one crossover");
        assert!(all.iter().all(|s| s.side == OrderSide::Buy));
        // Edge-triggered: per pair at most one signal for the whole rally.
        for pair in ["5/15", "10/30", "20/50"] {
            assert!(
                all.iter().filter(|s| s.metadata.sma_pair == pair).count() <= 1,
                "pair {} fired more than once",
                pair
            );
        }
        let signal = &all[0];
        assert_eq!(signal.strategy, STRATEGY_NAME);
        assert_eq!(signal.quantity, Decimal::ZERO);
        assert!(signal.metadata.atr.is_some());
        assert!(signal.metadata.confidence >= 0.1 && signal.metadata.confidence <= 1.0);
    }

    #[test]
    fn sell_crossover_on_breakdown() {
        let mut closes: Vec<f64> = std::iter::repeat(100.0).take(70).collect();
        for i in 0..6 {
            closes.push(96.0 - i as f64 * 4.0);
        }
        let mut core = StrategyCore::new(&["AAPL".to_string()], "1Min");
        let mut all: Vec<Signal> = Vec::new();
        for (i, close) in closes.iter().enumerate() {
            all.extend(core.on_bar(&bar_at("AAPL", i as i64, *close)));
        }
        assert!(!all.is_empty());
        assert!(all.iter().all(|s| s.side == OrderSide::Sell));
    }

    #[test]
    fn replayed_bar_is_ignored() {
        let closes: Vec<f64> = std::iter::repeat(100.0).take(80).collect();
        let mut core = warmed_core("AAPL", &closes);
        let replay = bar_at("AAPL", 10, 500.0);
        assert!(core.on_bar(&replay).is_empty());
        // History length unchanged by the replay.
        assert!(core.is_ready());
    }

    #[test]
    fn unknown_symbol_is_ignored() {
        let mut core = StrategyCore::new(&["AAPL".to_string()], "1Min");
        assert!(core.on_bar(&bar_at("TSLA", 0, 100.0)).is_empty());
    }

    #[test]
    fn confidence_scoring_matches_rules() {
        // Aligned trend at full strength with slowest-pair agreement.
        let c = score_confidence(Regime::TrendingUp, 1.0, OrderSide::Buy, true);
        assert!((c - 0.9).abs() < 1e-9);
        // Misaligned trend.
        let c = score_confidence(Regime::TrendingUp, 1.0, OrderSide::Sell, false);
        assert!((c - 0.5).abs() < 1e-9);
        // Ranging collapses toward the floor.
        let c = score_confidence(Regime::Ranging, 0.1, OrderSide::Buy, false);
        assert!((c - 0.1).abs() < 1e-9);
        // Clamp floor.
        let c = score_confidence(Regime::Ranging, 0.0, OrderSide::Buy, false);
        assert!((c - 0.1).abs() < 1e-9);
    }
}
