//! Engine configuration.
//!
//! Loaded from a TOML file (path from `TRADEWIND_CONFIG`, default
//! `tradewind.toml`). Every section rejects unrecognised keys at parse
//! time; a typoed limit must never silently become a default.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::domain::errors::ConfigError;
use crate::domain::symbols::{AssetClass, Sector, SymbolClassifier};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub execution: ExecutionConfig,
    pub data: DataConfig,
    pub risk: RiskConfig,
    pub session: SessionConfig,
    pub filters: FilterConfig,
    pub drawdown: DrawdownConfig,
    pub correlation_limits: CorrelationConfig,
    pub exit: ExitConfig,
    pub symbols: SymbolsConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExecutionConfig {
    pub kill_switch: bool,
    pub dry_run: bool,
    pub flatten_on_shutdown: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            kill_switch: false,
            dry_run: false,
            flatten_on_shutdown: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DataConfig {
    pub timeframe: String,
    pub poll_interval_seconds: u64,
    pub warmup_bars: u32,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            timeframe: "1Min".to_string(),
            poll_interval_seconds: 60,
            warmup_bars: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RiskConfig {
    pub max_daily_loss: f64,
    pub max_trades_per_day: u32,
    pub max_concurrent_positions: usize,
    pub max_position_pct: f64,
    pub max_risk_per_trade_pct: f64,
    pub stop_loss_pct: f64,
    pub min_signal_confidence: f64,
    pub min_bars_in_regime: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: 1_000.0,
            max_trades_per_day: 20,
            max_concurrent_positions: 5,
            max_position_pct: 0.10,
            max_risk_per_trade_pct: 0.01,
            stop_loss_pct: 0.02,
            min_signal_confidence: 0.35,
            min_bars_in_regime: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SessionConfig {
    pub time_zone: String,
    pub market_open_time: String,
    pub market_close_time: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            time_zone: "America/New_York".to_string(),
            market_open_time: "09:30".to_string(),
            market_close_time: "16:00".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FilterConfig {
    pub max_spread_pct: f64,
    pub min_minutes_after_open: i64,
    pub min_minutes_before_close: i64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_spread_pct: 0.005,
            min_minutes_after_open: 15,
            min_minutes_before_close: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DrawdownConfig {
    pub enabled: bool,
    pub warning_threshold_pct: f64,
    pub halt_threshold_pct: f64,
    pub emergency_threshold_pct: f64,
    pub warning_recovery_pct: f64,
    pub halt_recovery_pct: f64,
    pub emergency_recovery_pct: f64,
    pub warning_position_multiplier: f64,
    pub lookback_days: i64,
    pub enable_auto_recovery: bool,
    pub check_interval_seconds: u64,
}

impl Default for DrawdownConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_threshold_pct: 0.03,
            halt_threshold_pct: 0.05,
            emergency_threshold_pct: 0.10,
            warning_recovery_pct: 0.02,
            halt_recovery_pct: 0.04,
            emergency_recovery_pct: 0.08,
            warning_position_multiplier: 0.5,
            lookback_days: 30,
            enable_auto_recovery: true,
            check_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CorrelationConfig {
    pub enabled: bool,
    pub max_correlation: f64,
    pub max_sector_pct: f64,
    pub max_asset_class_pct: f64,
    /// Pairwise coefficients keyed "A:B"; lookups try both orderings.
    pub static_correlations: HashMap<String, f64>,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_correlation: 0.85,
            max_sector_pct: 0.40,
            max_asset_class_pct: 0.60,
            static_correlations: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExitConfig {
    pub check_interval_seconds: u64,
    pub atr_stop_loss_multiplier: f64,
    pub atr_profit_target_multiplier: f64,
    /// Fixed-percentage fallbacks for degraded (ATR-less) modes.
    pub stop_loss_percentage: f64,
    pub profit_target_percentage: f64,
    pub trailing_stop_percent: f64,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 30,
            atr_stop_loss_multiplier: 1.5,
            atr_profit_target_multiplier: 3.0,
            stop_loss_percentage: 0.02,
            profit_target_percentage: 0.04,
            trailing_stop_percent: 0.015,
            backoff_base_seconds: 1,
            backoff_max_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct SymbolsConfig {
    pub crypto_symbols: Vec<String>,
    pub equity_symbols: Vec<String>,
    pub sectors: HashMap<String, Sector>,
    pub asset_classes: HashMap<String, AssetClass>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/tradewind.db".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn pct(field: &str, value: f64) -> Result<(), ConfigError> {
            if value <= 0.0 || value > 1.0 {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: format!("must be in (0, 1], got {}", value),
                });
            }
            Ok(())
        }

        pct("risk.max_position_pct", self.risk.max_position_pct)?;
        pct("risk.max_risk_per_trade_pct", self.risk.max_risk_per_trade_pct)?;
        pct("risk.stop_loss_pct", self.risk.stop_loss_pct)?;
        pct("risk.min_signal_confidence", self.risk.min_signal_confidence)?;
        pct("correlation_limits.max_correlation", self.correlation_limits.max_correlation)?;
        pct("correlation_limits.max_sector_pct", self.correlation_limits.max_sector_pct)?;
        pct(
            "correlation_limits.max_asset_class_pct",
            self.correlation_limits.max_asset_class_pct,
        )?;

        if self.risk.max_daily_loss < 0.0 {
            return Err(ConfigError::Invalid {
                field: "risk.max_daily_loss".to_string(),
                reason: "must be non-negative".to_string(),
            });
        }
        if self.risk.max_concurrent_positions == 0 {
            return Err(ConfigError::Invalid {
                field: "risk.max_concurrent_positions".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.drawdown.enabled {
            let d = &self.drawdown;
            if !(d.warning_threshold_pct < d.halt_threshold_pct
                && d.halt_threshold_pct < d.emergency_threshold_pct)
            {
                return Err(ConfigError::Invalid {
                    field: "drawdown".to_string(),
                    reason: "thresholds must be strictly increasing warning < halt < emergency"
                        .to_string(),
                });
            }
            if d.lookback_days <= 0 {
                return Err(ConfigError::Invalid {
                    field: "drawdown.lookback_days".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        }
        if self.exit.backoff_max_seconds < self.exit.backoff_base_seconds {
            return Err(ConfigError::Invalid {
                field: "exit.backoff_max_seconds".to_string(),
                reason: "must be >= exit.backoff_base_seconds".to_string(),
            });
        }
        for symbol in &self.symbols.crypto_symbols {
            if self.symbols.equity_symbols.contains(symbol) {
                return Err(ConfigError::Invalid {
                    field: "symbols".to_string(),
                    reason: format!("{} listed as both crypto and equity", symbol),
                });
            }
        }
        for key in self.correlation_limits.static_correlations.keys() {
            if !key.contains(':') {
                return Err(ConfigError::Invalid {
                    field: "correlation_limits.static_correlations".to_string(),
                    reason: format!("key {} is not of the form A:B", key),
                });
            }
        }
        Ok(())
    }

    pub fn classifier(&self) -> SymbolClassifier {
        SymbolClassifier::new(
            self.symbols.crypto_symbols.iter().cloned(),
            self.symbols.equity_symbols.iter().cloned(),
            self.symbols.sectors.clone(),
            self.symbols.asset_classes.clone(),
        )
    }
}
