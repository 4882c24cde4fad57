//! Dual-formula position sizing.
//!
//! Quantity is the floor of the tighter of two caps: an equity cap
//! (`equity × max_position_pct / price`) and a risk cap
//! (`equity × max_risk_per_trade_pct / (price × stop_loss_pct)`). The raw
//! floor is returned unfloored; the risk gate treats a sub-1 result as a
//! hard failure and the order manager applies the final floor-to-1 after
//! the drawdown multiplier.

use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SizingError {
    #[error("equity must be positive, got {0}")]
    NonPositiveEquity(Decimal),

    #[error("price must be positive, got {0}")]
    NonPositivePrice(Decimal),

    #[error("{name} must be in (0, 1], got {value}")]
    PercentOutOfRange { name: &'static str, value: f64 },
}

#[derive(Debug, Clone)]
pub struct PositionSizer {
    max_position_pct: f64,
    max_risk_per_trade_pct: f64,
    stop_loss_pct: f64,
}

impl PositionSizer {
    pub fn new(
        max_position_pct: f64,
        max_risk_per_trade_pct: f64,
        stop_loss_pct: f64,
    ) -> Result<Self, SizingError> {
        for (name, value) in [
            ("max_position_pct", max_position_pct),
            ("max_risk_per_trade_pct", max_risk_per_trade_pct),
            ("stop_loss_pct", stop_loss_pct),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(SizingError::PercentOutOfRange { name, value });
            }
        }
        Ok(Self {
            max_position_pct,
            max_risk_per_trade_pct,
            stop_loss_pct,
        })
    }

    /// Raw sized quantity: `floor(min(equity_cap, risk_cap))`. May be zero.
    pub fn quantity(&self, equity: Decimal, price: Decimal) -> Result<Decimal, SizingError> {
        if equity <= Decimal::ZERO {
            return Err(SizingError::NonPositiveEquity(equity));
        }
        if price <= Decimal::ZERO {
            return Err(SizingError::NonPositivePrice(price));
        }

        let position_pct = Decimal::from_f64(self.max_position_pct)
            .unwrap_or_default();
        let risk_pct = Decimal::from_f64(self.max_risk_per_trade_pct).unwrap_or_default();
        let stop_pct = Decimal::from_f64(self.stop_loss_pct).unwrap_or_default();

        let equity_cap = equity * position_pct / price;
        let risk_cap = equity * risk_pct / (price * stop_pct);

        Ok(equity_cap.min(risk_cap).floor())
    }
}
