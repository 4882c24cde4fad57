pub mod circuit_breaker;
pub mod correlation;
pub mod drawdown;
pub mod manager;
pub mod sizer;

pub use circuit_breaker::CircuitBreaker;
pub use correlation::CorrelationService;
pub use drawdown::{DrawdownCache, DrawdownMonitor};
pub use manager::RiskManager;
pub use sizer::PositionSizer;
