use thiserror::Error;

/// Fatal configuration problems. The process refuses to start on any of
/// these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Single typed failure for every repository operation. Callers decide
/// whether a store failure trips the circuit breaker.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("order intent not found: {0}")]
    IntentNotFound(String),

    #[error("corrupt stored value for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Transport-level broker failures surfaced by the port implementations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker request failed: {0}")]
    Transport(String),

    #[error("broker rejected order {client_order_id}: {reason}")]
    OrderRejected {
        client_order_id: String,
        reason: String,
    },

    #[error("broker request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Which risk tier produced a hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskTier {
    Safety,
    Risk,
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskTier::Safety => write!(f, "safety"),
            RiskTier::Risk => write!(f, "risk"),
        }
    }
}

/// Outcome of the gating pipeline. Hard failures are raised by the order
/// manager; soft skips are logged and swallowed.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Pass,
    Skip(String),
    Halt { tier: RiskTier, reason: String },
}

impl RiskDecision {
    pub fn is_pass(&self) -> bool {
        matches!(self, RiskDecision::Pass)
    }
}

/// Hard risk failure as an error, for propagation out of the order manager.
#[derive(Debug, Error)]
#[error("{tier} gate failed: {reason}")]
pub struct RiskError {
    pub tier: RiskTier,
    pub reason: String,
}

/// Top-level failures the engine propagates.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Risk(#[from] RiskError),

    #[error("startup reconciliation found uncorrectable discrepancies; trading halted")]
    ReconciliationHalt,

    #[error("{0}")]
    Internal(String),
}
