use thiserror::Error;

/// Main error type for the strategy runtime
#[derive(Error, Debug)]
pub enum StratdError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Store errors
    #[error("Durable store error: {0}")]
    DurableStore(String),

    #[error("Fast store error: {0}")]
    FastStore(String),

    #[error("State corruption for {strategy_id}: {reason}")]
    StateCorruption { strategy_id: String, reason: String },

    // Supervisor errors
    #[error("Worker pool at capacity ({max} workers)")]
    CapacityExhausted { max: usize },

    #[error("Strategy already running: {0}")]
    AlreadyRunning(String),

    #[error("Strategy not running: {0}")]
    NotRunning(String),

    #[error("Strategy not found: {0}")]
    StrategyNotFound(String),

    #[error("Strategy inactive: {0}")]
    StrategyInactive(String),

    #[error("Worker launch failed for {strategy_id}: {reason}")]
    WorkerLaunch { strategy_id: String, reason: String },

    #[error("Recovery in progress, new starts are blocked")]
    RecoveryInProgress,

    // State machine errors
    #[error("Invalid phase transition: from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl StratdError {
    /// Failures that threaten the store of record and must reach the caller.
    pub fn is_durability_failure(&self) -> bool {
        matches!(
            self,
            StratdError::DurableStore(_) | StratdError::Database(_) | StratdError::Migration(_)
        )
    }

    /// Recoverable per-strategy rejections (no retry by the runtime).
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            StratdError::CapacityExhausted { .. }
                | StratdError::AlreadyRunning(_)
                | StratdError::NotRunning(_)
                | StratdError::StrategyNotFound(_)
                | StratdError::StrategyInactive(_)
                | StratdError::RecoveryInProgress
        )
    }

    /// Short caller-facing reason, never a backtrace.
    pub fn reason(&self) -> String {
        match self {
            StratdError::Database(_) | StratdError::Migration(_) => {
                "durable store unavailable".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Result type alias for StratdError
pub type Result<T> = std::result::Result<T, StratdError>;
