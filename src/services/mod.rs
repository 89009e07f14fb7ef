pub mod control;
pub mod health;

pub use control::{CommandOutcome, ControlPlane, StrategyStatus};
pub use health::{
    recommendations, Diagnostics, HealthLabel, HealthReporter, HealthServer, StrategyCondition,
    StrategyHealth, SystemHealth, WorkerSummary,
};
