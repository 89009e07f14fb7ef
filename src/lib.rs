pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod recovery;
pub mod services;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use config::AppConfig;
pub use coordination::{GracefulShutdown, ShutdownConfig, ShutdownSignal};
pub use domain::{
    Candle, MissedDataRecord, MissedDataStatus, Phase, PhaseState, RuntimeState, StatePatch,
    StaticCatalog, StrategyCatalog, StrategyConfig, Timeframe,
};
pub use error::{Result, StratdError};
pub use persistence::{MaintenanceScheduler, MissedDataTracker, StatePersistenceService};
pub use recovery::{RecoveryReport, RecoveryService};
pub use services::{CommandOutcome, ControlPlane, HealthLabel, HealthReporter, HealthServer};
pub use store::{DurableStore, FastStore, MemoryDurableStore, MemoryFastStore, PgDurableStore};
pub use supervisor::{OrderSink, Supervisor, SupervisorHandle};
pub use worker::{RunnerFactory, StrategyRunner, TaskTransport, WorkerContext, WorkerTransport};
