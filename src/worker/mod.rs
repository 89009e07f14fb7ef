//! Strategy workers
//!
//! - `message`: typed envelopes exchanged with the Supervisor
//! - `runner`: the strategy logic seam and its context
//! - `transport`: how worker units are launched, stopped and killed

pub mod message;
pub mod runner;
pub mod transport;

pub use message::{
    LogEntry, Signal, SignalKind, SignalSide, WorkerEnvelope, WorkerMessage, WorkerOutcome,
};
pub use runner::{IdleRunner, IdleRunnerFactory, RunnerFactory, StrategyRunner, WorkerContext};
pub use transport::{TaskTransport, WorkerControl, WorkerLaunch, WorkerLink, WorkerTransport};
