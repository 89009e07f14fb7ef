//! Supervisor commands: requests from handles and internal events

use tokio::sync::oneshot;
use uuid::Uuid;

use super::worker_handle::{WorkerInfo, WorkerStats};
use crate::domain::RuntimeState;
use crate::error::Result;
use crate::persistence::RunSeed;
use crate::worker::WorkerOutcome;

/// Requests sent through a `SupervisorHandle`
#[derive(Debug)]
pub(crate) enum SupervisorCommand {
    Start {
        strategy_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        strategy_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Restart {
        strategy_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Relaunch seeded with recovered progress
    RestartWithState {
        state: Box<RuntimeState>,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<WorkerStats>,
    },
    Worker {
        strategy_id: String,
        reply: oneshot::Sender<Option<WorkerInfo>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Events the Supervisor posts to itself from spawned timers and watchers
#[derive(Debug)]
pub(crate) enum SupervisorEvent {
    /// A worker unit ended
    Exited {
        strategy_id: String,
        worker_id: Uuid,
        outcome: WorkerOutcome,
    },
    /// Stop grace period elapsed
    StopDeadline { strategy_id: String, worker_id: Uuid },
    /// Backoff after a worker fault elapsed
    RestartDue { strategy_id: String },
}

/// Why a worker is being launched; decides error/restart bookkeeping and seeding
#[derive(Debug, Clone)]
pub(crate) enum LaunchMode {
    /// `start(id)`
    Fresh,
    /// `restart(id)` from the control plane
    Manual,
    /// Heartbeat sweep found the worker silent
    Heal,
    /// Automatic restart after a worker fault
    Fault,
    /// Recovery Service at boot
    Recovery(RunSeed),
}

impl LaunchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchMode::Fresh => "fresh",
            LaunchMode::Manual => "manual_restart",
            LaunchMode::Heal => "heal",
            LaunchMode::Fault => "fault_restart",
            LaunchMode::Recovery(_) => "recovery",
        }
    }

    /// Operator-initiated launches clear the error history
    pub fn resets_errors(&self) -> bool {
        matches!(self, LaunchMode::Fresh | LaunchMode::Manual)
    }

    pub fn counts_as_restart(&self) -> bool {
        !matches!(self, LaunchMode::Fresh)
    }
}

/// Continuation run once a stopping worker has exited
#[derive(Debug)]
pub(crate) enum ExitAction {
    Reply(oneshot::Sender<Result<()>>),
    Relaunch {
        mode: LaunchMode,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
}
