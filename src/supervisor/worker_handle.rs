use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::command::ExitAction;
use crate::worker::WorkerControl;

/// Supervisor-side reference to a running worker. Never persisted.
pub(crate) struct WorkerHandle {
    pub strategy_id: String,
    pub worker_id: Uuid,
    pub started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
    pub last_heartbeat: Instant,
    pub last_heartbeat_utc: DateTime<Utc>,
    pub healthy: bool,
    /// Stop requested; the grace deadline is running
    pub stopping: bool,
    pub on_exit: Vec<ExitAction>,
    pub control: Box<dyn WorkerControl>,
}

impl WorkerHandle {
    pub fn new(strategy_id: &str, worker_id: Uuid, control: Box<dyn WorkerControl>) -> Self {
        let now = Instant::now();
        let now_utc = Utc::now();
        Self {
            strategy_id: strategy_id.to_string(),
            worker_id,
            started_at: now,
            started_at_utc: now_utc,
            last_heartbeat: now,
            last_heartbeat_utc: now_utc,
            healthy: true,
            stopping: false,
            on_exit: Vec::new(),
            control,
        }
    }

    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
        self.last_heartbeat_utc = Utc::now();
        self.healthy = true;
    }

    pub fn info(&self) -> WorkerInfo {
        let now = Instant::now();
        WorkerInfo {
            strategy_id: self.strategy_id.clone(),
            worker_id: self.worker_id,
            started_at: self.started_at_utc,
            uptime_secs: now.duration_since(self.started_at).as_secs(),
            last_heartbeat: self.last_heartbeat_utc,
            secs_since_heartbeat: now.duration_since(self.last_heartbeat).as_secs(),
            healthy: self.healthy,
            stopping: self.stopping,
        }
    }
}

/// Per-worker detail for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub strategy_id: String,
    pub worker_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub last_heartbeat: DateTime<Utc>,
    pub secs_since_heartbeat: u64,
    pub healthy: bool,
    pub stopping: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub workers: Vec<WorkerInfo>,
}
