//! Worker transport
//!
//! The Supervisor launches workers through `WorkerTransport` and never touches
//! the underlying execution unit directly, so a tokio task can be swapped for a
//! thread or a subprocess without changing supervision logic.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::message::{WorkerEnvelope, WorkerMessage, WorkerOutcome};
use super::runner::{RunnerFactory, WorkerContext};
use crate::domain::StrategyConfig;
use crate::error::Result;
use crate::persistence::RunSeed;

/// What the Supervisor hands a transport to start one worker
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub worker_id: Uuid,
    pub strategy: StrategyConfig,
    pub seed: Option<RunSeed>,
    pub heartbeat_interval: Duration,
}

/// Control side of a running worker
pub trait WorkerControl: Send + Sync {
    /// Ask the worker to exit cooperatively
    fn request_stop(&self);

    /// Force termination
    fn kill(&self);
}

pub struct WorkerLink {
    pub control: Box<dyn WorkerControl>,
    /// Resolves exactly once, when the worker unit has ended
    pub completion: BoxFuture<'static, WorkerOutcome>,
}

pub trait WorkerTransport: Send + Sync {
    fn launch(
        &self,
        launch: WorkerLaunch,
        outbound: mpsc::Sender<WorkerEnvelope>,
    ) -> Result<WorkerLink>;
}

struct TaskControl {
    stop: watch::Sender<bool>,
    abort: AbortHandle,
}

impl WorkerControl for TaskControl {
    fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    fn kill(&self) {
        self.abort.abort();
    }
}

/// Runs each worker as an isolated tokio task
pub struct TaskTransport {
    factory: Arc<dyn RunnerFactory>,
}

impl TaskTransport {
    pub fn new(factory: Arc<dyn RunnerFactory>) -> Self {
        Self { factory }
    }
}

impl WorkerTransport for TaskTransport {
    fn launch(
        &self,
        launch: WorkerLaunch,
        outbound: mpsc::Sender<WorkerEnvelope>,
    ) -> Result<WorkerLink> {
        let mut runner = self.factory.create(&launch.strategy)?;
        let (stop_tx, stop_rx) = watch::channel(false);

        let strategy_id = launch.strategy.id.clone();
        let worker_id = launch.worker_id;
        let ack_stop = stop_rx.clone();
        let ack_tx = outbound.clone();
        let ctx = WorkerContext::new(
            launch.strategy,
            worker_id,
            launch.seed,
            launch.heartbeat_interval,
            outbound,
            stop_rx,
        );

        let task = tokio::spawn(async move {
            let result = runner.run(ctx).await;
            let stop_requested = *ack_stop.borrow();
            if result.is_ok() && stop_requested {
                let ack = WorkerEnvelope::new(&strategy_id, worker_id, WorkerMessage::StopAck);
                if ack_tx.send(ack).await.is_err() {
                    debug!(strategy_id = %strategy_id, "supervisor gone before STOP_ACK");
                }
            }
            result
        });

        let control = TaskControl {
            stop: stop_tx,
            abort: task.abort_handle(),
        };

        let completion = async move {
            match task.await {
                Ok(Ok(())) => WorkerOutcome::Completed,
                Ok(Err(e)) => WorkerOutcome::Failed(format!("{:#}", e)),
                Err(e) if e.is_panic() => {
                    let panic = e.into_panic();
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "worker panicked".to_string());
                    warn!(%worker_id, "worker panicked: {}", reason);
                    WorkerOutcome::Failed(format!("panic: {}", reason))
                }
                Err(_) => WorkerOutcome::Killed,
            }
        }
        .boxed();

        Ok(WorkerLink {
            control: Box::new(control),
            completion,
        })
    }
}
