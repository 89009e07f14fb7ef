//! Strategy runner seam
//!
//! The trading logic of a strategy lives behind `StrategyRunner`. A runner gets
//! a `WorkerContext` seeded with any recovered progress and talks to the
//! Supervisor only through the context's outbound channel.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::info;
use uuid::Uuid;

use super::message::{LogEntry, Signal, SignalKind, WorkerEnvelope, WorkerMessage};
use crate::domain::{Candle, LogLevel, Phase, PhaseState, StatePatch, StrategyConfig};
use crate::error::{Result, StratdError};
use crate::persistence::RunSeed;

/// Strategy evaluation loop executed inside a worker
#[async_trait]
pub trait StrategyRunner: Send {
    /// Run until `ctx.stopped()` resolves or the strategy finishes.
    /// Returning an error is reported to the Supervisor as a worker fault.
    async fn run(&mut self, ctx: WorkerContext) -> anyhow::Result<()>;
}

/// Builds a runner for a strategy configuration
pub trait RunnerFactory: Send + Sync {
    fn create(&self, strategy: &StrategyConfig) -> Result<Box<dyn StrategyRunner>>;
}

/// Everything a runner can see of its environment
pub struct WorkerContext {
    strategy: StrategyConfig,
    worker_id: Uuid,
    seed: Option<RunSeed>,
    heartbeat_interval: Duration,
    outbound: mpsc::Sender<WorkerEnvelope>,
    stop: watch::Receiver<bool>,
}

impl WorkerContext {
    pub fn new(
        strategy: StrategyConfig,
        worker_id: Uuid,
        seed: Option<RunSeed>,
        heartbeat_interval: Duration,
        outbound: mpsc::Sender<WorkerEnvelope>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            strategy,
            worker_id,
            seed,
            heartbeat_interval,
            outbound,
            stop,
        }
    }

    pub fn strategy(&self) -> &StrategyConfig {
        &self.strategy
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy.id
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Phase to resume in; ENTRY for a fresh start
    pub fn current_phase(&self) -> Phase {
        self.seed
            .as_ref()
            .map(|s| s.current_phase)
            .unwrap_or(Phase::Entry)
    }

    pub fn phase_states(&self) -> BTreeMap<Phase, PhaseState> {
        self.seed
            .as_ref()
            .map(|s| s.phase_states.clone())
            .unwrap_or_default()
    }

    pub fn last_processed_candle(&self) -> Option<&Candle> {
        self.seed.as_ref().and_then(|s| s.last_processed_candle.as_ref())
    }

    pub fn is_resumed(&self) -> bool {
        self.seed.is_some()
    }

    /// Resolves once the Supervisor asks this worker to stop
    pub async fn stopped(&self) {
        let mut stop = self.stop.clone();
        // A dropped sender means the Supervisor is gone: stop as well
        let _ = stop.wait_for(|requested| *requested).await;
    }

    pub async fn emit(&self, message: WorkerMessage) -> Result<()> {
        self.outbound
            .send(WorkerEnvelope::new(&self.strategy.id, self.worker_id, message))
            .await
            .map_err(|_| StratdError::ChannelClosed("supervisor inbox".into()))
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.emit(WorkerMessage::Heartbeat).await
    }

    pub async fn update_state(&self, patch: StatePatch) -> Result<()> {
        self.emit(WorkerMessage::StateUpdate(patch)).await
    }

    pub async fn signal(&self, kind: SignalKind, signal: Signal) -> Result<()> {
        let message = match kind {
            SignalKind::Entry => WorkerMessage::EntrySignal(signal),
            SignalKind::Exit => WorkerMessage::ExitSignal(signal),
            SignalKind::Adjustment => WorkerMessage::AdjustmentSignal(signal),
        };
        self.emit(message).await
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> Result<()> {
        self.emit(WorkerMessage::Log(LogEntry {
            level,
            message: message.into(),
            data: serde_json::Value::Null,
        }))
        .await
    }
}

/// Runner that only keeps the worker alive: heartbeats until stopped.
/// Used when no market-data feed is wired in (dry runs).
pub struct IdleRunner;

#[async_trait]
impl StrategyRunner for IdleRunner {
    async fn run(&mut self, ctx: WorkerContext) -> anyhow::Result<()> {
        info!(
            strategy_id = %ctx.strategy_id(),
            phase = %ctx.current_phase(),
            resumed = ctx.is_resumed(),
            "idle runner started"
        );
        ctx.log(LogLevel::Info, format!("worker started in {}", ctx.current_phase()))
            .await?;

        let mut ticker = tokio::time::interval(ctx.heartbeat_interval());
        loop {
            tokio::select! {
                _ = ctx.stopped() => break,
                _ = ticker.tick() => ctx.heartbeat().await?,
            }
        }
        Ok(())
    }
}

pub struct IdleRunnerFactory;

impl RunnerFactory for IdleRunnerFactory {
    fn create(&self, _strategy: &StrategyConfig) -> Result<Box<dyn StrategyRunner>> {
        Ok(Box::new(IdleRunner))
    }
}
