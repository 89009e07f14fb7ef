//! Worker Supervisor: owns the worker pool
//!
//! The pool map is owned by the `run()` loop and mutated nowhere else.
//! Callers go through the clone-friendly `SupervisorHandle`. The loop uses
//! `tokio::select!` to:
//!   - Serve start/stop/restart/stats requests
//!   - Route worker messages (heartbeats, signals, state updates, logs)
//!   - Process worker exits, stop deadlines and delayed fault restarts
//!   - Periodically sweep for workers that stopped heartbeating

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::command::{ExitAction, LaunchMode, SupervisorCommand, SupervisorEvent};
use super::orders::OrderSink;
use super::worker_handle::{WorkerHandle, WorkerInfo, WorkerStats};
use crate::config::SupervisorConfig;
use crate::domain::{AuditKind, AuditRecord, LogLevel, RuntimeState, StrategyCatalog};
use crate::error::{Result, StratdError};
use crate::persistence::{RunInit, RunSeed, StatePersistenceService};
use crate::worker::{
    LogEntry, WorkerEnvelope, WorkerLaunch, WorkerLink, WorkerMessage, WorkerOutcome,
    WorkerTransport,
};

/// Clonable handle for talking to the Supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| StratdError::ChannelClosed("supervisor command channel".into()))?;
        rx.await
            .map_err(|_| StratdError::ChannelClosed("supervisor dropped the request".into()))
    }

    /// Launch a fresh worker. Rejected when the pool is full, the strategy is
    /// already running, unknown or inactive.
    pub async fn start_strategy(&self, strategy_id: &str) -> Result<()> {
        self.request(|reply| SupervisorCommand::Start {
            strategy_id: strategy_id.to_string(),
            reply,
        })
        .await?
    }

    /// Cooperative stop, forced after the grace period. Resolves once the
    /// worker is gone and its state is marked stopped.
    pub async fn stop_strategy(&self, strategy_id: &str) -> Result<()> {
        self.request(|reply| SupervisorCommand::Stop {
            strategy_id: strategy_id.to_string(),
            reply,
        })
        .await?
    }

    /// Stop (if running) then start
    pub async fn restart_strategy(&self, strategy_id: &str) -> Result<()> {
        self.request(|reply| SupervisorCommand::Restart {
            strategy_id: strategy_id.to_string(),
            reply,
        })
        .await?
    }

    /// Relaunch pre-seeded with the phase, phase states and last candle of `state`
    pub async fn restart_strategy_with_state(&self, state: RuntimeState) -> Result<()> {
        self.request(|reply| SupervisorCommand::RestartWithState {
            state: Box::new(state),
            reply,
        })
        .await?
    }

    pub async fn get_worker_stats(&self) -> Result<WorkerStats> {
        self.request(|reply| SupervisorCommand::Stats { reply }).await
    }

    pub async fn get_worker(&self, strategy_id: &str) -> Result<Option<WorkerInfo>> {
        self.request(|reply| SupervisorCommand::Worker {
            strategy_id: strategy_id.to_string(),
            reply,
        })
        .await
    }

    /// Stop every worker concurrently and wait for the loop to exit
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| SupervisorCommand::Shutdown { reply })
            .await
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    persistence: Arc<StatePersistenceService>,
    catalog: Arc<dyn StrategyCatalog>,
    transport: Arc<dyn WorkerTransport>,
    orders: Arc<dyn OrderSink>,

    workers: HashMap<String, WorkerHandle>,
    /// Strategies with a fault restart waiting out its backoff
    pending_restarts: HashSet<String>,
    shutting_down: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,

    cmd_rx: mpsc::Receiver<SupervisorCommand>,
    msg_tx: mpsc::Sender<WorkerEnvelope>,
    msg_rx: mpsc::Receiver<WorkerEnvelope>,
    event_tx: mpsc::UnboundedSender<SupervisorEvent>,
    event_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        persistence: Arc<StatePersistenceService>,
        catalog: Arc<dyn StrategyCatalog>,
        transport: Arc<dyn WorkerTransport>,
        orders: Arc<dyn OrderSink>,
    ) -> (Self, SupervisorHandle) {
        let capacity = config.channel_capacity.max(1);
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (msg_tx, msg_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let supervisor = Self {
            config,
            persistence,
            catalog,
            transport,
            orders,
            workers: HashMap::new(),
            pending_restarts: HashSet::new(),
            shutting_down: false,
            shutdown_waiters: Vec::new(),
            cmd_rx,
            msg_tx,
            msg_rx,
            event_tx,
            event_rx,
        };
        (supervisor, SupervisorHandle { tx: cmd_tx })
    }

    /// Main supervisor loop. Returns after shutdown once every worker has exited
    pub async fn run(mut self) {
        info!(
            max_workers = self.config.max_workers,
            heartbeat_interval_ms = self.config.heartbeat_interval_ms,
            "supervisor starting main loop"
        );

        let mut sweep_tick = tokio::time::interval(self.config.heartbeat_interval());
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep_tick.tick().await;

        let mut commands_open = true;

        loop {
            tokio::select! {
                // --- Requests from handles ---
                cmd = self.cmd_rx.recv(), if commands_open => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            info!("supervisor: all handles dropped");
                            commands_open = false;
                            self.begin_shutdown(None);
                        }
                    }
                }

                // --- Worker messages ---
                Some(envelope) = self.msg_rx.recv() => {
                    self.route(envelope).await;
                }

                // --- Exits, deadlines, delayed restarts ---
                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event).await;
                }

                // --- Periodic: heartbeat sweep ---
                _ = sweep_tick.tick() => {
                    self.heartbeat_sweep();
                }
            }

            if self.shutting_down && self.workers.is_empty() {
                break;
            }
        }

        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!("supervisor: main loop exited");
    }

    async fn handle_command(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::Start { strategy_id, reply } => {
                let result = self.launch(&strategy_id, LaunchMode::Fresh).await;
                if result.is_ok() {
                    self.pending_restarts.remove(&strategy_id);
                }
                let _ = reply.send(result);
            }
            SupervisorCommand::Stop { strategy_id, reply } => {
                // A stop also cancels a fault restart waiting out its backoff
                let cancelled = self.pending_restarts.remove(&strategy_id);
                if self.workers.contains_key(&strategy_id) {
                    self.begin_stop(&strategy_id, Some(ExitAction::Reply(reply)));
                } else if cancelled {
                    info!(strategy_id = %strategy_id, "scheduled restart cancelled by stop");
                    let _ = reply.send(self.persistence.mark_stopped(&strategy_id).await);
                } else {
                    let _ = reply.send(Err(StratdError::NotRunning(strategy_id)));
                }
            }
            SupervisorCommand::Restart { strategy_id, reply } => {
                self.restart(&strategy_id, LaunchMode::Manual, reply).await;
            }
            SupervisorCommand::RestartWithState { state, reply } => {
                let seed = RunSeed::from_state(&state);
                self.restart(&state.strategy_id, LaunchMode::Recovery(seed), reply)
                    .await;
            }
            SupervisorCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            SupervisorCommand::Worker { strategy_id, reply } => {
                let _ = reply.send(self.workers.get(&strategy_id).map(WorkerHandle::info));
            }
            SupervisorCommand::Shutdown { reply } => {
                self.begin_shutdown(Some(reply));
            }
        }
    }

    async fn restart(
        &mut self,
        strategy_id: &str,
        mode: LaunchMode,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if self.shutting_down {
            let _ = reply.send(Err(StratdError::InvalidState(
                "supervisor is shutting down".into(),
            )));
            return;
        }
        if self.pending_restarts.remove(strategy_id) {
            debug!(strategy_id, "scheduled restart superseded");
        }
        if self.workers.contains_key(strategy_id) {
            self.begin_stop(
                strategy_id,
                Some(ExitAction::Relaunch {
                    mode,
                    reply: Some(reply),
                }),
            );
        } else {
            let result = self.launch(strategy_id, mode).await;
            let _ = reply.send(result);
        }
    }

    // ==================== Launch ====================

    async fn launch(&mut self, strategy_id: &str, mode: LaunchMode) -> Result<()> {
        if self.shutting_down {
            return Err(StratdError::InvalidState(
                "supervisor is shutting down".into(),
            ));
        }
        if self.workers.contains_key(strategy_id) {
            return Err(StratdError::AlreadyRunning(strategy_id.to_string()));
        }
        if self.workers.len() >= self.config.max_workers {
            warn!(
                strategy_id,
                active = self.workers.len(),
                "worker pool at capacity, start rejected"
            );
            return Err(StratdError::CapacityExhausted {
                max: self.config.max_workers,
            });
        }

        let strategy = self
            .catalog
            .get(strategy_id)
            .await?
            .ok_or_else(|| StratdError::StrategyNotFound(strategy_id.to_string()))?;
        if !strategy.active {
            return Err(StratdError::StrategyInactive(strategy_id.to_string()));
        }

        let seed = match &mode {
            LaunchMode::Recovery(seed) => Some(seed.clone()),
            LaunchMode::Heal | LaunchMode::Fault => self.resume_seed(strategy_id).await,
            LaunchMode::Fresh | LaunchMode::Manual => None,
        };

        let worker_id = Uuid::new_v4();
        self.persistence
            .initialize_run(
                strategy_id,
                RunInit {
                    worker_handle_id: worker_id.to_string(),
                    seed: seed.clone(),
                    reset_errors: mode.resets_errors(),
                    bump_restart: mode.counts_as_restart(),
                },
            )
            .await?;

        let launch = WorkerLaunch {
            worker_id,
            strategy,
            seed,
            heartbeat_interval: self.config.heartbeat_interval(),
        };
        let WorkerLink { control, completion } =
            match self.transport.launch(launch, self.msg_tx.clone()) {
                Ok(link) => link,
                Err(e) => {
                    error!(strategy_id, error = %e, "worker launch failed");
                    if let Err(stop_err) = self.persistence.mark_stopped(strategy_id).await {
                        error!(strategy_id, error = %stop_err, "failed to mark stopped after launch failure");
                    }
                    return Err(StratdError::WorkerLaunch {
                        strategy_id: strategy_id.to_string(),
                        reason: e.reason(),
                    });
                }
            };

        let events = self.event_tx.clone();
        let exited_id = strategy_id.to_string();
        tokio::spawn(async move {
            let outcome = completion.await;
            let _ = events.send(SupervisorEvent::Exited {
                strategy_id: exited_id,
                worker_id,
                outcome,
            });
        });

        self.workers.insert(
            strategy_id.to_string(),
            WorkerHandle::new(strategy_id, worker_id, control),
        );

        self.persistence
            .audit(
                &AuditRecord::new(
                    strategy_id,
                    AuditKind::WorkerStarted,
                    LogLevel::Info,
                    format!("worker started ({})", mode.as_str()),
                )
                .with_data(serde_json::json!({ "worker_id": worker_id })),
            )
            .await;

        info!(
            strategy_id,
            %worker_id,
            mode = mode.as_str(),
            active = self.workers.len(),
            "worker started"
        );
        Ok(())
    }

    /// Progress to resume from on automatic restarts
    async fn resume_seed(&self, strategy_id: &str) -> Option<RunSeed> {
        match self.persistence.load_state(strategy_id).await {
            Ok(Some(state)) => Some(RunSeed::from_state(&state)),
            Ok(None) => None,
            Err(e) => {
                warn!(strategy_id, error = %e, "cannot resume previous progress, starting fresh");
                None
            }
        }
    }

    // ==================== Stop ====================

    fn begin_stop(&mut self, strategy_id: &str, action: Option<ExitAction>) {
        let Some(handle) = self.workers.get_mut(strategy_id) else {
            return;
        };
        if let Some(action) = action {
            handle.on_exit.push(action);
        }
        if handle.stopping {
            return;
        }

        handle.stopping = true;
        handle.control.request_stop();

        let events = self.event_tx.clone();
        let grace = self.config.stop_grace();
        let worker_id = handle.worker_id;
        let deadline_id = strategy_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(SupervisorEvent::StopDeadline {
                strategy_id: deadline_id,
                worker_id,
            });
        });
        debug!(strategy_id, %worker_id, "stop requested");
    }

    fn begin_shutdown(&mut self, reply: Option<oneshot::Sender<()>>) {
        if let Some(reply) = reply {
            self.shutdown_waiters.push(reply);
        }
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.pending_restarts.clear();

        let ids: Vec<String> = self.workers.keys().cloned().collect();
        info!(workers = ids.len(), "supervisor: stopping all workers");
        for strategy_id in ids {
            self.begin_stop(&strategy_id, None);
        }
    }

    // ==================== Events ====================

    async fn handle_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Exited {
                strategy_id,
                worker_id,
                outcome,
            } => self.on_exit(&strategy_id, worker_id, outcome).await,
            SupervisorEvent::StopDeadline {
                strategy_id,
                worker_id,
            } => {
                if let Some(handle) = self.workers.get(&strategy_id) {
                    if handle.worker_id == worker_id {
                        warn!(
                            strategy_id = %strategy_id,
                            %worker_id,
                            grace_ms = self.config.stop_grace_ms,
                            "worker ignored stop request, killing"
                        );
                        handle.control.kill();
                    }
                }
            }
            SupervisorEvent::RestartDue { strategy_id } => {
                if !self.pending_restarts.remove(&strategy_id) || self.shutting_down {
                    return;
                }
                if self.workers.contains_key(&strategy_id) {
                    debug!(strategy_id = %strategy_id, "already running, scheduled restart skipped");
                    return;
                }
                if let Err(e) = self.launch(&strategy_id, LaunchMode::Fault).await {
                    error!(strategy_id = %strategy_id, error = %e, "automatic restart failed");
                }
            }
        }
    }

    async fn on_exit(&mut self, strategy_id: &str, worker_id: Uuid, outcome: WorkerOutcome) {
        match self.workers.get(strategy_id) {
            Some(handle) if handle.worker_id == worker_id => {}
            _ => {
                debug!(strategy_id, %worker_id, "exit of a stale worker ignored");
                return;
            }
        }
        let Some(mut handle) = self.workers.remove(strategy_id) else {
            return;
        };

        let fault = match &outcome {
            WorkerOutcome::Failed(reason) if !handle.stopping => Some(reason.clone()),
            WorkerOutcome::Killed if !handle.stopping => {
                Some("worker terminated unexpectedly".to_string())
            }
            _ => None,
        };

        let mut error_count = 0;
        if let Some(reason) = &fault {
            handle.healthy = false;
            error!(strategy_id, %worker_id, "worker fault: {}", reason);
            match self.persistence.record_error(strategy_id, reason).await {
                Ok(state) => error_count = state.error_count,
                Err(e) => error!(strategy_id, error = %e, "failed to record worker error"),
            }
        }

        let stopped = self.persistence.mark_stopped(strategy_id).await;
        if let Err(e) = &stopped {
            error!(strategy_id, error = %e, "failed to mark strategy stopped");
        }

        let uptime_secs = Instant::now().duration_since(handle.started_at).as_secs();
        let (kind, level) = if fault.is_some() {
            (AuditKind::WorkerFault, LogLevel::Error)
        } else {
            (AuditKind::WorkerStopped, LogLevel::Info)
        };
        self.persistence
            .audit(
                &AuditRecord::new(strategy_id, kind, level, format!("worker exited: {}", outcome))
                    .with_data(serde_json::json!({
                        "worker_id": worker_id,
                        "outcome": outcome.as_str(),
                        "uptime_secs": uptime_secs,
                    })),
            )
            .await;
        info!(
            strategy_id,
            %worker_id,
            outcome = %outcome,
            uptime_secs,
            active = self.workers.len(),
            "worker exited"
        );

        let mut relaunched = false;
        for action in handle.on_exit.drain(..) {
            match action {
                ExitAction::Reply(reply) => {
                    let _ = reply.send(mirror(&stopped));
                }
                ExitAction::Relaunch { mode, reply } => {
                    relaunched = true;
                    let result = self.launch(strategy_id, mode).await;
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                error!(strategy_id, error = %e, "relaunch failed");
                            }
                        }
                    }
                }
            }
        }

        if fault.is_some() && !relaunched && !self.shutting_down {
            self.schedule_fault_restart(strategy_id, error_count);
        }
    }

    fn schedule_fault_restart(&mut self, strategy_id: &str, error_count: u32) {
        if error_count >= self.config.max_consecutive_faults {
            error!(
                strategy_id,
                error_count,
                limit = self.config.max_consecutive_faults,
                "fault limit reached, strategy left stopped"
            );
            return;
        }
        if !self.pending_restarts.insert(strategy_id.to_string()) {
            debug!(strategy_id, "restart already scheduled");
            return;
        }

        let backoff = self.config.restart_backoff();
        warn!(strategy_id, error_count, backoff_ms = self.config.restart_backoff_ms, "scheduling automatic restart");

        let events = self.event_tx.clone();
        let restart_id = strategy_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = events.send(SupervisorEvent::RestartDue {
                strategy_id: restart_id,
            });
        });
    }

    // ==================== Heartbeat sweep ====================

    fn heartbeat_sweep(&mut self) {
        if self.shutting_down {
            return;
        }
        let timeout = self.config.heartbeat_timeout();
        let now = Instant::now();

        let silent: Vec<String> = self
            .workers
            .values_mut()
            .filter(|h| !h.stopping && now.duration_since(h.last_heartbeat) > timeout)
            .map(|h| {
                h.healthy = false;
                warn!(
                    strategy_id = %h.strategy_id,
                    worker_id = %h.worker_id,
                    silent_secs = now.duration_since(h.last_heartbeat).as_secs(),
                    "missed heartbeats, restarting worker"
                );
                h.strategy_id.clone()
            })
            .collect();

        for strategy_id in silent {
            self.begin_stop(
                &strategy_id,
                Some(ExitAction::Relaunch {
                    mode: LaunchMode::Heal,
                    reply: None,
                }),
            );
        }
    }

    // ==================== Message routing ====================

    async fn route(&mut self, envelope: WorkerEnvelope) {
        let WorkerEnvelope {
            strategy_id,
            worker_id,
            message,
            ..
        } = envelope;

        match self.workers.get_mut(&strategy_id) {
            Some(handle) if handle.worker_id == worker_id => {
                if matches!(message, WorkerMessage::Heartbeat) {
                    handle.record_heartbeat();
                }
            }
            _ => {
                debug!(
                    strategy_id = %strategy_id,
                    %worker_id,
                    kind = message.kind(),
                    "message from unregistered worker dropped"
                );
                return;
            }
        }

        match message {
            WorkerMessage::Heartbeat => {
                if let Err(e) = self.persistence.update_heartbeat(&strategy_id).await {
                    error!(strategy_id = %strategy_id, error = %e, "failed to persist heartbeat");
                }
            }
            WorkerMessage::EntrySignal(_)
            | WorkerMessage::ExitSignal(_)
            | WorkerMessage::AdjustmentSignal(_) => {
                if let Some((kind, signal)) = message.as_signal() {
                    info!(
                        strategy_id = %strategy_id,
                        kind = %kind,
                        symbol = %signal.symbol,
                        price = %signal.price,
                        "signal received"
                    );
                    if let Err(e) = self.orders.submit(&strategy_id, kind, signal).await {
                        error!(strategy_id = %strategy_id, kind = %kind, error = %e, "failed to forward signal");
                    }
                }
            }
            WorkerMessage::StateUpdate(patch) => {
                if patch.is_empty() {
                    return;
                }
                if let Err(e) = self.persistence.save_state(&strategy_id, &patch).await {
                    error!(strategy_id = %strategy_id, error = %e, "failed to save state update");
                }
            }
            WorkerMessage::Log(entry) => self.persist_log(&strategy_id, entry).await,
            WorkerMessage::StopAck => {
                debug!(strategy_id = %strategy_id, %worker_id, "stop acknowledged");
            }
            WorkerMessage::Unknown => {
                warn!(strategy_id = %strategy_id, %worker_id, "unknown worker message type dropped");
            }
        }
    }

    async fn persist_log(&self, strategy_id: &str, entry: LogEntry) {
        match entry.level {
            LogLevel::Error => error!(strategy_id, "worker: {}", entry.message),
            LogLevel::Warn => warn!(strategy_id, "worker: {}", entry.message),
            LogLevel::Info => info!(strategy_id, "worker: {}", entry.message),
            LogLevel::Debug => debug!(strategy_id, "worker: {}", entry.message),
        }
        self.persistence
            .audit(
                &AuditRecord::new(strategy_id, AuditKind::WorkerLog, entry.level, entry.message)
                    .with_data(entry.data),
            )
            .await;
    }

    fn stats(&self) -> WorkerStats {
        let mut workers: Vec<WorkerInfo> = self.workers.values().map(WorkerHandle::info).collect();
        workers.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));
        let healthy = workers.iter().filter(|w| w.healthy).count();
        WorkerStats {
            total: workers.len(),
            healthy,
            unhealthy: workers.len() - healthy,
            workers,
        }
    }
}

/// Caller-facing copy of a stop result
fn mirror(result: &Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_durability_failure() => Err(StratdError::DurableStore(e.reason())),
        Err(e) => Err(StratdError::Internal(e.reason())),
    }
}
