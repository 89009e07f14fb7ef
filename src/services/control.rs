//! Control plane facade consumed by the HTTP/API layer
//!
//! Commands never surface raw errors: every start/stop/restart/reset
//! resolves to a `CommandOutcome` carrying a success flag and a reason.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::health::{Diagnostics, HealthReporter, StrategyHealth, SystemHealth};
use crate::domain::Phase;
use crate::error::{Result, StratdError};
use crate::persistence::StatePersistenceService;
use crate::supervisor::{SupervisorHandle, WorkerInfo};

/// Result of a control command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
}

impl CommandOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(error: &StratdError) -> Self {
        Self {
            success: false,
            message: error.reason(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyStatus {
    pub strategy_id: String,
    pub is_running: bool,
    pub current_phase: Phase,
    pub last_heartbeat: DateTime<Utc>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub restart_count: u32,
    pub worker_info: Option<WorkerInfo>,
}

pub struct ControlPlane {
    supervisor: SupervisorHandle,
    persistence: Arc<StatePersistenceService>,
    reporter: HealthReporter,
    recovery_complete: Arc<AtomicBool>,
}

impl ControlPlane {
    pub fn new(
        supervisor: SupervisorHandle,
        persistence: Arc<StatePersistenceService>,
        reporter: HealthReporter,
        recovery_complete: Arc<AtomicBool>,
    ) -> Self {
        Self {
            supervisor,
            persistence,
            reporter,
            recovery_complete,
        }
    }

    fn ensure_recovered(&self) -> Result<()> {
        if self.recovery_complete.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StratdError::RecoveryInProgress)
        }
    }

    fn outcome(&self, action: &str, strategy_id: &str, result: Result<()>) -> CommandOutcome {
        match result {
            Ok(()) => {
                info!(strategy_id, action, "control command succeeded");
                CommandOutcome::ok(format!("{} {}", strategy_id, action))
            }
            Err(e) => {
                warn!(strategy_id, action, error = %e, "control command rejected");
                CommandOutcome::failed(&e)
            }
        }
    }

    pub async fn start(&self, strategy_id: &str) -> CommandOutcome {
        let result = match self.ensure_recovered() {
            Ok(()) => self.supervisor.start_strategy(strategy_id).await,
            Err(e) => Err(e),
        };
        self.outcome("started", strategy_id, result)
    }

    pub async fn stop(&self, strategy_id: &str) -> CommandOutcome {
        let result = self.supervisor.stop_strategy(strategy_id).await;
        self.outcome("stopped", strategy_id, result)
    }

    pub async fn restart(&self, strategy_id: &str) -> CommandOutcome {
        let result = match self.ensure_recovered() {
            Ok(()) => self.supervisor.restart_strategy(strategy_id).await,
            Err(e) => Err(e),
        };
        self.outcome("restarted", strategy_id, result)
    }

    /// Start each listed strategy that has no live worker. Returns how many were started.
    pub async fn autostart<'a>(&self, strategy_ids: impl IntoIterator<Item = &'a str>) -> usize {
        let mut started = 0;
        for strategy_id in strategy_ids {
            if let Ok(Some(_)) = self.supervisor.get_worker(strategy_id).await {
                debug!(strategy_id, "autostart skipped, worker already running");
                continue;
            }
            if self.start(strategy_id).await.success {
                started += 1;
            }
        }
        started
    }

    /// Clear counters and phase of a stopped strategy
    pub async fn reset_state(&self, strategy_id: &str) -> CommandOutcome {
        let result = self.persistence.reset_state(strategy_id).await.map(|_| ());
        self.outcome("reset", strategy_id, result)
    }

    pub async fn get_status(&self, strategy_id: &str) -> Result<StrategyStatus> {
        let state = self
            .persistence
            .load_state(strategy_id)
            .await?
            .ok_or_else(|| StratdError::StrategyNotFound(strategy_id.to_string()))?;
        let worker_info = self.supervisor.get_worker(strategy_id).await?;

        Ok(StrategyStatus {
            strategy_id: state.strategy_id,
            is_running: state.is_running,
            current_phase: state.current_phase,
            last_heartbeat: state.last_heartbeat,
            error_count: state.error_count,
            last_error: state.last_error,
            restart_count: state.restart_count,
            worker_info,
        })
    }

    pub async fn get_health(&self) -> Result<SystemHealth> {
        self.reporter.get_health().await
    }

    pub async fn get_strategy_health(&self, strategy_id: &str) -> Result<StrategyHealth> {
        self.reporter.get_strategy_health(strategy_id).await
    }

    pub async fn get_diagnostics(&self) -> Result<Diagnostics> {
        self.reporter.get_diagnostics().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FastStoreConfig, PersistenceConfig, RecoveryConfig, SupervisorConfig};
    use crate::domain::{StaticCatalog, StrategyCatalog, StrategyConfig, Timeframe};
    use crate::persistence::state_service::tests::DownFastStore;
    use crate::persistence::MissedDataTracker;
    use crate::recovery::RecoveryService;
    use crate::services::health::HealthLabel;
    use crate::store::{FastStore, MemoryDurableStore, MemoryFastStore};
    use crate::supervisor::{LoggingOrderSink, Supervisor};
    use crate::worker::{IdleRunnerFactory, TaskTransport};

    struct Harness {
        control: ControlPlane,
        recovery: Arc<RecoveryService>,
        supervisor: SupervisorHandle,
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryFastStore::new()))
    }

    fn harness_with(fast: Arc<dyn FastStore>) -> Harness {
        let durable = MemoryDurableStore::new();
        let persistence = Arc::new(StatePersistenceService::new(
            fast,
            Arc::new(durable.clone()),
            &FastStoreConfig::default(),
            &PersistenceConfig::default(),
        ));
        let tracker = Arc::new(MissedDataTracker::new(
            Arc::new(durable),
            &RecoveryConfig::default(),
        ));
        let catalog: Arc<dyn StrategyCatalog> = Arc::new(StaticCatalog::new(vec![StrategyConfig {
            id: "rsi-eth".into(),
            name: "RSI ETH".into(),
            active: true,
            symbol: "ETHUSDT".into(),
            timeframe: Timeframe::M15,
            risk: Default::default(),
            params: serde_json::Value::Null,
        }]));

        let (supervisor, handle) = Supervisor::new(
            SupervisorConfig::default(),
            persistence.clone(),
            catalog.clone(),
            Arc::new(TaskTransport::new(Arc::new(IdleRunnerFactory))),
            Arc::new(LoggingOrderSink),
        );
        tokio::spawn(supervisor.run());

        let recovery = Arc::new(RecoveryService::new(
            persistence.clone(),
            tracker.clone(),
            catalog,
            handle.clone(),
        ));
        let reporter = HealthReporter::new(
            persistence.clone(),
            tracker,
            handle.clone(),
            recovery.clone(),
            &PersistenceConfig::default(),
        );
        let control = ControlPlane::new(
            handle.clone(),
            persistence,
            reporter,
            recovery.completion_flag(),
        );
        Harness {
            control,
            recovery,
            supervisor: handle,
        }
    }

    #[tokio::test]
    async fn test_start_blocked_until_recovery_completes() {
        let h = harness();

        let outcome = h.control.start("rsi-eth").await;
        assert!(!outcome.success);
        assert_eq!(outcome.message, StratdError::RecoveryInProgress.reason());
        assert_eq!(h.supervisor.get_worker_stats().await.unwrap().total, 0);

        h.recovery.recover().await.unwrap();
        let outcome = h.control.start("rsi-eth").await;
        assert!(outcome.success, "{}", outcome.message);

        let status = h.control.get_status("rsi-eth").await.unwrap();
        assert!(status.is_running);
        assert_eq!(status.current_phase, Phase::Entry);
        assert!(status.worker_info.is_some());
    }

    #[tokio::test]
    async fn test_rejections_carry_reason() {
        let h = harness();
        h.recovery.recover().await.unwrap();

        let outcome = h.control.start("unknown").await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("unknown"));

        let outcome = h.control.stop("rsi-eth").await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("not running"));

        assert!(matches!(
            h.control.get_status("unknown").await,
            Err(StratdError::StrategyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_requires_stopped_strategy() {
        let h = harness();
        h.recovery.recover().await.unwrap();
        assert!(h.control.start("rsi-eth").await.success);

        assert!(!h.control.reset_state("rsi-eth").await.success);

        assert!(h.control.stop("rsi-eth").await.success);
        assert!(h.control.reset_state("rsi-eth").await.success);

        let status = h.control.get_status("rsi-eth").await.unwrap();
        assert!(!status.is_running);
        assert_eq!(status.restart_count, 0);
    }

    #[tokio::test]
    async fn test_health_and_diagnostics() {
        let h = harness();
        h.recovery.recover().await.unwrap();

        let health = h.control.get_health().await.unwrap();
        assert_eq!(health.status, HealthLabel::NoStrategies);
        assert!(health.recovery_complete);

        assert!(h.control.start("rsi-eth").await.success);
        let health = h.control.get_health().await.unwrap();
        assert_eq!(health.status, HealthLabel::Excellent);
        assert_eq!(health.workers.total, 1);

        let strategy = h.control.get_strategy_health("rsi-eth").await.unwrap();
        assert!(strategy.is_running);
        assert!(strategy.issues.is_empty(), "{:?}", strategy.issues);

        let diagnostics = h.control.get_diagnostics().await.unwrap();
        assert!(diagnostics.consistency.is_clean());
        assert_eq!(diagnostics.recovery.map(|r| r.attempted()), Some(0));
        assert!(diagnostics.recommendations.is_empty(), "{:?}", diagnostics.recommendations);
    }

    #[tokio::test]
    async fn test_diagnostics_survive_fast_store_outage() {
        let h = harness_with(Arc::new(DownFastStore));
        h.recovery.recover().await.unwrap();
        assert!(h.control.start("rsi-eth").await.success);

        let health = h.control.get_health().await.unwrap();
        assert_eq!(health.workers.total, 1);

        let diagnostics = h.control.get_diagnostics().await.unwrap();
        assert!(!diagnostics.consistency.fast_store_available);
        assert_eq!(diagnostics.workers.total, 1);
        assert_eq!(diagnostics.health.states.running, 1);
        assert!(diagnostics
            .recommendations
            .iter()
            .any(|hint| hint == "fast store unreachable; running on durable store only"));
    }

    #[tokio::test]
    async fn test_autostart_skips_running_workers() {
        let h = harness();
        h.recovery.recover().await.unwrap();

        assert_eq!(h.control.autostart(["rsi-eth"]).await, 1);
        let worker = h.supervisor.get_worker("rsi-eth").await.unwrap().unwrap();

        assert_eq!(h.control.autostart(["rsi-eth"]).await, 0);
        let same = h.supervisor.get_worker("rsi-eth").await.unwrap().unwrap();
        assert_eq!(worker.worker_id, same.worker_id);

        assert_eq!(h.control.autostart(["unknown"]).await, 0);
    }
}
