//! Recovery Service
//!
//! Runs once at process startup, before new start requests are accepted.
//! Every strategy still marked running in the durable store lost its worker
//! when the previous process died; each one is relaunched with its recovered
//! phase and progress, after recording any market-data gap for backfill.
//! A failure recovering one strategy leaves that strategy stopped and never
//! aborts the others.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::domain::{AuditKind, AuditRecord, LogLevel, MissedDataRecord, StrategyCatalog};
use crate::error::{Result, StratdError};
use crate::persistence::{MissedDataTracker, StatePersistenceService};
use crate::store::StateRecord;
use crate::supervisor::SupervisorHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryFailure {
    pub strategy_id: String,
    pub reason: String,
}

/// Outcome counters, kept for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub missed_data_records: usize,
    /// Gaps flagged for background/manual backfill
    pub large_gaps: usize,
    pub failures: Vec<RecoveryFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RecoveryReport {
    pub fn attempted(&self) -> usize {
        self.successful + self.failed + self.skipped
    }
}

enum StrategyRecovery {
    Recovered(Option<MissedDataRecord>),
    Skipped(&'static str),
}

pub struct RecoveryService {
    persistence: Arc<StatePersistenceService>,
    missed_data: Arc<MissedDataTracker>,
    catalog: Arc<dyn StrategyCatalog>,
    supervisor: SupervisorHandle,
    started: AtomicBool,
    complete: Arc<AtomicBool>,
    last_report: RwLock<Option<RecoveryReport>>,
}

impl RecoveryService {
    pub fn new(
        persistence: Arc<StatePersistenceService>,
        missed_data: Arc<MissedDataTracker>,
        catalog: Arc<dyn StrategyCatalog>,
        supervisor: SupervisorHandle,
    ) -> Self {
        Self {
            persistence,
            missed_data,
            catalog,
            supervisor,
            started: AtomicBool::new(false),
            complete: Arc::new(AtomicBool::new(false)),
            last_report: RwLock::new(None),
        }
    }

    /// Flag flipped once recovery has finished, successfully or not
    pub fn completion_flag(&self) -> Arc<AtomicBool> {
        self.complete.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    pub async fn last_report(&self) -> Option<RecoveryReport> {
        self.last_report.read().await.clone()
    }

    /// Recover every strategy left running by the previous process
    pub async fn recover(&self) -> Result<RecoveryReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StratdError::InvalidState("recovery already ran".into()));
        }

        let result = self.recover_all().await;
        self.complete.store(true, Ordering::SeqCst);
        result
    }

    async fn recover_all(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let records = self.persistence.running_records().await?;
        info!("Performing crash recovery for {} running strategies...", records.len());

        for record in records {
            let strategy_id = record.strategy_id.clone();
            match self.recover_one(record).await {
                Ok(StrategyRecovery::Recovered(gap)) => {
                    report.successful += 1;
                    if let Some(gap) = gap {
                        report.missed_data_records += 1;
                        if gap.requires_attention {
                            report.large_gaps += 1;
                        }
                    }
                }
                Ok(StrategyRecovery::Skipped(reason)) => {
                    warn!(strategy_id = %strategy_id, "recovery skipped: {}", reason);
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(strategy_id = %strategy_id, error = %e, "recovery failed, leaving strategy stopped");
                    if let Err(stop_err) = self.persistence.mark_stopped(&strategy_id).await {
                        error!(strategy_id = %strategy_id, error = %stop_err, "failed to mark strategy stopped");
                    }
                    report.failed += 1;
                    report.failures.push(RecoveryFailure {
                        strategy_id,
                        reason: e.reason(),
                    });
                }
            }
        }

        report.completed_at = Some(Utc::now());
        info!(
            successful = report.successful,
            failed = report.failed,
            skipped = report.skipped,
            missed_data_records = report.missed_data_records,
            "Crash recovery complete"
        );

        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    async fn recover_one(&self, record: StateRecord) -> Result<StrategyRecovery> {
        let strategy_id = record.strategy_id.clone();
        let state = record.into_state()?;

        let strategy = match self.catalog.get(&strategy_id).await? {
            Some(strategy) => strategy,
            None => {
                self.persistence.mark_stopped(&strategy_id).await?;
                return Ok(StrategyRecovery::Skipped("strategy not found"));
            }
        };
        if !strategy.active {
            self.persistence.mark_stopped(&strategy_id).await?;
            return Ok(StrategyRecovery::Skipped("strategy inactive"));
        }

        let gap = match &state.last_processed_candle {
            Some(candle) => {
                self.missed_data
                    .record_gap(
                        &strategy_id,
                        &candle.symbol,
                        strategy.timeframe,
                        candle.timestamp,
                        Utc::now(),
                    )
                    .await?
            }
            None => None,
        };

        let phase = state.current_phase;
        let restarts = state.restart_count;
        self.supervisor.restart_strategy_with_state(state).await?;

        self.persistence
            .audit(
                &AuditRecord::new(
                    &strategy_id,
                    AuditKind::Recovered,
                    LogLevel::Info,
                    format!("recovered in {}", phase),
                )
                .with_data(serde_json::json!({
                    "phase": phase,
                    "previous_restarts": restarts,
                    "missed_data_id": gap.as_ref().map(|g| g.id),
                })),
            )
            .await;
        info!(strategy_id = %strategy_id, phase = %phase, "strategy recovered");

        Ok(StrategyRecovery::Recovered(gap))
    }
}
