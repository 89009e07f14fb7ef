//! Health and diagnostics reporting
//!
//! Aggregates persisted state, the live worker pool, cache consistency and
//! missed-data backlog into health summaries with remediation hints. Also
//! serves them read-only over HTTP for process supervision.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use super::control::{ControlPlane, StrategyStatus};
use crate::config::PersistenceConfig;
use crate::domain::Phase;
use crate::error::{Result, StratdError};
use crate::persistence::{
    ConsistencyReport, MissedDataStats, MissedDataTracker, StateHealthStats,
    StatePersistenceService,
};
use crate::recovery::{RecoveryReport, RecoveryService};
use crate::supervisor::{SupervisorHandle, WorkerInfo, WorkerStats};

/// Coarse status label derived from the healthy/total ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthLabel {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
    NoStrategies,
}

impl HealthLabel {
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 0.9 {
            HealthLabel::Excellent
        } else if ratio >= 0.8 {
            HealthLabel::Good
        } else if ratio >= 0.6 {
            HealthLabel::Fair
        } else if ratio >= 0.3 {
            HealthLabel::Poor
        } else {
            HealthLabel::Critical
        }
    }

    pub fn from_counts(healthy: usize, total: usize) -> Self {
        if total == 0 {
            HealthLabel::NoStrategies
        } else {
            Self::from_ratio(healthy as f64 / total as f64)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLabel::Excellent => "EXCELLENT",
            HealthLabel::Good => "GOOD",
            HealthLabel::Fair => "FAIR",
            HealthLabel::Poor => "POOR",
            HealthLabel::Critical => "CRITICAL",
            HealthLabel::NoStrategies => "NO_STRATEGIES",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

impl From<&WorkerStats> for WorkerSummary {
    fn from(stats: &WorkerStats) -> Self {
        Self {
            total: stats.total,
            healthy: stats.healthy,
            unhealthy: stats.unhealthy,
        }
    }
}

/// Aggregated health payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthLabel,
    pub healthy_ratio: f64,
    pub workers: WorkerSummary,
    pub states: StateHealthStats,
    pub recovery_complete: bool,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

/// Liveness of one strategy as seen from its persisted state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyCondition {
    Healthy,
    Unhealthy,
    Stale,
    Stopped,
}

/// Per-strategy health payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyHealth {
    pub strategy_id: String,
    pub status: HealthLabel,
    pub condition: StrategyCondition,
    pub is_running: bool,
    pub current_phase: Phase,
    pub heartbeat_age_secs: i64,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub restart_count: u32,
    pub worker: Option<WorkerInfo>,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    pub health: SystemHealth,
    pub workers: WorkerStats,
    pub consistency: ConsistencyReport,
    pub missed_data: MissedDataStats,
    pub recovery: Option<RecoveryReport>,
    pub recommendations: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

pub struct HealthReporter {
    persistence: Arc<StatePersistenceService>,
    missed_data: Arc<MissedDataTracker>,
    supervisor: SupervisorHandle,
    recovery: Arc<RecoveryService>,
    healthy_threshold: Duration,
    stale_threshold: Duration,
    started_at: DateTime<Utc>,
}

impl HealthReporter {
    pub fn new(
        persistence: Arc<StatePersistenceService>,
        missed_data: Arc<MissedDataTracker>,
        supervisor: SupervisorHandle,
        recovery: Arc<RecoveryService>,
        config: &PersistenceConfig,
    ) -> Self {
        Self {
            persistence,
            missed_data,
            supervisor,
            recovery,
            healthy_threshold: Duration::seconds(config.healthy_threshold_secs as i64),
            stale_threshold: Duration::seconds(config.stale_threshold_secs as i64),
            started_at: Utc::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    pub async fn get_health(&self) -> Result<SystemHealth> {
        let states = self.persistence.get_health_stats().await?;
        let workers = self.supervisor.get_worker_stats().await?;
        Ok(self.summarize(states, &workers))
    }

    fn summarize(&self, states: StateHealthStats, workers: &WorkerStats) -> SystemHealth {
        let healthy_ratio = if workers.total == 0 {
            0.0
        } else {
            workers.healthy as f64 / workers.total as f64
        };
        SystemHealth {
            status: HealthLabel::from_counts(workers.healthy, workers.total),
            healthy_ratio,
            workers: WorkerSummary::from(workers),
            states,
            recovery_complete: self.recovery.is_complete(),
            uptime_seconds: self.uptime_seconds(),
            timestamp: Utc::now(),
        }
    }

    pub async fn get_strategy_health(&self, strategy_id: &str) -> Result<StrategyHealth> {
        let state = self
            .persistence
            .load_state(strategy_id)
            .await?
            .ok_or_else(|| StratdError::StrategyNotFound(strategy_id.to_string()))?;
        let worker = self.supervisor.get_worker(strategy_id).await?;
        let age = state.heartbeat_age(Utc::now());

        let condition = if !state.is_running {
            StrategyCondition::Stopped
        } else if age > self.stale_threshold {
            StrategyCondition::Stale
        } else if age < self.healthy_threshold && worker.as_ref().map_or(false, |w| w.healthy) {
            StrategyCondition::Healthy
        } else {
            StrategyCondition::Unhealthy
        };

        let mut issues = Vec::new();
        match (&worker, state.is_running) {
            (None, true) => issues.push("marked running but no worker is registered".to_string()),
            (Some(_), false) => issues.push("worker registered but state is stopped".to_string()),
            (Some(w), true) if !w.healthy => issues.push(format!(
                "worker missed heartbeats ({}s since last)",
                w.secs_since_heartbeat
            )),
            _ => {}
        }
        if condition == StrategyCondition::Stale {
            issues.push(format!("heartbeat is {} minutes old", age.num_minutes()));
        }
        if state.error_count > 0 {
            issues.push(format!(
                "{} errors recorded, last: {}",
                state.error_count,
                state.last_error.as_deref().unwrap_or("unknown")
            ));
        }

        let status = match condition {
            StrategyCondition::Stopped => HealthLabel::NoStrategies,
            StrategyCondition::Healthy => HealthLabel::from_counts(1, 1),
            _ => HealthLabel::from_counts(0, 1),
        };

        Ok(StrategyHealth {
            strategy_id: state.strategy_id,
            status,
            condition,
            is_running: state.is_running,
            current_phase: state.current_phase,
            heartbeat_age_secs: age.num_seconds(),
            error_count: state.error_count,
            last_error: state.last_error,
            restart_count: state.restart_count,
            worker,
            issues,
        })
    }

    pub async fn get_diagnostics(&self) -> Result<Diagnostics> {
        let states = self.persistence.get_health_stats().await?;
        let workers = self.supervisor.get_worker_stats().await?;
        let consistency = self.persistence.validate_state_consistency().await?;
        let missed_data = self.missed_data.stats().await?;
        let recovery = self.recovery.last_report().await;

        let health = self.summarize(states, &workers);
        let recommendations =
            recommendations(&health, &consistency, &missed_data, recovery.as_ref());

        Ok(Diagnostics {
            health,
            workers,
            consistency,
            missed_data,
            recovery,
            recommendations,
            timestamp: Utc::now(),
        })
    }
}

/// Human-readable remediation hints
pub fn recommendations(
    health: &SystemHealth,
    consistency: &ConsistencyReport,
    missed_data: &MissedDataStats,
    recovery: Option<&RecoveryReport>,
) -> Vec<String> {
    let mut hints = Vec::new();

    if health.workers.unhealthy > 0 {
        hints.push(format!(
            "{} strategies unhealthy; they will be restarted after missed heartbeats",
            health.workers.unhealthy
        ));
    }
    let orphaned = health.states.running.saturating_sub(health.workers.total);
    if orphaned > 0 {
        hints.push(format!(
            "{} states marked running without a live worker; run stale cleanup or restart them",
            orphaned
        ));
    }
    if health.states.stale > 0 {
        hints.push(format!(
            "{} running states have stale heartbeats and will be demoted by cleanup",
            health.states.stale
        ));
    }
    if !consistency.fast_store_available {
        hints.push("fast store unreachable; running on durable store only".to_string());
    }
    if consistency.inconsistent > 0 {
        hints.push(format!(
            "{} states inconsistent between cache and durable store; cache repair will evict them",
            consistency.inconsistent
        ));
    }
    if consistency.missing_in_fast > 0 {
        hints.push(format!(
            "{} running states missing from the cache; cache repair will repopulate them",
            consistency.missing_in_fast
        ));
    }
    if missed_data.requires_attention > 0 {
        hints.push(format!(
            "{} market-data gaps too large for automatic backfill need manual attention",
            missed_data.requires_attention
        ));
    }
    if missed_data.failed > 0 {
        hints.push(format!(
            "{} missed-data backfills failed after retries",
            missed_data.failed
        ));
    }
    if let Some(report) = recovery {
        if report.failed > 0 {
            hints.push(format!(
                "{} strategies failed recovery and were left stopped",
                report.failed
            ));
        }
    }
    if !health.recovery_complete {
        hints.push("startup recovery still running; new starts are blocked".to_string());
    }

    hints
}

// ==================== HTTP server ====================

pub fn router(control: Arc<ControlPlane>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(liveness_handler))
        .route("/health", get(health_handler))
        .route("/health/:id", get(strategy_health_handler))
        .route("/diagnostics", get(diagnostics_handler))
        .route("/status/:id", get(status_handler))
        .with_state(control)
        .layer(cors)
}

/// Read-only health server
pub struct HealthServer {
    control: Arc<ControlPlane>,
    port: u16,
}

impl HealthServer {
    pub fn new(control: Arc<ControlPlane>, port: u16) -> Self {
        Self { control, port }
    }

    pub async fn run(&self) -> Result<()> {
        let app = router(Arc::clone(&self.control));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting health server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| StratdError::Internal(format!("Health server error: {}", e)))?;

        Ok(())
    }
}

fn error_response(e: StratdError) -> (StatusCode, String) {
    let code = match &e {
        StratdError::StrategyNotFound(_) => StatusCode::NOT_FOUND,
        StratdError::RecoveryInProgress => StatusCode::SERVICE_UNAVAILABLE,
        e if e.is_durability_failure() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, e.reason())
}

/// Liveness probe
async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn health_handler(
    State(control): State<Arc<ControlPlane>>,
) -> std::result::Result<(StatusCode, Json<SystemHealth>), (StatusCode, String)> {
    let health = control.get_health().await.map_err(error_response)?;
    let code = match health.status {
        HealthLabel::Critical => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    Ok((code, Json(health)))
}

async fn strategy_health_handler(
    State(control): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
) -> std::result::Result<Json<StrategyHealth>, (StatusCode, String)> {
    control
        .get_strategy_health(&id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn diagnostics_handler(
    State(control): State<Arc<ControlPlane>>,
) -> std::result::Result<Json<Diagnostics>, (StatusCode, String)> {
    control.get_diagnostics().await.map(Json).map_err(error_response)
}

async fn status_handler(
    State(control): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
) -> std::result::Result<Json<StrategyStatus>, (StatusCode, String)> {
    control.get_status(&id).await.map(Json).map_err(error_response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(total: usize, healthy: usize, running: usize, stale: usize) -> SystemHealth {
        SystemHealth {
            status: HealthLabel::from_counts(healthy, total),
            healthy_ratio: 0.0,
            workers: WorkerSummary {
                total,
                healthy,
                unhealthy: total - healthy,
            },
            states: StateHealthStats {
                total: running,
                running,
                healthy: running - stale,
                unhealthy: stale,
                stale,
            },
            recovery_complete: true,
            uptime_seconds: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_label_boundaries() {
        assert_eq!(HealthLabel::from_ratio(0.9), HealthLabel::Excellent);
        assert_eq!(HealthLabel::from_ratio(0.89), HealthLabel::Good);
        assert_eq!(HealthLabel::from_ratio(0.8), HealthLabel::Good);
        assert_eq!(HealthLabel::from_ratio(0.6), HealthLabel::Fair);
        assert_eq!(HealthLabel::from_ratio(0.3), HealthLabel::Poor);
        assert_eq!(HealthLabel::from_ratio(0.29), HealthLabel::Critical);
    }

    #[test]
    fn test_label_from_counts() {
        assert_eq!(HealthLabel::from_counts(9, 10), HealthLabel::Excellent);
        assert_eq!(HealthLabel::from_counts(8, 10), HealthLabel::Good);
        assert_eq!(HealthLabel::from_counts(0, 0), HealthLabel::NoStrategies);
        assert_eq!(
            serde_json::to_string(&HealthLabel::NoStrategies).unwrap(),
            "\"NO_STRATEGIES\""
        );
    }

    #[test]
    fn test_recommendations_name_counts() {
        let consistency = ConsistencyReport {
            checked: 4,
            consistent: 2,
            inconsistent: 2,
            ..Default::default()
        };
        let missed = MissedDataStats {
            requires_attention: 1,
            ..Default::default()
        };
        let hints = recommendations(&health(4, 3, 5, 0), &consistency, &missed, None);

        assert!(hints.iter().any(|h| h.starts_with("1 strategies unhealthy")));
        assert!(hints.iter().any(|h| h.starts_with("1 states marked running without a live worker")));
        assert!(hints
            .iter()
            .any(|h| h.starts_with("2 states inconsistent between cache and durable store")));
        assert!(hints.iter().any(|h| h.starts_with("1 market-data gaps")));
    }

    #[test]
    fn test_no_recommendations_when_clean() {
        let hints = recommendations(
            &health(3, 3, 3, 0),
            &ConsistencyReport::default(),
            &MissedDataStats::default(),
            Some(&RecoveryReport::default()),
        );
        assert!(hints.is_empty());
    }

    #[test]
    fn test_recommendations_flag_unreachable_fast_store() {
        let consistency = ConsistencyReport {
            fast_store_available: false,
            ..Default::default()
        };
        let hints = recommendations(
            &health(3, 3, 3, 0),
            &consistency,
            &MissedDataStats::default(),
            None,
        );
        assert_eq!(hints, vec!["fast store unreachable; running on durable store only"]);
    }
}
