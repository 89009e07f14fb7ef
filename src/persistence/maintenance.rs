//! Maintenance Scheduler
//!
//! Runs the periodic store sweeps on independent timers:
//! - stale state cleanup (demotes running states with an old heartbeat)
//! - consistency audit (fast store vs durable store)
//! - cache repair (durable store is authoritative)
//!
//! Each sweep is self-contained; a slow or failing sweep never delays the others.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::state_service::StatePersistenceService;
use crate::config::PersistenceConfig;
use crate::error::Result;

pub struct MaintenanceScheduler {
    config: PersistenceConfig,
    persistence: Arc<StatePersistenceService>,
    running: Arc<AtomicBool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl MaintenanceScheduler {
    pub fn new(config: PersistenceConfig, persistence: Arc<StatePersistenceService>) -> Self {
        Self {
            config,
            persistence,
            running: Arc::new(AtomicBool::new(false)),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the sweep tasks
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Maintenance scheduler already running");
            return;
        }

        let max_age = self.config.cleanup_max_age_minutes;
        let mut spawned = Vec::with_capacity(3);

        let persistence = self.persistence.clone();
        spawned.push(self.spawn_sweep(
            "stale_cleanup",
            Duration::from_secs(self.config.cleanup_interval_secs),
            move || {
                let persistence = persistence.clone();
                async move {
                    let demoted = persistence.cleanup_stale_states(max_age).await?;
                    if demoted > 0 {
                        warn!("Stale cleanup demoted {} runtime states", demoted);
                    }
                    Ok(())
                }
            },
        ));

        let persistence = self.persistence.clone();
        spawned.push(self.spawn_sweep(
            "consistency_audit",
            Duration::from_secs(self.config.consistency_interval_secs),
            move || {
                let persistence = persistence.clone();
                async move {
                    let report = persistence.validate_state_consistency().await?;
                    if report.is_clean() {
                        debug!("Consistency audit: {} entries consistent", report.consistent);
                    } else {
                        warn!(
                            inconsistent = report.inconsistent,
                            missing_in_durable = report.missing_in_durable,
                            missing_in_fast = report.missing_in_fast,
                            "Consistency audit found divergence: {:?}",
                            report.inconsistent_ids
                        );
                    }
                    Ok(())
                }
            },
        ));

        let persistence = self.persistence.clone();
        spawned.push(self.spawn_sweep(
            "cache_repair",
            Duration::from_secs(self.config.cache_repair_interval_secs),
            move || {
                let persistence = persistence.clone();
                async move {
                    persistence.repair_cache().await?;
                    Ok(())
                }
            },
        ));

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(spawned);
        }

        info!(
            "Maintenance scheduler started (cleanup: {}s, consistency: {}s, cache repair: {}s)",
            self.config.cleanup_interval_secs,
            self.config.consistency_interval_secs,
            self.config.cache_repair_interval_secs
        );
    }

    fn spawn_sweep<F, Fut>(&self, name: &'static str, period: Duration, sweep: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period.max(Duration::from_millis(10)));
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; sweeps start one period after boot
            timer.tick().await;

            while running.load(Ordering::SeqCst) {
                timer.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = sweep().await {
                    error!(sweep = name, "Maintenance sweep failed: {}", e);
                }
            }
            debug!(sweep = name, "Maintenance sweep stopped");
        })
    }

    /// Stop all sweeps; in-flight iterations are aborted
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        info!("Maintenance scheduler stopped");
    }
}
