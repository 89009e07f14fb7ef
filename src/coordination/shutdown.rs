//! Graceful Shutdown Handler
//!
//! Sequences teardown so that every running strategy is stopped cooperatively
//! and marked stopped in the durable store before the process exits. Only a
//! crash leaves strategies marked running for the next boot's recovery.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM, SIGINT
    Graceful,
    /// SIGQUIT: shortened worker stop timeout
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Total timeout for the whole sequence (default: 60s)
    pub total_timeout_secs: u64,
    /// Time to wait for the supervisor to stop every worker (default: 30s)
    pub worker_stop_timeout_secs: u64,
    /// Worker stop timeout after an urgent signal (default: 5s)
    pub urgent_worker_stop_timeout_secs: u64,
    /// Time to wait for store connections to close (default: 10s)
    pub store_close_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            total_timeout_secs: 60,
            worker_stop_timeout_secs: 30,
            urgent_worker_stop_timeout_secs: 5,
            store_close_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Periodic sweeps and the health server
    StoppingBackground,
    /// Supervisor stops every worker and marks it stopped
    StoppingWorkers,
    ClosingStores,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingBackground => write!(f, "stopping_background"),
            ShutdownPhase::StoppingWorkers => write!(f, "stopping_workers"),
            ShutdownPhase::ClosingStores => write!(f, "closing_stores"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ShutdownError {
    #[error("shutdown timed out")]
    Timeout,
    #[error("component {0} failed during shutdown")]
    ComponentFailed(String),
}

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    config: ShutdownConfig,
    shutdown_requested: AtomicBool,
    urgent: AtomicBool,
    phase: watch::Sender<ShutdownPhase>,
    signal_tx: broadcast::Sender<ShutdownSignal>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        let (signal_tx, _) = broadcast::channel(8);

        Self {
            config,
            shutdown_requested: AtomicBool::new(false),
            urgent: AtomicBool::new(false),
            phase,
            signal_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.signal_tx.subscribe()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Request shutdown; an urgent signal after a graceful one still shortens the wait
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if signal == ShutdownSignal::Urgent {
            self.urgent.store(true, Ordering::SeqCst);
        }
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        let _ = self.signal_tx.send(signal);
    }

    /// Resolves once shutdown has been requested
    pub async fn wait_for_request(&self) {
        let mut rx = self.signal_tx.subscribe();
        if self.is_shutdown_requested() {
            return;
        }
        let _ = rx.recv().await;
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Execute the shutdown sequence:
    /// 1. Stop background sweeps and the health server
    /// 2. Stop every worker through the supervisor
    /// 3. Close store connections
    pub async fn execute<F1, F2, F3>(
        &self,
        stop_background: F1,
        stop_workers: F2,
        close_stores: F3,
    ) -> Result<(), ShutdownError>
    where
        F1: FnOnce(),
        F2: FnOnce() -> BoxFuture<'static, Result<(), String>>,
        F3: FnOnce() -> BoxFuture<'static, ()>,
    {
        let start = tokio::time::Instant::now();
        let total_timeout = Duration::from_secs(self.config.total_timeout_secs);
        info!(
            "Starting graceful shutdown (timeout: {}s)",
            self.config.total_timeout_secs
        );

        self.set_phase(ShutdownPhase::StoppingBackground);
        stop_background();
        debug!("Background tasks stopped");

        self.set_phase(ShutdownPhase::StoppingWorkers);
        let worker_timeout_secs = if self.urgent.load(Ordering::SeqCst) {
            self.config.urgent_worker_stop_timeout_secs
        } else {
            self.config.worker_stop_timeout_secs
        };
        let mut failure = None;
        match tokio::time::timeout(Duration::from_secs(worker_timeout_secs), stop_workers()).await {
            Ok(Ok(())) => info!("All workers stopped"),
            Ok(Err(e)) => {
                error!("Supervisor shutdown failed: {}", e);
                failure = Some(ShutdownError::ComponentFailed("supervisor".into()));
            }
            Err(_) => warn!(
                "Worker stop timeout after {}s, strategies still marked running will be recovered on next boot",
                worker_timeout_secs
            ),
        }

        self.set_phase(ShutdownPhase::ClosingStores);
        let store_timeout = Duration::from_secs(self.config.store_close_timeout_secs);
        if tokio::time::timeout(store_timeout, close_stores()).await.is_err() {
            warn!(
                "Store close timeout after {}s",
                self.config.store_close_timeout_secs
            );
        }

        self.set_phase(ShutdownPhase::Complete);
        let elapsed = start.elapsed();
        info!("Graceful shutdown completed in {:?}", elapsed);

        if let Some(failure) = failure {
            return Err(failure);
        }
        if elapsed > total_timeout {
            error!("Total shutdown timeout exceeded");
            return Err(ShutdownError::Timeout);
        }
        Ok(())
    }
}

/// Install OS signal handlers that request shutdown
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name, request) in [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ] {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut stream = match signal(kind) {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("Failed to install {} handler: {}", name, e);
                        return;
                    }
                };
                while stream.recv().await.is_some() {
                    info!("Received {}", name);
                    shutdown.request_shutdown(request);
                }
            });
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C");
                    shutdown.request_shutdown(ShutdownSignal::Graceful);
                }
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Mutex;

    #[test]
    fn test_shutdown_phase_display() {
        assert_eq!(ShutdownPhase::Running.to_string(), "running");
        assert_eq!(ShutdownPhase::StoppingWorkers.to_string(), "stopping_workers");
        assert_eq!(ShutdownPhase::Complete.to_string(), "complete");
    }

    #[tokio::test]
    async fn test_duplicate_request_ignored() {
        let shutdown = GracefulShutdown::with_defaults();
        let mut rx = shutdown.subscribe();
        assert!(!shutdown.is_shutdown_requested());

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        shutdown.request_shutdown(ShutdownSignal::Graceful);

        assert!(shutdown.is_shutdown_requested());
        assert_eq!(rx.recv().await.unwrap(), ShutdownSignal::Graceful);
        assert!(rx.try_recv().is_err());
        shutdown.wait_for_request().await;
    }

    #[tokio::test]
    async fn test_execute_runs_phases_in_order() {
        let shutdown = GracefulShutdown::with_defaults();
        let order = Arc::new(Mutex::new(Vec::new()));

        let (a, b, c) = (order.clone(), order.clone(), order.clone());
        shutdown
            .execute(
                move || a.lock().unwrap().push("background"),
                move || {
                    async move {
                        b.lock().unwrap().push("workers");
                        Ok(())
                    }
                    .boxed()
                },
                move || async move { c.lock().unwrap().push("stores") }.boxed(),
            )
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["background", "workers", "stores"]);
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_timeout_still_closes_stores() {
        let shutdown = GracefulShutdown::with_defaults();
        shutdown.request_shutdown(ShutdownSignal::Urgent);
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();

        let result = shutdown
            .execute(
                || {},
                || futures::future::pending::<Result<(), String>>().boxed(),
                move || {
                    async move { flag.store(true, Ordering::SeqCst) }.boxed()
                },
            )
            .await;

        assert!(result.is_ok());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_supervisor_failure_reported() {
        let shutdown = GracefulShutdown::with_defaults();
        let result = shutdown
            .execute(
                || {},
                || async { Err("channel closed".to_string()) }.boxed(),
                || async {}.boxed(),
            )
            .await;
        assert!(matches!(result, Err(ShutdownError::ComponentFailed(_))));
    }
}
