mod main_runtime;

use clap::Parser;
use futures::FutureExt;
use main_runtime::{init_logging, init_logging_simple, open_postgres, open_stores, order_sink};
use std::sync::Arc;
use std::time::Duration;
use stratd::cli::{Cli, Commands};
use stratd::config::AppConfig;
use stratd::coordination::{install_signal_handlers, GracefulShutdown, ShutdownConfig};
use stratd::domain::{MissedDataStatus, StaticCatalog, StrategyCatalog};
use stratd::error::{Result, StratdError};
use stratd::persistence::{MaintenanceScheduler, MissedDataTracker, StatePersistenceService};
use stratd::recovery::RecoveryService;
use stratd::services::{ControlPlane, HealthReporter, HealthServer};
use stratd::supervisor::Supervisor;
use stratd::worker::{IdleRunnerFactory, TaskTransport};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Migrate) => {
            init_logging_simple();
            let config = load_config(&cli)?;
            let store = open_postgres(&config).await?;
            store.migrate().await?;
            println!("Migrations applied");
        }
        Some(Commands::CleanupStale { max_age_minutes }) => {
            init_logging_simple();
            let persistence = open_persistence(&load_config(&cli)?).await?;
            let demoted = persistence.cleanup_stale_states(*max_age_minutes).await?;
            println!("Demoted {} stale runtime states", demoted);
        }
        Some(Commands::ResetState { strategy_id }) => {
            init_logging_simple();
            let persistence = open_persistence(&load_config(&cli)?).await?;
            let state = persistence.reset_state(strategy_id).await?;
            println!(
                "Reset {} (phase {}, restarts {})",
                state.strategy_id, state.current_phase, state.restart_count
            );
        }
        Some(Commands::MissedData { status }) => {
            init_logging_simple();
            show_missed_data(&load_config(&cli)?, *status).await?;
        }
        Some(Commands::Run) | None => {
            let config = load_config(&cli)?;
            init_logging(config.logging.json);
            run_daemon(config).await?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match AppConfig::load_from(&cli.config) {
        Ok(config) => config,
        Err(e) if cli.dry_run => {
            eprintln!("Failed to load configuration: {} - using defaults", e);
            AppConfig::default_config(true)
        }
        Err(e) => return Err(e.into()),
    };
    if cli.dry_run {
        config.dry_run.enabled = true;
    }

    if let Err(errors) = config.validate() {
        return Err(StratdError::InvalidState(format!(
            "invalid configuration: {}",
            errors.join("; ")
        )));
    }
    Ok(config)
}

async fn open_persistence(config: &AppConfig) -> Result<StatePersistenceService> {
    if config.dry_run.enabled {
        return Err(StratdError::InvalidState(
            "this command needs the durable store, run it without --dry-run".into(),
        ));
    }
    let stores = open_stores(config).await?;
    Ok(StatePersistenceService::new(
        stores.fast,
        stores.durable,
        &config.fast_store,
        &config.persistence,
    ))
}

async fn show_missed_data(config: &AppConfig, status: Option<MissedDataStatus>) -> Result<()> {
    let store = Arc::new(open_postgres(config).await?);
    let tracker = MissedDataTracker::new(store, &config.recovery);

    let records = tracker.list(status).await?;
    if records.is_empty() {
        println!("No missed-data records");
        return Ok(());
    }
    for record in &records {
        println!(
            "{}  {:<20} {:<10} {:>4} {:>6} candles  {} -> {}  {}{}",
            record.id,
            record.strategy_id,
            record.symbol,
            record.timeframe.as_str(),
            record.candles_count,
            record.gap_start.format("%Y-%m-%d %H:%M"),
            record.gap_end.format("%Y-%m-%d %H:%M"),
            record.status.as_str(),
            if record.requires_attention { " (attention)" } else { "" },
        );
    }

    let stats = tracker.stats().await?;
    println!(
        "\n{} total: {} pending, {} processing, {} completed, {} failed",
        stats.total(),
        stats.pending,
        stats.processing,
        stats.completed,
        stats.failed
    );
    Ok(())
}

/// Recover interrupted strategies, then supervise until a shutdown signal
async fn run_daemon(config: AppConfig) -> Result<()> {
    info!(
        "Starting stratd (dry_run={}, strategies={}, max_workers={})",
        config.dry_run.enabled,
        config.strategies.len(),
        config.supervisor.max_workers
    );

    let stores = open_stores(&config).await?;
    let persistence = Arc::new(StatePersistenceService::new(
        stores.fast.clone(),
        stores.durable.clone(),
        &config.fast_store,
        &config.persistence,
    ));
    let tracker = Arc::new(MissedDataTracker::new(stores.durable.clone(), &config.recovery));
    let catalog: Arc<dyn StrategyCatalog> =
        Arc::new(StaticCatalog::new(config.strategies.clone()));

    let (supervisor, handle) = Supervisor::new(
        config.supervisor.clone(),
        persistence.clone(),
        catalog.clone(),
        Arc::new(TaskTransport::new(Arc::new(IdleRunnerFactory))),
        order_sink(&config),
    );
    let supervisor_task = tokio::spawn(supervisor.run());

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
        &config.persistence,
    );
    let control = Arc::new(ControlPlane::new(
        handle.clone(),
        persistence.clone(),
        reporter,
        recovery.completion_flag(),
    ));

    let health_task = config.health_port.map(|port| {
        let server = HealthServer::new(control.clone(), port);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Health server error: {}", e);
            }
        })
    });

    let shutdown = Arc::new(GracefulShutdown::new(ShutdownConfig::default()));
    install_signal_handlers(shutdown.clone());

    match recovery.recover().await {
        Ok(report) => info!(
            "Crash recovery complete: {} recovered, {} failed, {} skipped",
            report.successful, report.failed, report.skipped
        ),
        Err(e) => warn!("Crash recovery failed: {} - continuing anyway", e),
    }

    // Configured active strategies that recovery did not bring back
    let active = config.strategies.iter().filter(|s| s.active);
    let started = control.autostart(active.map(|s| s.id.as_str())).await;
    info!("Autostarted {} configured strategies", started);

    let maintenance = MaintenanceScheduler::new(config.persistence.clone(), persistence);
    maintenance.start();

    info!("stratd running, waiting for shutdown signal");
    shutdown.wait_for_request().await;

    let supervisor_handle = handle.clone();
    let postgres = stores.postgres.clone();
    let result = shutdown
        .execute(
            || {
                maintenance.stop();
                if let Some(task) = &health_task {
                    task.abort();
                }
            },
            move || {
                async move {
                    supervisor_handle
                        .shutdown()
                        .await
                        .map_err(|e| e.reason())
                }
                .boxed()
            },
            move || {
                async move {
                    if let Some(postgres) = postgres {
                        postgres.pool().close().await;
                    }
                }
                .boxed()
            },
        )
        .await;

    drop(control);
    drop(handle);
    match tokio::time::timeout(Duration::from_secs(5), supervisor_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Supervisor task failed: {}", e),
        Err(_) => warn!("Supervisor loop did not exit after shutdown"),
    }

    result.map_err(|e| StratdError::Internal(e.to_string()))
}
