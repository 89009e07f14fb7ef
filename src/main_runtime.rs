use std::sync::Arc;
use stratd::config::AppConfig;
use stratd::error::{Result, StratdError};
use stratd::store::{DurableStore, FastStore, MemoryDurableStore, MemoryFastStore, PgDurableStore};
use stratd::supervisor::{ChannelOrderSink, LoggingOrderSink, OrderSink};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Backing stores selected for this process
pub struct Stores {
    pub fast: Arc<dyn FastStore>,
    pub durable: Arc<dyn DurableStore>,
    /// Present unless running dry
    pub postgres: Option<PgDurableStore>,
}

/// Postgres as the store of record, or in-memory stores in dry-run mode
pub async fn open_stores(config: &AppConfig) -> Result<Stores> {
    if config.dry_run.enabled {
        warn!("[DRY RUN] using in-memory stores, nothing survives a restart");
        return Ok(Stores {
            fast: Arc::new(MemoryFastStore::new()),
            durable: Arc::new(MemoryDurableStore::new()),
            postgres: None,
        });
    }

    let postgres = open_postgres(config).await?;
    if let Err(e) = postgres.migrate().await {
        warn!("Database migration failed: {} - continuing with existing schema", e);
    }
    Ok(Stores {
        fast: Arc::new(MemoryFastStore::new()),
        durable: Arc::new(postgres.clone()),
        postgres: Some(postgres),
    })
}

pub async fn open_postgres(config: &AppConfig) -> Result<PgDurableStore> {
    if config.database.url.is_empty() {
        return Err(StratdError::InvalidState(
            "database.url is not configured (set STRATD_DATABASE__URL)".into(),
        ));
    }
    PgDurableStore::new(&config.database.url, config.database.max_connections).await
}

/// Order sink for the daemon. Live mode queues signals for an attached executor.
pub fn order_sink(config: &AppConfig) -> Arc<dyn OrderSink> {
    if config.dry_run.enabled {
        return Arc::new(LoggingOrderSink);
    }

    let (sink, mut rx) = ChannelOrderSink::new(config.supervisor.channel_capacity);
    tokio::spawn(async move {
        while let Some(intent) = rx.recv().await {
            info!(
                strategy_id = %intent.strategy_id,
                kind = %intent.kind,
                symbol = %intent.signal.symbol,
                side = ?intent.signal.side,
                price = %intent.signal.price,
                quantity = ?intent.signal.quantity,
                "signal queued for execution"
            );
        }
    });
    Arc::new(sink)
}

pub fn init_logging(json: bool) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stratd=debug,sqlx=warn"));

    let log_dir = std::env::var("STRATD_LOG_DIR")
        .or_else(|_| std::env::var("LOG_DIR"))
        .unwrap_or_else(|_| "/var/log/stratd".to_string());

    // `tracing_appender::rolling::daily` panics if it can't create the initial
    // log file, so writability is checked first.
    let file_layer = if std::fs::create_dir_all(&log_dir).is_ok() {
        let test_path = std::path::Path::new(&log_dir).join(".stratd_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(&log_dir, "stratd.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // Leaked so the writer lives as long as the process
                Box::leak(Box::new(guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                None
            }
        }
    } else {
        eprintln!(
            "Warning: Could not create log directory {}, file logging disabled",
            log_dir
        );
        None
    };

    let console_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(filter)
        .init();

    if file_logging_enabled {
        eprintln!("Logging to: {}/stratd.log", log_dir);
    }
}

pub fn init_logging_simple() {
    // Minimal logging for one-shot commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
