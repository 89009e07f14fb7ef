use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::domain::StrategyConfig;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dry_run: DryRunConfig,
    #[serde(default)]
    pub fast_store: FastStoreConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Health server port (default: 8080)
    #[serde(default)]
    pub health_port: Option<u16>,
    /// Static strategy catalog
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/stratd".to_string(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DryRunConfig {
    /// Keep durable state in memory and log signals instead of forwarding them
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FastStoreConfig {
    /// TTL of cached runtime state entries (default: 1 hour)
    pub ttl_secs: u64,
}

impl Default for FastStoreConfig {
    fn default() -> Self {
        Self { ttl_secs: 3600 }
    }
}

impl FastStoreConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Maximum concurrent workers
    pub max_workers: usize,
    /// Worker heartbeat period, also the sweep period
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeats before a worker is considered dead
    pub max_missed_heartbeats: u32,
    /// Grace period for a cooperative stop before the worker is killed
    pub stop_grace_ms: u64,
    /// Delay before the automatic restart after a worker fault
    pub restart_backoff_ms: u64,
    /// Automatic fault restarts stop once error_count reaches this
    pub max_consecutive_faults: u32,
    /// Capacity of the supervisor command and worker message channels
    pub channel_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_workers: 50,
            heartbeat_interval_ms: 30_000,
            max_missed_heartbeats: 3,
            stop_grace_ms: 5_000,
            restart_backoff_ms: 5_000,
            max_consecutive_faults: 5,
            channel_capacity: 1024,
        }
    }
}

impl SupervisorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which a worker is declared dead
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.max_missed_heartbeats.max(1)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}

/// Thresholds and sweep intervals of the state persistence service.
///
/// `healthy_threshold_secs` and `stale_threshold_secs` are deliberately
/// independent: the first drives health reporting, the second the stale
/// cleanup sweep.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Heartbeat age below which a running strategy counts as healthy (default: 5 min)
    pub healthy_threshold_secs: u64,
    /// Heartbeat age above which a running strategy counts as stale (default: 30 min)
    pub stale_threshold_secs: u64,
    /// Stale cleanup sweep interval
    pub cleanup_interval_secs: u64,
    /// Heartbeat age used by the periodic stale cleanup, in minutes
    pub cleanup_max_age_minutes: i64,
    /// Consistency audit sweep interval
    pub consistency_interval_secs: u64,
    /// Cache repair sweep interval
    pub cache_repair_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            healthy_threshold_secs: 300,
            stale_threshold_secs: 1800,
            cleanup_interval_secs: 300,
            cleanup_max_age_minutes: 30,
            consistency_interval_secs: 600,
            cache_repair_interval_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Gaps shorter than this need no backfill
    pub min_gap_minutes: i64,
    /// Gaps longer than this are flagged for background/manual attention
    pub large_gap_minutes: i64,
    /// Backfill attempts before a missed-data record is marked failed
    pub max_backfill_retries: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            min_gap_minutes: 5,
            large_gap_minutes: 60,
            max_backfill_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            .set_default("dry_run.enabled", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("STRATD_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (STRATD_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("STRATD")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Load a single explicit config file plus environment overrides
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()).required(true))
            .add_source(
                Environment::with_prefix("STRATD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// In-memory configuration for dry runs and tests
    pub fn default_config(dry_run: bool) -> Self {
        Self {
            database: DatabaseConfig::default(),
            dry_run: DryRunConfig { enabled: dry_run },
            fast_store: FastStoreConfig::default(),
            supervisor: SupervisorConfig::default(),
            persistence: PersistenceConfig::default(),
            recovery: RecoveryConfig::default(),
            logging: LoggingConfig::default(),
            health_port: Some(8080),
            strategies: Vec::new(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.supervisor.max_workers == 0 {
            errors.push("supervisor.max_workers must be positive".to_string());
        }

        if self.supervisor.heartbeat_interval_ms == 0 {
            errors.push("supervisor.heartbeat_interval_ms must be positive".to_string());
        }

        if self.supervisor.max_missed_heartbeats == 0 {
            errors.push("supervisor.max_missed_heartbeats must be positive".to_string());
        }

        if self.supervisor.channel_capacity == 0 {
            errors.push("supervisor.channel_capacity must be positive".to_string());
        }

        if self.fast_store.ttl_secs == 0 {
            errors.push("fast_store.ttl_secs must be positive".to_string());
        }

        if self.persistence.stale_threshold_secs <= self.persistence.healthy_threshold_secs {
            errors.push(
                "persistence.stale_threshold_secs should exceed healthy_threshold_secs".to_string(),
            );
        }

        if self.recovery.min_gap_minutes < 0 {
            errors.push("recovery.min_gap_minutes must not be negative".to_string());
        }

        if self.recovery.large_gap_minutes < self.recovery.min_gap_minutes {
            errors.push(
                "recovery.large_gap_minutes should not be below min_gap_minutes".to_string(),
            );
        }

        let mut seen = std::collections::HashSet::new();
        for strategy in &self.strategies {
            if !seen.insert(strategy.id.as_str()) {
                errors.push(format!("duplicate strategy id: {}", strategy.id));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
