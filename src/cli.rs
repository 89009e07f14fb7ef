use clap::{Parser, Subcommand};

use crate::domain::MissedDataStatus;

#[derive(Parser)]
#[command(name = "stratd")]
#[command(version)]
#[command(about = "Strategy worker supervision and crash recovery runtime", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Use in-memory stores and log signals instead of forwarding them
    #[arg(short, long, env = "STRATD_DRY_RUN")]
    pub dry_run: bool,

    /// Config directory (default.toml plus $STRATD_ENV.toml)
    #[arg(short, long, default_value = "config")]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Recover interrupted strategies and supervise workers until shutdown
    Run,
    /// Apply durable-store migrations
    Migrate,
    /// Demote running states whose heartbeat is older than the threshold
    CleanupStale {
        #[arg(long, default_value = "30")]
        max_age_minutes: i64,
    },
    /// Reset counters and phase of a stopped strategy
    ResetState {
        strategy_id: String,
    },
    /// List missed-data records
    MissedData {
        /// PENDING, PROCESSING, COMPLETED or FAILED
        #[arg(long, value_parser = parse_status)]
        status: Option<MissedDataStatus>,
    },
}

fn parse_status(s: &str) -> Result<MissedDataStatus, String> {
    MissedDataStatus::try_from(s)
}
