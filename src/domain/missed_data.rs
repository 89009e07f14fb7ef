use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::market::Timeframe;

/// Backfill processing status of a missed-data gap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MissedDataStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl MissedDataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissedDataStatus::Pending => "PENDING",
            MissedDataStatus::Processing => "PROCESSING",
            MissedDataStatus::Completed => "COMPLETED",
            MissedDataStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MissedDataStatus::Completed | MissedDataStatus::Failed)
    }
}

impl fmt::Display for MissedDataStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for MissedDataStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(MissedDataStatus::Pending),
            "PROCESSING" => Ok(MissedDataStatus::Processing),
            "COMPLETED" => Ok(MissedDataStatus::Completed),
            "FAILED" => Ok(MissedDataStatus::Failed),
            _ => Err(format!("Unknown missed data status: {}", s)),
        }
    }
}

/// A time window during which a strategy was not consuming market data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissedDataRecord {
    pub id: Uuid,
    pub strategy_id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub gap_start: DateTime<Utc>,
    pub gap_end: DateTime<Utc>,
    pub candles_count: u32,
    pub status: MissedDataStatus,
    pub retry_count: u32,
    /// Gap too large for synchronous backfill
    pub requires_attention: bool,
    pub result_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MissedDataRecord {
    pub fn new(
        strategy_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        gap_start: DateTime<Utc>,
        gap_end: DateTime<Utc>,
        requires_attention: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            strategy_id: strategy_id.to_string(),
            symbol: symbol.to_string(),
            timeframe,
            gap_start,
            gap_end,
            candles_count: timeframe.candles_in(gap_end - gap_start),
            status: MissedDataStatus::Pending,
            retry_count: 0,
            requires_attention,
            result_summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn gap(&self) -> Duration {
        self.gap_end - self.gap_start
    }

    pub fn gap_minutes(&self) -> i64 {
        self.gap().num_minutes()
    }
}
