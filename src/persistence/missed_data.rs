//! Missed-Data Tracker
//!
//! Records time gaps during which a strategy was not consuming market data and
//! drives each record through PENDING -> PROCESSING -> COMPLETED | FAILED for an
//! external backfill process. Failed attempts go back to PENDING until
//! `max_backfill_retries` is reached.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RecoveryConfig;
use crate::domain::{MissedDataRecord, MissedDataStatus, Timeframe};
use crate::error::{Result, StratdError};
use crate::store::DurableStore;

/// Counts per status, plus how many records need manual attention
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedDataStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub requires_attention: usize,
}

impl MissedDataStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

pub struct MissedDataTracker {
    durable: Arc<dyn DurableStore>,
    min_gap: Duration,
    large_gap: Duration,
    max_retries: u32,
}

impl MissedDataTracker {
    pub fn new(durable: Arc<dyn DurableStore>, config: &RecoveryConfig) -> Self {
        Self {
            durable,
            min_gap: Duration::minutes(config.min_gap_minutes),
            large_gap: Duration::minutes(config.large_gap_minutes),
            max_retries: config.max_backfill_retries,
        }
    }

    /// Record a gap if it is long enough to matter.
    ///
    /// Returns `None` for gaps below the minimum threshold. Gaps above the large
    /// threshold are flagged `requires_attention`.
    pub async fn record_gap(
        &self,
        strategy_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        gap_start: DateTime<Utc>,
        gap_end: DateTime<Utc>,
    ) -> Result<Option<MissedDataRecord>> {
        let gap = gap_end - gap_start;
        if gap < self.min_gap {
            debug!(strategy_id, gap_minutes = gap.num_minutes(), "gap below threshold, no backfill");
            return Ok(None);
        }

        let requires_attention = gap > self.large_gap;
        let record = MissedDataRecord::new(
            strategy_id,
            symbol,
            timeframe,
            gap_start,
            gap_end,
            requires_attention,
        );
        self.durable.insert_missed_data(&record).await?;

        if requires_attention {
            warn!(
                strategy_id,
                record_id = %record.id,
                gap_minutes = record.gap_minutes(),
                candles = record.candles_count,
                "large data gap flagged for background backfill"
            );
        } else {
            info!(
                strategy_id,
                record_id = %record.id,
                gap_minutes = record.gap_minutes(),
                candles = record.candles_count,
                "missed data recorded"
            );
        }
        Ok(Some(record))
    }

    /// Claim the oldest PENDING record for processing
    pub async fn claim_next(&self) -> Result<Option<MissedDataRecord>> {
        let pending = self
            .durable
            .list_missed_data(Some(MissedDataStatus::Pending))
            .await?;
        let Some(mut record) = pending.into_iter().next() else {
            return Ok(None);
        };

        record.status = MissedDataStatus::Processing;
        record.updated_at = Utc::now();
        self.durable.update_missed_data(&record).await?;
        debug!(record_id = %record.id, strategy_id = %record.strategy_id, "missed data claimed");
        Ok(Some(record))
    }

    pub async fn complete(&self, id: Uuid, summary: &str) -> Result<MissedDataRecord> {
        let mut record = self.processing(id).await?;
        record.status = MissedDataStatus::Completed;
        record.result_summary = Some(summary.to_string());
        record.updated_at = Utc::now();
        self.durable.update_missed_data(&record).await?;

        info!(record_id = %id, strategy_id = %record.strategy_id, "backfill completed: {}", summary);
        Ok(record)
    }

    /// Count a failed attempt; FAILED once the retry budget is spent, else back to PENDING
    pub async fn fail(&self, id: Uuid, error: &str) -> Result<MissedDataRecord> {
        let mut record = self.processing(id).await?;
        record.retry_count = record.retry_count.saturating_add(1);
        record.result_summary = Some(error.to_string());
        record.updated_at = Utc::now();
        record.status = if record.retry_count >= self.max_retries {
            MissedDataStatus::Failed
        } else {
            MissedDataStatus::Pending
        };
        self.durable.update_missed_data(&record).await?;

        if record.status == MissedDataStatus::Failed {
            warn!(
                record_id = %id,
                strategy_id = %record.strategy_id,
                retries = record.retry_count,
                "backfill permanently failed: {}",
                error
            );
        } else {
            debug!(record_id = %id, retries = record.retry_count, "backfill attempt failed: {}", error);
        }
        Ok(record)
    }

    pub async fn pending(&self) -> Result<Vec<MissedDataRecord>> {
        self.durable
            .list_missed_data(Some(MissedDataStatus::Pending))
            .await
    }

    pub async fn list(&self, status: Option<MissedDataStatus>) -> Result<Vec<MissedDataRecord>> {
        self.durable.list_missed_data(status).await
    }

    pub async fn stats(&self) -> Result<MissedDataStats> {
        let mut stats = MissedDataStats::default();
        for record in self.durable.list_missed_data(None).await? {
            match record.status {
                MissedDataStatus::Pending => stats.pending += 1,
                MissedDataStatus::Processing => stats.processing += 1,
                MissedDataStatus::Completed => stats.completed += 1,
                MissedDataStatus::Failed => stats.failed += 1,
            }
            if record.requires_attention && !record.status.is_terminal() {
                stats.requires_attention += 1;
            }
        }
        Ok(stats)
    }

    async fn processing(&self, id: Uuid) -> Result<MissedDataRecord> {
        let record = self
            .durable
            .get_missed_data(id)
            .await?
            .ok_or_else(|| StratdError::InvalidState(format!("missed data record {} not found", id)))?;
        if record.status != MissedDataStatus::Processing {
            return Err(StratdError::InvalidState(format!(
                "missed data record {} is {}, expected PROCESSING",
                id, record.status
            )));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDurableStore;

    fn tracker(max_retries: u32) -> MissedDataTracker {
        let config = RecoveryConfig {
            max_backfill_retries: max_retries,
            ..RecoveryConfig::default()
        };
        MissedDataTracker::new(Arc::new(MemoryDurableStore::new()), &config)
    }

    #[tokio::test]
    async fn test_gap_thresholds() {
        let tracker = tracker(3);
        let end = Utc::now();

        let small = tracker
            .record_gap("s1", "BTCUSDT", Timeframe::M5, end - Duration::minutes(4), end)
            .await
            .unwrap();
        assert!(small.is_none());

        let medium = tracker
            .record_gap("s1", "BTCUSDT", Timeframe::M5, end - Duration::minutes(30), end)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(medium.candles_count, 6);
        assert!(!medium.requires_attention);

        let large = tracker
            .record_gap("s1", "BTCUSDT", Timeframe::M5, end - Duration::minutes(90), end)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(large.candles_count, 18);
        assert!(large.requires_attention);

        let stats = tracker.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.requires_attention, 1);
    }

    #[tokio::test]
    async fn test_retry_until_failed() {
        let tracker = tracker(2);
        let end = Utc::now();
        tracker
            .record_gap("s1", "ETHUSDT", Timeframe::M15, end - Duration::minutes(45), end)
            .await
            .unwrap();

        let claimed = tracker.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.status, MissedDataStatus::Processing);
        assert!(tracker.claim_next().await.unwrap().is_none());

        let retried = tracker.fail(claimed.id, "exchange timeout").await.unwrap();
        assert_eq!(retried.status, MissedDataStatus::Pending);
        assert_eq!(retried.retry_count, 1);

        let claimed = tracker.claim_next().await.unwrap().unwrap();
        let failed = tracker.fail(claimed.id, "exchange timeout").await.unwrap();
        assert_eq!(failed.status, MissedDataStatus::Failed);
        assert!(tracker.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_requires_processing() {
        let tracker = tracker(3);
        let end = Utc::now();
        let record = tracker
            .record_gap("s1", "ETHUSDT", Timeframe::M1, end - Duration::minutes(10), end)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(
            tracker.complete(record.id, "done").await,
            Err(StratdError::InvalidState(_))
        ));

        tracker.claim_next().await.unwrap();
        let done = tracker.complete(record.id, "10 candles replayed").await.unwrap();
        assert_eq!(done.status, MissedDataStatus::Completed);
        assert_eq!(tracker.stats().await.unwrap().completed, 1);
    }
}
