use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{DurableStore, StateRecord};
use crate::domain::{AuditKind, AuditRecord, LogLevel, MissedDataRecord, MissedDataStatus, Timeframe};
use crate::error::{Result, StratdError};

/// PostgreSQL durable store
#[derive(Clone)]
pub struct PgDurableStore {
    pool: PgPool,
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn state_from_row(r: &PgRow) -> StateRecord {
    StateRecord {
        strategy_id: r.get("strategy_id"),
        is_running: r.get("is_running"),
        current_phase: r.get("current_phase"),
        worker_handle_id: r.get("worker_handle_id"),
        last_heartbeat: r.get("last_heartbeat"),
        phase_states: r.get("phase_states"),
        last_processed_candle: r.get("last_processed_candle"),
        error_count: to_u32(r.get("error_count")),
        last_error: r.get("last_error"),
        restart_count: to_u32(r.get("restart_count")),
        updated_at: r.get("updated_at"),
    }
}

fn missed_from_row(r: &PgRow) -> Result<MissedDataRecord> {
    let timeframe: String = r.get("timeframe");
    let status: String = r.get("status");
    Ok(MissedDataRecord {
        id: r.get("id"),
        strategy_id: r.get("strategy_id"),
        symbol: r.get("symbol"),
        timeframe: Timeframe::try_from(timeframe.as_str()).map_err(StratdError::DurableStore)?,
        gap_start: r.get("gap_start"),
        gap_end: r.get("gap_end"),
        candles_count: to_u32(r.get("candles_count")),
        status: MissedDataStatus::try_from(status.as_str()).map_err(StratdError::DurableStore)?,
        retry_count: to_u32(r.get("retry_count")),
        requires_attention: r.get("requires_attention"),
        result_summary: r.get("result_summary"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn audit_from_row(r: &PgRow) -> Result<AuditRecord> {
    let kind: String = r.get("kind");
    let level: String = r.get("level");
    Ok(AuditRecord {
        strategy_id: r.get("strategy_id"),
        kind: AuditKind::try_from(kind.as_str()).map_err(StratdError::DurableStore)?,
        level: LogLevel::try_from(level.as_str()).unwrap_or_default(),
        message: r.get("message"),
        data: r
            .get::<Option<serde_json::Value>, _>("data")
            .unwrap_or(serde_json::Value::Null),
        created_at: r.get("created_at"),
    })
}

const STATE_COLUMNS: &str = r#"
    strategy_id, is_running, current_phase, worker_handle_id, last_heartbeat,
    phase_states, last_processed_candle, error_count, last_error, restart_count, updated_at
"#;

const MISSED_COLUMNS: &str = r#"
    id, strategy_id, symbol, timeframe, gap_start, gap_end, candles_count, status,
    retry_count, requires_attention, result_summary, created_at, updated_at
"#;

impl PgDurableStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DurableStore for PgDurableStore {
    // ==================== Runtime state ====================

    #[instrument(skip(self, record), fields(strategy_id = %record.strategy_id))]
    async fn upsert_state(&self, record: &StateRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strategy_runtime_states (
                strategy_id, is_running, current_phase, worker_handle_id, last_heartbeat,
                phase_states, last_processed_candle, error_count, last_error, restart_count,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (strategy_id) DO UPDATE SET
                is_running = EXCLUDED.is_running,
                current_phase = EXCLUDED.current_phase,
                worker_handle_id = EXCLUDED.worker_handle_id,
                last_heartbeat = EXCLUDED.last_heartbeat,
                phase_states = EXCLUDED.phase_states,
                last_processed_candle = EXCLUDED.last_processed_candle,
                error_count = EXCLUDED.error_count,
                last_error = EXCLUDED.last_error,
                restart_count = EXCLUDED.restart_count,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.strategy_id)
        .bind(record.is_running)
        .bind(&record.current_phase)
        .bind(&record.worker_handle_id)
        .bind(record.last_heartbeat)
        .bind(&record.phase_states)
        .bind(&record.last_processed_candle)
        .bind(to_i32(record.error_count))
        .bind(&record.last_error)
        .bind(to_i32(record.restart_count))
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_state(&self, strategy_id: &str) -> Result<Option<StateRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM strategy_runtime_states WHERE strategy_id = $1",
            STATE_COLUMNS
        ))
        .bind(strategy_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(state_from_row))
    }

    async fn list_states(&self, running_only: bool) -> Result<Vec<StateRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM strategy_runtime_states
            WHERE ($1 = FALSE OR is_running = TRUE)
            ORDER BY strategy_id
            "#,
            STATE_COLUMNS
        ))
        .bind(running_only)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(state_from_row).collect())
    }

    async fn touch_heartbeat(&self, strategy_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE strategy_runtime_states
            SET last_heartbeat = $2, updated_at = $2
            WHERE strategy_id = $1
            "#,
        )
        .bind(strategy_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_stopped(&self, strategy_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE strategy_runtime_states
            SET is_running = FALSE, worker_handle_id = NULL, last_heartbeat = $2, updated_at = $2
            WHERE strategy_id = $1
            "#,
        )
        .bind(strategy_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn demote_stale(&self, cutoff: DateTime<Utc>, at: DateTime<Utc>) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            UPDATE strategy_runtime_states
            SET is_running = FALSE, worker_handle_id = NULL, updated_at = $2
            WHERE is_running = TRUE AND last_heartbeat < $1
            RETURNING strategy_id
            "#,
        )
        .bind(cutoff)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;

        let mut ids: Vec<String> = rows.iter().map(|r| r.get("strategy_id")).collect();
        ids.sort();
        debug!("Demoted {} stale runtime states", ids.len());
        Ok(ids)
    }

    // ==================== Missed data ====================

    async fn insert_missed_data(&self, record: &MissedDataRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO missed_data_records (
                id, strategy_id, symbol, timeframe, gap_start, gap_end, candles_count, status,
                retry_count, requires_attention, result_summary, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.id)
        .bind(&record.strategy_id)
        .bind(&record.symbol)
        .bind(record.timeframe.as_str())
        .bind(record.gap_start)
        .bind(record.gap_end)
        .bind(to_i32(record.candles_count))
        .bind(record.status.as_str())
        .bind(to_i32(record.retry_count))
        .bind(record.requires_attention)
        .bind(&record.result_summary)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_missed_data(&self, record: &MissedDataRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE missed_data_records
            SET status = $2, retry_count = $3, result_summary = $4,
                requires_attention = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(to_i32(record.retry_count))
        .bind(&record.result_summary)
        .bind(record.requires_attention)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StratdError::DurableStore(format!(
                "missed data record {} not found",
                record.id
            )));
        }
        Ok(())
    }

    async fn get_missed_data(&self, id: Uuid) -> Result<Option<MissedDataRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM missed_data_records WHERE id = $1",
            MISSED_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(missed_from_row).transpose()
    }

    async fn list_missed_data(
        &self,
        status: Option<MissedDataStatus>,
    ) -> Result<Vec<MissedDataRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM missed_data_records
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at ASC
            "#,
            MISSED_COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(missed_from_row).collect()
    }

    // ==================== Audit trail ====================

    async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strategy_audit_log (strategy_id, kind, level, message, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&record.strategy_id)
        .bind(record.kind.as_str())
        .bind(record.level.as_str())
        .bind(&record.message)
        .bind(&record.data)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_audit(&self, strategy_id: &str, limit: usize) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT strategy_id, kind, level, message, data, created_at
            FROM strategy_audit_log
            WHERE strategy_id = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(strategy_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(audit_from_row).collect()
    }
}
