//! State Store Adapter
//!
//! Two storage interfaces with different durability characteristics:
//! - `FastStore`: low-latency key/value cache with per-entry TTL (redis-shaped)
//! - `DurableStore`: authoritative relational store for runtime state,
//!   missed-data records and the audit trail
//!
//! Concrete backends:
//! - `memory::MemoryFastStore` (dashmap, in-process)
//! - `memory::MemoryDurableStore` (dry-run and tests)
//! - `postgres::PgDurableStore` (sqlx)

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    AuditRecord, Candle, MissedDataRecord, MissedDataStatus, Phase, PhaseState, RuntimeState,
};
use crate::error::{Result, StratdError};

pub use memory::{MemoryDurableStore, MemoryFastStore};
pub use postgres::PgDurableStore;

/// Key prefix for runtime state entries in the fast store
pub const STATE_KEY_PREFIX: &str = "strategy:state:";

pub fn state_key(strategy_id: &str) -> String {
    format!("{}{}", STATE_KEY_PREFIX, strategy_id)
}

pub fn strategy_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(STATE_KEY_PREFIX)
}

/// Expiring key/value cache
#[async_trait]
pub trait FastStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Live (non-expired) keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Store of record
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn upsert_state(&self, record: &StateRecord) -> Result<()>;

    async fn get_state(&self, strategy_id: &str) -> Result<Option<StateRecord>>;

    async fn list_states(&self, running_only: bool) -> Result<Vec<StateRecord>>;

    /// Update only the heartbeat timestamp. Returns false if no row exists.
    async fn touch_heartbeat(&self, strategy_id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Flip `is_running` off, clear the worker reference and stamp the heartbeat.
    async fn mark_stopped(&self, strategy_id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Bulk conditional demotion of running rows whose heartbeat is older than
    /// `cutoff`. Returns the ids that were demoted.
    async fn demote_stale(&self, cutoff: DateTime<Utc>, at: DateTime<Utc>) -> Result<Vec<String>>;

    async fn insert_missed_data(&self, record: &MissedDataRecord) -> Result<()>;

    async fn update_missed_data(&self, record: &MissedDataRecord) -> Result<()>;

    async fn get_missed_data(&self, id: Uuid) -> Result<Option<MissedDataRecord>>;

    async fn list_missed_data(
        &self,
        status: Option<MissedDataStatus>,
    ) -> Result<Vec<MissedDataRecord>>;

    async fn append_audit(&self, record: &AuditRecord) -> Result<()>;

    async fn list_audit(&self, strategy_id: &str, limit: usize) -> Result<Vec<AuditRecord>>;
}

/// Durable row layout of a `RuntimeState`.
///
/// Phase and payload columns are kept in their stored form so that a
/// corrupted row surfaces as `StateCorruption` on conversion instead of
/// being coerced into a valid value.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    pub strategy_id: String,
    pub is_running: bool,
    pub current_phase: String,
    pub worker_handle_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub phase_states: serde_json::Value,
    pub last_processed_candle: Option<serde_json::Value>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub restart_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn from_state(state: &RuntimeState) -> Result<Self> {
        let last_processed_candle = match &state.last_processed_candle {
            Some(candle) => Some(serde_json::to_value(candle)?),
            None => None,
        };

        Ok(Self {
            strategy_id: state.strategy_id.clone(),
            is_running: state.is_running,
            current_phase: state.current_phase.as_str().to_string(),
            worker_handle_id: state.worker_handle_id.clone(),
            last_heartbeat: state.last_heartbeat,
            phase_states: serde_json::to_value(&state.phase_states)?,
            last_processed_candle,
            error_count: state.error_count,
            last_error: state.last_error.clone(),
            restart_count: state.restart_count,
            updated_at: state.updated_at,
        })
    }

    pub fn into_state(self) -> Result<RuntimeState> {
        let corrupt = |reason: String| StratdError::StateCorruption {
            strategy_id: self.strategy_id.clone(),
            reason,
        };

        let current_phase = Phase::try_from(self.current_phase.as_str()).map_err(corrupt)?;

        let phase_states: BTreeMap<Phase, PhaseState> = if self.phase_states.is_null() {
            BTreeMap::new()
        } else {
            serde_json::from_value(self.phase_states.clone())
                .map_err(|e| corrupt(format!("phase_states: {}", e)))?
        };

        let last_processed_candle: Option<Candle> = match &self.last_processed_candle {
            Some(value) if !value.is_null() => Some(
                serde_json::from_value(value.clone())
                    .map_err(|e| corrupt(format!("last_processed_candle: {}", e)))?,
            ),
            _ => None,
        };

        Ok(RuntimeState {
            strategy_id: self.strategy_id,
            is_running: self.is_running,
            current_phase,
            worker_handle_id: self.worker_handle_id,
            last_heartbeat: self.last_heartbeat,
            phase_states,
            last_processed_candle,
            error_count: self.error_count,
            last_error: self.last_error,
            restart_count: self.restart_count,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_key_roundtrip() {
        let key = state_key("ema-btc");
        assert_eq!(key, "strategy:state:ema-btc");
        assert_eq!(strategy_id_from_key(&key), Some("ema-btc"));
        assert_eq!(strategy_id_from_key("other:ema-btc"), None);
    }

    #[test]
    fn test_record_conversion_preserves_state() {
        let now = Utc::now();
        let mut state = RuntimeState::new("s1", now);
        state.current_phase = Phase::Adjustment;
        state.phase_states.insert(Phase::Adjustment, PhaseState::started(now));
        state.restart_count = 3;

        let record = StateRecord::from_state(&state).unwrap();
        assert_eq!(record.current_phase, "ADJUSTMENT");
        assert_eq!(record.into_state().unwrap(), state);
    }

    #[test]
    fn test_unknown_phase_is_corruption() {
        let state = RuntimeState::new("s1", Utc::now());
        let mut record = StateRecord::from_state(&state).unwrap();
        record.current_phase = "HEDGING".to_string();

        match record.into_state() {
            Err(StratdError::StateCorruption { strategy_id, .. }) => assert_eq!(strategy_id, "s1"),
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_payload_is_corruption() {
        let state = RuntimeState::new("s1", Utc::now());
        let mut record = StateRecord::from_state(&state).unwrap();
        record.phase_states = serde_json::json!({ "ENTRY": "not-an-object" });

        assert!(matches!(
            record.into_state(),
            Err(StratdError::StateCorruption { .. })
        ));
    }
}
