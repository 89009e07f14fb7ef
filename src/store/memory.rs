//! In-process store backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DurableStore, FastStore, StateRecord};
use crate::domain::{AuditRecord, MissedDataRecord, MissedDataStatus};
use crate::error::{Result, StratdError};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// Expiring cache backed by a concurrent map. Expired entries are dropped lazily on access.
#[derive(Debug, Clone, Default)]
pub struct MemoryFastStore {
    entries: Arc<DashMap<String, CacheEntry>>,
}

impl MemoryFastStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl FastStore for MemoryFastStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().expires_at > now)
            .map(|e| e.key().clone())
            .collect())
    }
}

#[derive(Debug, Default)]
struct DurableTables {
    states: HashMap<String, StateRecord>,
    missed_data: HashMap<Uuid, MissedDataRecord>,
    audit: Vec<AuditRecord>,
}

/// Durable store kept in memory, for dry runs and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryDurableStore {
    tables: Arc<RwLock<DurableTables>>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn audit_len(&self) -> usize {
        self.tables.read().await.audit.len()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn upsert_state(&self, record: &StateRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .states
            .insert(record.strategy_id.clone(), record.clone());
        Ok(())
    }

    async fn get_state(&self, strategy_id: &str) -> Result<Option<StateRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.states.get(strategy_id).cloned())
    }

    async fn list_states(&self, running_only: bool) -> Result<Vec<StateRecord>> {
        let tables = self.tables.read().await;
        let mut states: Vec<StateRecord> = tables
            .states
            .values()
            .filter(|s| !running_only || s.is_running)
            .cloned()
            .collect();
        states.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));
        Ok(states)
    }

    async fn touch_heartbeat(&self, strategy_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.states.get_mut(strategy_id) {
            Some(record) => {
                record.last_heartbeat = at;
                record.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_stopped(&self, strategy_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.states.get_mut(strategy_id) {
            Some(record) => {
                record.is_running = false;
                record.worker_handle_id = None;
                record.last_heartbeat = at;
                record.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn demote_stale(&self, cutoff: DateTime<Utc>, at: DateTime<Utc>) -> Result<Vec<String>> {
        let mut tables = self.tables.write().await;
        let mut demoted = Vec::new();
        for record in tables.states.values_mut() {
            if record.is_running && record.last_heartbeat < cutoff {
                record.is_running = false;
                record.worker_handle_id = None;
                record.updated_at = at;
                demoted.push(record.strategy_id.clone());
            }
        }
        demoted.sort();
        Ok(demoted)
    }

    async fn insert_missed_data(&self, record: &MissedDataRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.missed_data.contains_key(&record.id) {
            return Err(StratdError::DurableStore(format!(
                "missed data record {} already exists",
                record.id
            )));
        }
        tables.missed_data.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_missed_data(&self, record: &MissedDataRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.missed_data.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StratdError::DurableStore(format!(
                "missed data record {} not found",
                record.id
            ))),
        }
    }

    async fn get_missed_data(&self, id: Uuid) -> Result<Option<MissedDataRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.missed_data.get(&id).cloned())
    }

    async fn list_missed_data(
        &self,
        status: Option<MissedDataStatus>,
    ) -> Result<Vec<MissedDataRecord>> {
        let tables = self.tables.read().await;
        let mut records: Vec<MissedDataRecord> = tables
            .missed_data
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        self.tables.write().await.audit.push(record.clone());
        Ok(())
    }

    async fn list_audit(&self, strategy_id: &str, limit: usize) -> Result<Vec<AuditRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .audit
            .iter()
            .rev()
            .filter(|r| r.strategy_id == strategy_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
