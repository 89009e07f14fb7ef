//! State Persistence Service
//!
//! Writes and reads a strategy's runtime state through the fast store and the
//! durable store. The durable store is the source of truth:
//! - writes go to the durable store first; a durable failure is returned to the caller
//! - a fast store failure only degrades latency and is logged
//! - reads try the fast store and fall back to the durable store, repopulating the cache

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{FastStoreConfig, PersistenceConfig};
use crate::domain::{AuditRecord, Candle, Phase, PhaseState, RuntimeState, StatePatch};
use crate::error::{Result, StratdError};
use crate::store::{state_key, strategy_id_from_key, DurableStore, FastStore, StateRecord, STATE_KEY_PREFIX};

/// Phase/progress injected into a worker that resumes previous work
#[derive(Debug, Clone, PartialEq)]
pub struct RunSeed {
    pub current_phase: Phase,
    pub phase_states: BTreeMap<Phase, PhaseState>,
    pub last_processed_candle: Option<Candle>,
}

impl RunSeed {
    pub fn from_state(state: &RuntimeState) -> Self {
        Self {
            current_phase: state.current_phase,
            phase_states: state.phase_states.clone(),
            last_processed_candle: state.last_processed_candle.clone(),
        }
    }
}

/// Parameters of the state written when a worker is launched
#[derive(Debug, Clone)]
pub struct RunInit {
    pub worker_handle_id: String,
    /// Resume from this progress instead of starting a fresh ENTRY phase
    pub seed: Option<RunSeed>,
    pub reset_errors: bool,
    pub bump_restart: bool,
}

/// Counts returned by `get_health_stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHealthStats {
    pub total: usize,
    pub running: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub stale: usize,
}

/// Result of cross-checking the fast store against the durable store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// False when the fast store could not be read; the counts then cover only what was reached
    pub fast_store_available: bool,
    pub checked: usize,
    pub consistent: usize,
    pub inconsistent: usize,
    pub missing_in_durable: usize,
    pub missing_in_fast: usize,
    pub inconsistent_ids: Vec<String>,
    pub missing_in_fast_ids: Vec<String>,
}

impl Default for ConsistencyReport {
    fn default() -> Self {
        Self {
            fast_store_available: true,
            checked: 0,
            consistent: 0,
            inconsistent: 0,
            missing_in_durable: 0,
            missing_in_fast: 0,
            inconsistent_ids: Vec::new(),
            missing_in_fast_ids: Vec::new(),
        }
    }
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.fast_store_available
            && self.inconsistent == 0
            && self.missing_in_durable == 0
            && self.missing_in_fast == 0
    }

    fn fast_store_unreachable(error: &StratdError) -> Self {
        warn!(error = %error, "fast store unreachable during consistency check");
        Self {
            fast_store_available: false,
            ..Self::default()
        }
    }
}

/// Result of a cache repair sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRepairReport {
    pub repopulated: usize,
    pub evicted: usize,
}

enum FastComparison {
    Consistent,
    Inconsistent,
    MissingInDurable,
    /// The entry expired or was evicted after the key scan
    Gone,
}

/// Dual-store runtime state persistence
pub struct StatePersistenceService {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    ttl: Duration,
    healthy_threshold: ChronoDuration,
    stale_threshold: ChronoDuration,
}

impl StatePersistenceService {
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
        fast_config: &FastStoreConfig,
        config: &PersistenceConfig,
    ) -> Self {
        Self {
            fast,
            durable,
            ttl: fast_config.ttl(),
            healthy_threshold: ChronoDuration::seconds(config.healthy_threshold_secs as i64),
            stale_threshold: ChronoDuration::seconds(config.stale_threshold_secs as i64),
        }
    }

    pub fn durable(&self) -> Arc<dyn DurableStore> {
        self.durable.clone()
    }

    // ==================== Writes ====================

    /// Merge a partial update into the stored state and stamp the heartbeat.
    ///
    /// A phase change must follow the ENTRY -> ADJUSTMENT -> EXIT -> ENTRY cycle
    /// and is recorded as a PHASE_CHANGED audit event.
    pub async fn save_state(&self, strategy_id: &str, patch: &StatePatch) -> Result<RuntimeState> {
        let now = Utc::now();
        let mut state = match self.durable.get_state(strategy_id).await? {
            Some(record) => record.into_state()?,
            None => RuntimeState::new(strategy_id, now),
        };

        if let Some(target) = patch.current_phase {
            if !state.current_phase.can_transition_to(target) {
                return Err(StratdError::InvalidPhaseTransition {
                    from: state.current_phase.to_string(),
                    to: target.to_string(),
                });
            }
        }

        let transition = state.apply(patch);
        state.last_heartbeat = now;
        state.updated_at = now;

        self.write_through(&state).await?;

        if let Some((from, to)) = transition {
            info!(strategy_id, %from, %to, "phase changed");
            self.audit(&AuditRecord::phase_changed(strategy_id, from, to))
                .await;
        }

        Ok(state)
    }

    /// Write the state of a freshly launched worker, preserving the restart counter.
    pub async fn initialize_run(&self, strategy_id: &str, init: RunInit) -> Result<RuntimeState> {
        let now = Utc::now();
        let previous = self.durable.get_state(strategy_id).await?;
        let (restart_count, error_count, last_error) = match &previous {
            Some(record) => (record.restart_count, record.error_count, record.last_error.clone()),
            None => (0, 0, None),
        };

        let mut state = RuntimeState::new(strategy_id, now);
        state.is_running = true;
        state.worker_handle_id = Some(init.worker_handle_id);
        state.restart_count = if init.bump_restart {
            restart_count.saturating_add(1)
        } else {
            restart_count
        };
        if !init.reset_errors {
            state.error_count = error_count;
            state.last_error = last_error;
        }

        match init.seed {
            Some(seed) => {
                state.current_phase = seed.current_phase;
                state.phase_states = seed.phase_states;
                state.last_processed_candle = seed.last_processed_candle;
            }
            None => {
                state
                    .phase_states
                    .insert(Phase::Entry, PhaseState::started(now));
            }
        }

        self.write_through(&state).await?;
        if let Some(record) = &previous {
            self.audit_phase_reset(strategy_id, &record.current_phase, state.current_phase)
                .await;
        }
        Ok(state)
    }

    /// Audit a phase moved by a launch or reset rather than by a worker update
    async fn audit_phase_reset(&self, strategy_id: &str, previous: &str, to: Phase) {
        let Ok(from) = Phase::try_from(previous) else {
            return;
        };
        if from != to {
            info!(strategy_id, %from, %to, "phase reset");
            self.audit(&AuditRecord::phase_changed(strategy_id, from, to))
                .await;
        }
    }

    /// Flip `is_running` off, stamp the heartbeat and evict the cached copy
    pub async fn mark_stopped(&self, strategy_id: &str) -> Result<()> {
        let found = self.durable.mark_stopped(strategy_id, Utc::now()).await?;
        if !found {
            debug!(strategy_id, "mark_stopped: no durable state");
        }
        self.cache_evict(strategy_id).await;
        Ok(())
    }

    /// Heartbeat-only update; never rewrites the rest of the durable row
    pub async fn update_heartbeat(&self, strategy_id: &str) -> Result<()> {
        let now = Utc::now();
        let found = self.durable.touch_heartbeat(strategy_id, now).await?;
        if !found {
            warn!(strategy_id, "heartbeat for strategy without durable state");
            return Ok(());
        }

        let key = state_key(strategy_id);
        match self.fast.get(&key).await {
            Ok(Some(json)) => match serde_json::from_str::<RuntimeState>(&json) {
                Ok(mut cached) => {
                    cached.last_heartbeat = now;
                    cached.updated_at = now;
                    self.cache_put(&cached).await;
                }
                Err(e) => {
                    warn!(strategy_id, error = %e, "unreadable cached state, evicting");
                    self.cache_evict(strategy_id).await;
                }
            },
            Ok(None) => {}
            Err(e) => warn!(strategy_id, error = %e, "fast store degraded on heartbeat"),
        }
        Ok(())
    }

    /// Count a worker fault against the strategy
    pub async fn record_error(&self, strategy_id: &str, message: &str) -> Result<RuntimeState> {
        let now = Utc::now();
        let mut state = match self.durable.get_state(strategy_id).await? {
            Some(record) => record.into_state()?,
            None => RuntimeState::new(strategy_id, now),
        };
        state.error_count = state.error_count.saturating_add(1);
        state.last_error = Some(message.to_string());
        state.updated_at = now;

        self.durable.upsert_state(&StateRecord::from_state(&state)?).await?;
        if state.is_running {
            self.cache_put(&state).await;
        }
        Ok(state)
    }

    /// Manual reset of counters and phase. Only valid while the strategy is stopped.
    pub async fn reset_state(&self, strategy_id: &str) -> Result<RuntimeState> {
        let now = Utc::now();
        let record = self
            .durable
            .get_state(strategy_id)
            .await?
            .ok_or_else(|| StratdError::StrategyNotFound(strategy_id.to_string()))?;
        if record.is_running {
            return Err(StratdError::AlreadyRunning(strategy_id.to_string()));
        }

        let state = RuntimeState::new(strategy_id, now);
        self.durable.upsert_state(&StateRecord::from_state(&state)?).await?;
        self.cache_evict(strategy_id).await;
        self.audit_phase_reset(strategy_id, &record.current_phase, state.current_phase)
            .await;
        info!(strategy_id, "runtime state reset");
        Ok(state)
    }

    pub async fn audit(&self, record: &AuditRecord) {
        if let Err(e) = self.durable.append_audit(record).await {
            warn!(
                strategy_id = %record.strategy_id,
                kind = %record.kind,
                error = %e,
                "failed to persist audit record"
            );
        }
    }

    pub async fn recent_audit(&self, strategy_id: &str, limit: usize) -> Result<Vec<AuditRecord>> {
        self.durable.list_audit(strategy_id, limit).await
    }

    // ==================== Reads ====================

    /// Cached state first, then the durable copy (which repopulates the cache)
    pub async fn load_state(&self, strategy_id: &str) -> Result<Option<RuntimeState>> {
        let key = state_key(strategy_id);
        match self.fast.get(&key).await {
            Ok(Some(json)) => match serde_json::from_str::<RuntimeState>(&json) {
                Ok(state) => return Ok(Some(state)),
                Err(e) => {
                    warn!(strategy_id, error = %e, "unreadable cached state, falling back to durable store");
                    self.cache_evict(strategy_id).await;
                }
            },
            Ok(None) => {}
            Err(e) => warn!(strategy_id, error = %e, "fast store degraded on read"),
        }

        match self.durable.get_state(strategy_id).await? {
            Some(record) => {
                let state = record.into_state()?;
                if state.is_running {
                    self.cache_put(&state).await;
                }
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Raw durable records marked running, for recovery to convert one at a time
    pub async fn running_records(&self) -> Result<Vec<StateRecord>> {
        self.durable.list_states(true).await
    }

    // ==================== Sweeps ====================

    /// Demote running states whose heartbeat is older than `max_age_minutes`.
    /// Idempotent: a second run finds nothing left to demote.
    pub async fn cleanup_stale_states(&self, max_age_minutes: i64) -> Result<usize> {
        let now = Utc::now();
        let cutoff = now - ChronoDuration::minutes(max_age_minutes);
        let demoted = self.durable.demote_stale(cutoff, now).await?;

        for strategy_id in &demoted {
            self.cache_evict(strategy_id).await;
        }

        if !demoted.is_empty() {
            info!(
                count = demoted.len(),
                max_age_minutes,
                "demoted stale runtime states: {:?}",
                demoted
            );
        }
        Ok(demoted.len())
    }

    pub async fn get_health_stats(&self) -> Result<StateHealthStats> {
        let records = self.durable.list_states(false).await?;
        Ok(self.classify(&records, Utc::now()))
    }

    fn classify(&self, records: &[StateRecord], now: DateTime<Utc>) -> StateHealthStats {
        let mut stats = StateHealthStats {
            total: records.len(),
            ..Default::default()
        };

        for record in records.iter().filter(|r| r.is_running) {
            stats.running += 1;
            let age = now.signed_duration_since(record.last_heartbeat);
            if age < self.healthy_threshold {
                stats.healthy += 1;
            } else {
                stats.unhealthy += 1;
            }
            if age > self.stale_threshold {
                stats.stale += 1;
            }
        }
        stats
    }

    /// Cross-check cached entries against the durable store on `(is_running, current_phase)`.
    ///
    /// An unreachable fast store yields a report flagged `fast_store_available: false`
    /// instead of an error; durable store failures still propagate.
    pub async fn validate_state_consistency(&self) -> Result<ConsistencyReport> {
        let keys = match self.fast.keys(STATE_KEY_PREFIX).await {
            Ok(keys) => keys,
            Err(e @ StratdError::FastStore(_)) => {
                return Ok(ConsistencyReport::fast_store_unreachable(&e))
            }
            Err(e) => return Err(e),
        };
        let mut report = ConsistencyReport::default();
        let mut cached_ids = HashSet::new();

        for key in keys {
            let Some(strategy_id) = strategy_id_from_key(&key) else {
                continue;
            };

            let comparison = match self.compare_cached(strategy_id).await {
                Ok(comparison) => comparison,
                Err(e @ StratdError::FastStore(_)) => {
                    return Ok(ConsistencyReport::fast_store_unreachable(&e))
                }
                Err(e) => return Err(e),
            };
            if let FastComparison::Gone = comparison {
                continue;
            }
            cached_ids.insert(strategy_id.to_string());
            report.checked += 1;

            match comparison {
                FastComparison::Consistent => report.consistent += 1,
                FastComparison::Inconsistent => {
                    report.inconsistent += 1;
                    report.inconsistent_ids.push(strategy_id.to_string());
                }
                FastComparison::MissingInDurable => report.missing_in_durable += 1,
                FastComparison::Gone => {}
            }
        }

        for record in self.durable.list_states(true).await? {
            if !cached_ids.contains(&record.strategy_id) {
                report.missing_in_fast += 1;
                report.missing_in_fast_ids.push(record.strategy_id);
            }
        }

        report.inconsistent_ids.sort();
        report.missing_in_fast_ids.sort();
        Ok(report)
    }

    /// Read-repair: evict cache entries that disagree with the durable store and
    /// repopulate running states missing from the cache.
    pub async fn repair_cache(&self) -> Result<CacheRepairReport> {
        let mut report = CacheRepairReport::default();
        let mut cached_ids = HashSet::new();

        for key in self.fast.keys(STATE_KEY_PREFIX).await? {
            let Some(strategy_id) = strategy_id_from_key(&key) else {
                continue;
            };
            match self.compare_cached(strategy_id).await? {
                FastComparison::Consistent => {
                    cached_ids.insert(strategy_id.to_string());
                }
                FastComparison::Inconsistent | FastComparison::MissingInDurable => {
                    self.cache_evict(strategy_id).await;
                    report.evicted += 1;
                }
                FastComparison::Gone => {}
            }
        }

        for record in self.durable.list_states(true).await? {
            if cached_ids.contains(&record.strategy_id) {
                continue;
            }
            let strategy_id = record.strategy_id.clone();
            match record.into_state() {
                Ok(state) => {
                    self.cache_put(&state).await;
                    report.repopulated += 1;
                }
                Err(e) => warn!(strategy_id = %strategy_id, error = %e, "skipping corrupt state during cache repair"),
            }
        }

        if report.evicted > 0 || report.repopulated > 0 {
            info!(
                evicted = report.evicted,
                repopulated = report.repopulated,
                "fast store repaired from durable store"
            );
        }
        Ok(report)
    }

    async fn compare_cached(&self, strategy_id: &str) -> Result<FastComparison> {
        let cached = match self.fast.get(&state_key(strategy_id)).await? {
            Some(json) => serde_json::from_str::<RuntimeState>(&json).ok(),
            None => return Ok(FastComparison::Gone),
        };
        let Some(record) = self.durable.get_state(strategy_id).await? else {
            return Ok(FastComparison::MissingInDurable);
        };
        let durable = record.into_state().ok();

        let agrees = match (cached, durable) {
            (Some(c), Some(d)) => c.consistency_signature() == d.consistency_signature(),
            _ => false,
        };
        Ok(if agrees {
            FastComparison::Consistent
        } else {
            FastComparison::Inconsistent
        })
    }

    // ==================== Store plumbing ====================

    async fn write_through(&self, state: &RuntimeState) -> Result<()> {
        self.durable
            .upsert_state(&StateRecord::from_state(state)?)
            .await?;
        self.cache_put(state).await;
        Ok(())
    }

    async fn cache_put(&self, state: &RuntimeState) {
        let json = match serde_json::to_string(state) {
            Ok(json) => json,
            Err(e) => {
                warn!(strategy_id = %state.strategy_id, error = %e, "failed to serialize state for cache");
                return;
            }
        };
        if let Err(e) = self
            .fast
            .set_ex(&state_key(&state.strategy_id), json, self.ttl)
            .await
        {
            warn!(strategy_id = %state.strategy_id, error = %e, "fast store degraded, durable copy written");
        }
    }

    async fn cache_evict(&self, strategy_id: &str) {
        if let Err(e) = self.fast.del(&state_key(strategy_id)).await {
            warn!(strategy_id, error = %e, "failed to evict cached state");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::AuditKind;
    use crate::store::{MemoryDurableStore, MemoryFastStore};
    use async_trait::async_trait;

    /// Fast store that is always down
    pub(crate) struct DownFastStore;

    #[async_trait]
    impl FastStore for DownFastStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(StratdError::FastStore("connection refused".into()))
        }
        async fn set_ex(&self, _key: &str, _value: String, _ttl: Duration) -> Result<()> {
            Err(StratdError::FastStore("connection refused".into()))
        }
        async fn del(&self, _key: &str) -> Result<()> {
            Err(StratdError::FastStore("connection refused".into()))
        }
        async fn keys(&self, _prefix: &str) -> Result<Vec<String>> {
            Err(StratdError::FastStore("connection refused".into()))
        }
    }

    /// Fast store whose key scan reports an entry that has already expired
    struct VanishingFastStore {
        inner: MemoryFastStore,
        ghost: String,
    }

    #[async_trait]
    impl FastStore for VanishingFastStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }
        async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
            self.inner.set_ex(key, value, ttl).await
        }
        async fn del(&self, key: &str) -> Result<()> {
            self.inner.del(key).await
        }
        async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
            let mut keys = self.inner.keys(prefix).await?;
            keys.push(self.ghost.clone());
            Ok(keys)
        }
    }

    pub(crate) fn service_with(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
    ) -> StatePersistenceService {
        StatePersistenceService::new(
            fast,
            durable,
            &FastStoreConfig::default(),
            &PersistenceConfig::default(),
        )
    }

    fn fresh() -> (StatePersistenceService, MemoryFastStore, MemoryDurableStore) {
        let fast = MemoryFastStore::new();
        let durable = MemoryDurableStore::new();
        let service = service_with(Arc::new(fast.clone()), Arc::new(durable.clone()));
        (service, fast, durable)
    }

    fn init(worker: &str) -> RunInit {
        RunInit {
            worker_handle_id: worker.to_string(),
            seed: None,
            reset_errors: true,
            bump_restart: false,
        }
    }

    async fn put_running(durable: &MemoryDurableStore, id: &str, heartbeat_age_minutes: i64) {
        let mut state = RuntimeState::new(id, Utc::now() - ChronoDuration::minutes(heartbeat_age_minutes));
        state.is_running = true;
        state.worker_handle_id = Some(format!("worker-{}", id));
        durable
            .upsert_state(&StateRecord::from_state(&state).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_save_then_load_from_cache() {
        let (service, fast, _) = fresh();
        service.initialize_run("s1", init("w1")).await.unwrap();

        let saved = service
            .save_state("s1", &StatePatch::phase(Phase::Adjustment))
            .await
            .unwrap();
        assert_eq!(saved.current_phase, Phase::Adjustment);
        assert!(fast.get(&state_key("s1")).await.unwrap().is_some());

        let loaded = service.load_state("s1").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
    }

    #[tokio::test]
    async fn test_load_falls_back_to_durable_and_repopulates() {
        let (service, fast, _) = fresh();
        let started = service.initialize_run("s1", init("w1")).await.unwrap();
        fast.del(&state_key("s1")).await.unwrap();

        let loaded = service.load_state("s1").await.unwrap().unwrap();
        assert_eq!(loaded.worker_handle_id, started.worker_handle_id);
        assert_eq!(loaded.last_heartbeat, started.last_heartbeat);
        assert!(fast.get(&state_key("s1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fast_store_outage_is_not_fatal() {
        let durable = MemoryDurableStore::new();
        let service = service_with(Arc::new(DownFastStore), Arc::new(durable.clone()));

        service.initialize_run("s1", init("w1")).await.unwrap();
        service
            .save_state("s1", &StatePatch::phase(Phase::Adjustment))
            .await
            .unwrap();
        service.update_heartbeat("s1").await.unwrap();

        let loaded = service.load_state("s1").await.unwrap().unwrap();
        assert_eq!(loaded.current_phase, Phase::Adjustment);
        assert!(loaded.is_running);
    }

    #[tokio::test]
    async fn test_invalid_phase_transition_is_rejected() {
        let (service, _, durable) = fresh();
        service.initialize_run("s1", init("w1")).await.unwrap();

        let err = service
            .save_state("s1", &StatePatch::phase(Phase::Exit))
            .await
            .unwrap_err();
        assert!(matches!(err, StratdError::InvalidPhaseTransition { .. }));
        assert_eq!(durable.audit_len().await, 0);

        service
            .save_state("s1", &StatePatch::phase(Phase::Adjustment))
            .await
            .unwrap();
        let audit = service.recent_audit("s1", 10).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].kind, AuditKind::PhaseChanged);
    }

    #[tokio::test]
    async fn test_relaunch_audits_phase_reset() {
        let (service, _, _) = fresh();
        service.initialize_run("s1", init("w1")).await.unwrap();
        service
            .save_state("s1", &StatePatch::phase(Phase::Adjustment))
            .await
            .unwrap();
        service.mark_stopped("s1").await.unwrap();

        let state = service.initialize_run("s1", init("w2")).await.unwrap();
        assert_eq!(state.current_phase, Phase::Entry);

        let audit = service.recent_audit("s1", 10).await.unwrap();
        let messages: Vec<&str> = audit
            .iter()
            .filter(|r| r.kind == AuditKind::PhaseChanged)
            .map(|r| r.message.as_str())
            .collect();
        assert!(messages.contains(&"ENTRY -> ADJUSTMENT"), "{:?}", messages);
        assert!(messages.contains(&"ADJUSTMENT -> ENTRY"), "{:?}", messages);

        // Relaunching from ENTRY is not a phase change
        service.mark_stopped("s1").await.unwrap();
        service.initialize_run("s1", init("w3")).await.unwrap();
        let after = service.recent_audit("s1", 10).await.unwrap();
        assert_eq!(
            after.iter().filter(|r| r.kind == AuditKind::PhaseChanged).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_reset_state_audits_phase_reset() {
        let (service, _, _) = fresh();
        service.initialize_run("s1", init("w1")).await.unwrap();
        service
            .save_state("s1", &StatePatch::phase(Phase::Adjustment))
            .await
            .unwrap();
        service.mark_stopped("s1").await.unwrap();

        service.reset_state("s1").await.unwrap();
        let audit = service.recent_audit("s1", 10).await.unwrap();
        assert!(audit
            .iter()
            .any(|r| r.kind == AuditKind::PhaseChanged && r.message == "ADJUSTMENT -> ENTRY"));
    }

    #[tokio::test]
    async fn test_mark_stopped_evicts_cache() {
        let (service, fast, durable) = fresh();
        service.initialize_run("s1", init("w1")).await.unwrap();
        service.mark_stopped("s1").await.unwrap();

        assert!(fast.get(&state_key("s1")).await.unwrap().is_none());
        let record = durable.get_state("s1").await.unwrap().unwrap();
        assert!(!record.is_running);
        assert!(record.worker_handle_id.is_none());
    }

    #[tokio::test]
    async fn test_initialize_run_preserves_restart_count() {
        let (service, _, _) = fresh();
        let first = service.initialize_run("s1", init("w1")).await.unwrap();
        assert_eq!(first.restart_count, 0);
        service.mark_stopped("s1").await.unwrap();

        let restarted = service
            .initialize_run(
                "s1",
                RunInit {
                    bump_restart: true,
                    ..init("w2")
                },
            )
            .await
            .unwrap();
        assert_eq!(restarted.restart_count, 1);
        service.mark_stopped("s1").await.unwrap();

        let fresh_start = service.initialize_run("s1", init("w3")).await.unwrap();
        assert_eq!(fresh_start.restart_count, 1);
        assert_eq!(fresh_start.current_phase, Phase::Entry);
        assert_eq!(fresh_start.error_count, 0);
    }

    #[tokio::test]
    async fn test_reset_only_when_stopped() {
        let (service, _, _) = fresh();
        service.initialize_run("s1", init("w1")).await.unwrap();
        service.record_error("s1", "boom").await.unwrap();

        assert!(matches!(
            service.reset_state("s1").await,
            Err(StratdError::AlreadyRunning(_))
        ));

        service.mark_stopped("s1").await.unwrap();
        let reset = service.reset_state("s1").await.unwrap();
        assert_eq!(reset.error_count, 0);
        assert_eq!(reset.restart_count, 0);
        assert!(reset.last_error.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_stale_states_is_idempotent() {
        let (service, _, durable) = fresh();
        put_running(&durable, "stale-a", 45).await;
        put_running(&durable, "stale-b", 120).await;
        put_running(&durable, "fresh", 1).await;

        assert_eq!(service.cleanup_stale_states(30).await.unwrap(), 2);
        assert_eq!(service.cleanup_stale_states(30).await.unwrap(), 0);

        let running = durable.list_states(true).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].strategy_id, "fresh");
    }

    #[tokio::test]
    async fn test_health_stats_thresholds_are_independent() {
        let (service, _, durable) = fresh();
        put_running(&durable, "healthy", 1).await;
        put_running(&durable, "lagging", 10).await;
        put_running(&durable, "stale", 45).await;
        durable
            .upsert_state(&StateRecord::from_state(&RuntimeState::new("stopped", Utc::now())).unwrap())
            .await
            .unwrap();

        let stats = service.get_health_stats().await.unwrap();
        assert_eq!(
            stats,
            StateHealthStats {
                total: 4,
                running: 3,
                healthy: 1,
                unhealthy: 2,
                stale: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_consistency_detects_diverged_cache() {
        let (service, fast, _) = fresh();
        service.initialize_run("s1", init("w1")).await.unwrap();
        service.initialize_run("s2", init("w2")).await.unwrap();

        let report = service.validate_state_consistency().await.unwrap();
        assert_eq!(report.consistent, 2);
        assert!(report.is_clean());

        // Diverge the cached phase of s1
        let key = state_key("s1");
        let mut cached: RuntimeState =
            serde_json::from_str(&fast.get(&key).await.unwrap().unwrap()).unwrap();
        cached.current_phase = Phase::Exit;
        fast.set_ex(&key, serde_json::to_string(&cached).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();
        fast.del(&state_key("s2")).await.unwrap();

        let report = service.validate_state_consistency().await.unwrap();
        assert_eq!(report.consistent, 0);
        assert_eq!(report.inconsistent, 1);
        assert_eq!(report.inconsistent_ids, vec!["s1".to_string()]);
        assert_eq!(report.missing_in_fast_ids, vec!["s2".to_string()]);

        let repaired = service.repair_cache().await.unwrap();
        assert_eq!(repaired, CacheRepairReport { repopulated: 2, evicted: 1 });
        assert!(service.validate_state_consistency().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_consistency_flags_unreachable_fast_store() {
        let durable = MemoryDurableStore::new();
        let service = service_with(Arc::new(DownFastStore), Arc::new(durable.clone()));
        put_running(&durable, "s1", 0).await;

        let report = service.validate_state_consistency().await.unwrap();
        assert!(!report.fast_store_available);
        assert!(!report.is_clean());
        assert_eq!(report.checked, 0);
        assert_eq!(report.missing_in_fast, 0);
    }

    #[tokio::test]
    async fn test_consistency_skips_entries_gone_after_scan() {
        let fast = MemoryFastStore::new();
        let durable = MemoryDurableStore::new();
        let vanishing = VanishingFastStore {
            inner: fast.clone(),
            ghost: state_key("s2"),
        };
        let service = service_with(Arc::new(vanishing), Arc::new(durable.clone()));
        service.initialize_run("s1", init("w1")).await.unwrap();
        put_running(&durable, "s2", 0).await;

        let report = service.validate_state_consistency().await.unwrap();
        assert!(report.fast_store_available);
        assert_eq!(report.checked, 1);
        assert_eq!(report.consistent, 1);
        assert_eq!(report.missing_in_fast_ids, vec!["s2".to_string()]);

        let repaired = service.repair_cache().await.unwrap();
        assert_eq!(repaired, CacheRepairReport { repopulated: 1, evicted: 0 });
        assert!(fast.get(&state_key("s2")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_durable_state_surfaces() {
        let (service, _, durable) = fresh();
        let mut record = StateRecord::from_state(&RuntimeState::new("s1", Utc::now())).unwrap();
        record.current_phase = "LIQUIDATE".into();
        durable.upsert_state(&record).await.unwrap();

        assert!(matches!(
            service.load_state("s1").await,
            Err(StratdError::StateCorruption { .. })
        ));
    }
}
