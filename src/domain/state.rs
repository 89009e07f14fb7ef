use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::market::Candle;

/// Trading-cycle phase of a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    /// Looking for an entry
    Entry,
    /// Position open, managing it
    Adjustment,
    /// Closing out the position
    Exit,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Entry => "ENTRY",
            Phase::Adjustment => "ADJUSTMENT",
            Phase::Exit => "EXIT",
        }
    }

    /// Next phase in the cycle
    pub fn next(&self) -> Phase {
        match self {
            Phase::Entry => Phase::Adjustment,
            Phase::Adjustment => Phase::Exit,
            Phase::Exit => Phase::Entry,
        }
    }

    /// Check if this phase can transition to another phase.
    /// Staying in the same phase is not a transition and is always allowed.
    pub fn can_transition_to(&self, target: Phase) -> bool {
        *self == target || self.next() == target
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Phase {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "ENTRY" => Ok(Phase::Entry),
            "ADJUSTMENT" => Ok(Phase::Adjustment),
            "EXIT" => Ok(Phase::Exit),
            _ => Err(format!("Unknown phase: {}", s)),
        }
    }
}

/// Resumable progress inside one phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub step: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl PhaseState {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: at,
            step: 0,
            payload: serde_json::Value::Null,
        }
    }
}

/// Live execution record of one strategy, keyed by strategy id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub strategy_id: String,
    pub is_running: bool,
    pub current_phase: Phase,
    /// Opaque reference to the active worker
    pub worker_handle_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub phase_states: BTreeMap<Phase, PhaseState>,
    pub last_processed_candle: Option<Candle>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub restart_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl RuntimeState {
    /// Fresh, stopped state as created the first time a strategy starts
    pub fn new(strategy_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            is_running: false,
            current_phase: Phase::Entry,
            worker_handle_id: None,
            last_heartbeat: now,
            phase_states: BTreeMap::new(),
            last_processed_candle: None,
            error_count: 0,
            last_error: None,
            restart_count: 0,
            updated_at: now,
        }
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_heartbeat)
    }

    /// Apply a partial update. Returns `(from, to)` when the phase changed.
    pub fn apply(&mut self, patch: &StatePatch) -> Option<(Phase, Phase)> {
        let mut transition = None;
        if let Some(phase) = patch.current_phase {
            if phase != self.current_phase {
                transition = Some((self.current_phase, phase));
                self.current_phase = phase;
            }
        }
        for (phase, state) in &patch.phase_states {
            self.phase_states.insert(*phase, state.clone());
        }
        if let Some(candle) = &patch.last_processed_candle {
            self.last_processed_candle = Some(candle.clone());
        }
        if let Some(err) = &patch.last_error {
            self.last_error = Some(err.clone());
        }
        transition
    }

    /// Fields compared between fast and durable copies
    pub fn consistency_signature(&self) -> (bool, Phase) {
        (self.is_running, self.current_phase)
    }
}

/// Partial state written by a worker's STATE_UPDATE
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(default)]
    pub current_phase: Option<Phase>,
    #[serde(default)]
    pub phase_states: BTreeMap<Phase, PhaseState>,
    #[serde(default)]
    pub last_processed_candle: Option<Candle>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl StatePatch {
    pub fn phase(phase: Phase) -> Self {
        Self {
            current_phase: Some(phase),
            ..Default::default()
        }
    }

    pub fn candle(candle: Candle) -> Self {
        Self {
            last_processed_candle: Some(candle),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current_phase.is_none()
            && self.phase_states.is_empty()
            && self.last_processed_candle.is_none()
            && self.last_error.is_none()
    }
}
