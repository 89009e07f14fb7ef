use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::Phase;

/// Kind of audit event recorded for a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    PhaseChanged,
    WorkerLog,
    WorkerStarted,
    WorkerStopped,
    WorkerFault,
    Recovered,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::PhaseChanged => "PHASE_CHANGED",
            AuditKind::WorkerLog => "WORKER_LOG",
            AuditKind::WorkerStarted => "WORKER_STARTED",
            AuditKind::WorkerStopped => "WORKER_STOPPED",
            AuditKind::WorkerFault => "WORKER_FAULT",
            AuditKind::Recovered => "RECOVERED",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for AuditKind {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "PHASE_CHANGED" => Ok(AuditKind::PhaseChanged),
            "WORKER_LOG" => Ok(AuditKind::WorkerLog),
            "WORKER_STARTED" => Ok(AuditKind::WorkerStarted),
            "WORKER_STOPPED" => Ok(AuditKind::WorkerStopped),
            "WORKER_FAULT" => Ok(AuditKind::WorkerFault),
            "RECOVERED" => Ok(AuditKind::Recovered),
            _ => Err(format!("Unknown audit kind: {}", s)),
        }
    }
}

/// Severity carried by worker log messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl TryFrom<&str> for LogLevel {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// Immutable audit trail entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub strategy_id: String,
    pub kind: AuditKind,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(strategy_id: &str, kind: AuditKind, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            kind,
            level,
            message: message.into(),
            data: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn phase_changed(strategy_id: &str, from: Phase, to: Phase) -> Self {
        Self::new(
            strategy_id,
            AuditKind::PhaseChanged,
            LogLevel::Info,
            format!("{} -> {}", from, to),
        )
        .with_data(serde_json::json!({ "from": from, "to": to }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::try_from("WARNING"), Ok(LogLevel::Warn));
        assert_eq!(LogLevel::try_from("error"), Ok(LogLevel::Error));
        assert_eq!(
            LogLevel::try_from("fatal"),
            Err("Unknown log level: fatal".to_string())
        );
    }
}
