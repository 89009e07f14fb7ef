//! Worker <-> Supervisor messages

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::{LogLevel, StatePatch};

/// Message sent from a worker to the Supervisor.
///
/// On the wire: `{ "type", "strategyId", "workerId", "timestamp", "data" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "RawEnvelope", try_from = "RawEnvelope")]
pub struct WorkerEnvelope {
    pub strategy_id: String,
    /// Identity of the sending worker; stale workers are ignored
    pub worker_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub message: WorkerMessage,
}

impl WorkerEnvelope {
    pub fn new(strategy_id: &str, worker_id: Uuid, message: WorkerMessage) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            worker_id,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Decode an envelope from an out-of-process worker
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    strategy_id: String,
    worker_id: Uuid,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    data: serde_json::Value,
}

impl From<WorkerEnvelope> for RawEnvelope {
    fn from(envelope: WorkerEnvelope) -> Self {
        let kind = envelope.message.kind().to_string();
        let data = match envelope.message {
            WorkerMessage::EntrySignal(s)
            | WorkerMessage::ExitSignal(s)
            | WorkerMessage::AdjustmentSignal(s) => serde_json::to_value(s),
            WorkerMessage::StateUpdate(patch) => serde_json::to_value(patch),
            WorkerMessage::Log(entry) => serde_json::to_value(entry),
            WorkerMessage::Heartbeat | WorkerMessage::StopAck | WorkerMessage::Unknown => {
                Ok(serde_json::Value::Null)
            }
        }
        .unwrap_or(serde_json::Value::Null);

        Self {
            kind,
            strategy_id: envelope.strategy_id,
            worker_id: envelope.worker_id,
            timestamp: envelope.timestamp,
            data,
        }
    }
}

impl TryFrom<RawEnvelope> for WorkerEnvelope {
    type Error = serde_json::Error;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let message = match raw.kind.as_str() {
            "HEARTBEAT" => WorkerMessage::Heartbeat,
            "ENTRY_SIGNAL" => WorkerMessage::EntrySignal(serde_json::from_value(raw.data)?),
            "EXIT_SIGNAL" => WorkerMessage::ExitSignal(serde_json::from_value(raw.data)?),
            "ADJUSTMENT_SIGNAL" => {
                WorkerMessage::AdjustmentSignal(serde_json::from_value(raw.data)?)
            }
            "STATE_UPDATE" => WorkerMessage::StateUpdate(serde_json::from_value(raw.data)?),
            "LOG" => WorkerMessage::Log(serde_json::from_value(raw.data)?),
            "STOP_ACK" => WorkerMessage::StopAck,
            _ => WorkerMessage::Unknown,
        };

        Ok(Self {
            strategy_id: raw.strategy_id,
            worker_id: raw.worker_id,
            timestamp: raw.timestamp,
            message,
        })
    }
}

/// Typed worker message
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Heartbeat,
    EntrySignal(Signal),
    ExitSignal(Signal),
    AdjustmentSignal(Signal),
    StateUpdate(StatePatch),
    Log(LogEntry),
    StopAck,
    /// Any message type this build does not know about
    Unknown,
}

impl WorkerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Heartbeat => "HEARTBEAT",
            WorkerMessage::EntrySignal(_) => "ENTRY_SIGNAL",
            WorkerMessage::ExitSignal(_) => "EXIT_SIGNAL",
            WorkerMessage::AdjustmentSignal(_) => "ADJUSTMENT_SIGNAL",
            WorkerMessage::StateUpdate(_) => "STATE_UPDATE",
            WorkerMessage::Log(_) => "LOG",
            WorkerMessage::StopAck => "STOP_ACK",
            WorkerMessage::Unknown => "UNKNOWN",
        }
    }

    /// Signal kind and payload for order-bearing messages
    pub fn as_signal(&self) -> Option<(SignalKind, &Signal)> {
        match self {
            WorkerMessage::EntrySignal(s) => Some((SignalKind::Entry, s)),
            WorkerMessage::ExitSignal(s) => Some((SignalKind::Exit, s)),
            WorkerMessage::AdjustmentSignal(s) => Some((SignalKind::Adjustment, s)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    Entry,
    Exit,
    Adjustment,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Entry => write!(f, "ENTRY"),
            SignalKind::Exit => write!(f, "EXIT"),
            SignalKind::Adjustment => write!(f, "ADJUSTMENT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSide {
    Buy,
    Sell,
}

/// Trading intent emitted by a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: SignalSide,
    pub price: Decimal,
    #[serde(default)]
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// How a worker unit ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Runner returned normally
    Completed,
    /// Runner returned an error or panicked
    Failed(String),
    /// Forcibly terminated
    Killed,
}

impl WorkerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerOutcome::Completed => "completed",
            WorkerOutcome::Failed(_) => "failed",
            WorkerOutcome::Killed => "killed",
        }
    }
}

impl fmt::Display for WorkerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_wire_shape() {
        let envelope = WorkerEnvelope::new(
            "s1",
            Uuid::new_v4(),
            WorkerMessage::EntrySignal(Signal {
                symbol: "BTCUSDT".into(),
                side: SignalSide::Buy,
                price: dec!(64250.5),
                quantity: Some(dec!(0.01)),
                reason: "breakout".into(),
                metadata: serde_json::Value::Null,
            }),
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "ENTRY_SIGNAL");
        assert_eq!(value["strategyId"], "s1");
        assert_eq!(value["data"]["symbol"], "BTCUSDT");
    }

    #[test]
    fn test_unknown_type_decodes() {
        let json = format!(
            r#"{{"strategyId":"s1","workerId":"{}","timestamp":"2026-01-05T10:00:00Z","type":"REBALANCE","data":{{"x":1}}}}"#,
            Uuid::new_v4()
        );
        let envelope = WorkerEnvelope::from_json(&json).unwrap();
        assert_eq!(envelope.message, WorkerMessage::Unknown);
        assert_eq!(envelope.message.kind(), "UNKNOWN");
    }

    #[test]
    fn test_heartbeat_without_data() {
        let json = format!(
            r#"{{"strategyId":"s1","workerId":"{}","timestamp":"2026-01-05T10:00:00Z","type":"HEARTBEAT"}}"#,
            Uuid::new_v4()
        );
        let envelope = WorkerEnvelope::from_json(&json).unwrap();
        assert_eq!(envelope.message, WorkerMessage::Heartbeat);
    }
}
