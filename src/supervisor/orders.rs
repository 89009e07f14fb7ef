//! Order-execution sink for worker signals

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::{Result, StratdError};
use crate::worker::{Signal, SignalKind};

/// Receives ENTRY/EXIT/ADJUSTMENT signals routed by the Supervisor
#[async_trait]
pub trait OrderSink: Send + Sync {
    async fn submit(&self, strategy_id: &str, kind: SignalKind, signal: &Signal) -> Result<()>;
}

/// Logs signals without forwarding them (dry run)
pub struct LoggingOrderSink;

#[async_trait]
impl OrderSink for LoggingOrderSink {
    async fn submit(&self, strategy_id: &str, kind: SignalKind, signal: &Signal) -> Result<()> {
        info!(
            strategy_id,
            kind = %kind,
            symbol = %signal.symbol,
            side = ?signal.side,
            price = %signal.price,
            reason = %signal.reason,
            "[DRY RUN] signal not forwarded"
        );
        Ok(())
    }
}

/// Signal queued for an external executor
#[derive(Debug, Clone)]
pub struct SignalIntent {
    pub strategy_id: String,
    pub kind: SignalKind,
    pub signal: Signal,
    pub received_at: DateTime<Utc>,
}

/// Forwards signals over a channel to an executor running elsewhere
#[derive(Clone)]
pub struct ChannelOrderSink {
    tx: mpsc::Sender<SignalIntent>,
}

impl ChannelOrderSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SignalIntent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl OrderSink for ChannelOrderSink {
    async fn submit(&self, strategy_id: &str, kind: SignalKind, signal: &Signal) -> Result<()> {
        self.tx
            .send(SignalIntent {
                strategy_id: strategy_id.to_string(),
                kind,
                signal: signal.clone(),
                received_at: Utc::now(),
            })
            .await
            .map_err(|_| StratdError::ChannelClosed("order executor".into()))
    }
}
