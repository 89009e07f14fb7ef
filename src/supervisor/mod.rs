//! Worker Supervisor
//!
//! - `supervisor`: the actor owning the worker pool, and its handle
//! - `worker_handle`: per-worker bookkeeping and stats
//! - `orders`: where ENTRY/EXIT/ADJUSTMENT signals are forwarded

mod command;
pub mod orders;
pub mod supervisor;
pub mod worker_handle;

pub use orders::{ChannelOrderSink, LoggingOrderSink, OrderSink, SignalIntent};
pub use supervisor::{Supervisor, SupervisorHandle};
pub use worker_handle::{WorkerInfo, WorkerStats};
