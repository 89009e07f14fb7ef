//! Persistence Layer for Runtime State and Recovery
//!
//! - State persistence service over the fast and durable stores
//! - Missed-data tracker for post-recovery backfill
//! - Maintenance scheduler for the periodic store sweeps

pub mod maintenance;
pub mod missed_data;
pub mod state_service;

pub use maintenance::MaintenanceScheduler;
pub use missed_data::{MissedDataStats, MissedDataTracker};
pub use state_service::{
    CacheRepairReport, ConsistencyReport, RunInit, RunSeed, StateHealthStats,
    StatePersistenceService,
};
