//! Process-level coordination: signal handling and teardown ordering

pub mod shutdown;

pub use shutdown::{
    install_signal_handlers, GracefulShutdown, ShutdownConfig, ShutdownError, ShutdownPhase,
    ShutdownSignal,
};
