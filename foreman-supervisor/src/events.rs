//! Error reporting and loop observation hooks

use crate::supervisor::Supervisor;
use crate::SupervisorError;
use tracing::{debug, error};

/// Receives errors the control loop recovered from
pub trait ErrorSink: Send + Sync {
    /// Report an error raised while `supervisor` was ticking
    fn report(&self, supervisor: &str, error: &SupervisorError);
}

/// Receives one event per completed tick
pub trait LoopObserver: Send + Sync {
    /// Called at the end of every tick, after the snapshot was persisted or its failure
    /// reported
    fn looped(&self, supervisor: &Supervisor);
}

/// Error sink that logs through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, supervisor: &str, error: &SupervisorError) {
        error!(supervisor, "Supervisor loop error: {}", error);
    }
}

/// Observer that logs a per-tick summary at debug level
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl LoopObserver for LogObserver {
    fn looped(&self, supervisor: &Supervisor) {
        debug!(
            supervisor = supervisor.name(),
            state = ?supervisor.state(),
            processes = supervisor.total_process_count(),
            "Supervisor looped"
        );
    }
}
