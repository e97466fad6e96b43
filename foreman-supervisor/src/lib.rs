//! Foreman Supervisor - process pools and the control loop for queue workers
//!
//! A [`Supervisor`] keeps a configurable number of worker processes running against one
//! or more queues. Operators steer it through commands queued in a
//! [`CommandQueue`](foreman_core::queue::CommandQueue) or through OS signals, and it
//! reports its live state to a
//! [`SupervisorRepository`](foreman_core::repository::SupervisorRepository) every tick.
//!
//! ## Balancing modes
//!
//! - `off`: one pool consumes the whole queue list
//! - `simple`: one pool per queue, processes split evenly
//! - `auto`: one pool per queue, sized by the [`AutoScaler`] from queue load
//!
//! ## Example
//!
//! ```rust,no_run
//! use foreman_core::options::{Balance, SupervisorOptions};
//! use foreman_supervisor::Supervisor;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = SupervisorOptions::new("email", ["high", "low"])
//!         .with_balance(Balance::Auto)
//!         .with_max_processes(10);
//!
//!     let supervisor = Supervisor::builder(options).build().await?;
//!     let status = supervisor.monitor().await?;
//!     std::process::exit(status);
//! }
//! ```

mod autoscaler;
mod control;
mod counter;
mod error;
mod events;
mod pool;
mod process;
mod supervisor;

pub use autoscaler::{AutoScaler, PoolState};
pub use control::{
    ControlAction, ControlHandle, OsSignal, SignalResponse, SignalRouter, Ticker,
    listen_for_signals,
};
pub use counter::{ProcfsCounter, SystemProcessCounter, claims_supervisor, count_worker_trees};
pub use error::{Result, SupervisorError};
pub use events::{ErrorSink, LogErrorSink, LogObserver, LoopObserver};
pub use pool::ProcessPool;
pub use process::{
    CommandLauncher, FAILED_RESTART_COOLDOWN, OsWorker, OutputSink, OutputStream,
    ProcessStatus, RESTART_COOLDOWN, WorkerChild, WorkerLauncher, WorkerOutput, WorkerProcess,
    WorkerSignal, WorkerSpec, log_output,
};
pub use supervisor::{Supervisor, SupervisorBuilder, SupervisorState, TICK_INTERVAL};

#[cfg(test)]
mod tests;
