//! # Foreman Core
//!
//! Shared building blocks for Foreman queue-worker supervisors:
//! - [`options::SupervisorOptions`] describing one supervisor and its worker pools
//! - [`command::Command`]s that operators send to running supervisors
//! - The [`queue::CommandQueue`] mailbox and [`repository::SupervisorRepository`] state store
//! - [`metrics::QueueMetrics`], the per-queue load signal used for auto-scaling
//! - Redis implementations of all three storage contracts in [`redis_store`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use foreman_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ForemanConfig::load()?;
//!     let store = RedisStore::connect(&config.store.url, &config.store.prefix).await?;
//!
//!     // Ask the "email" supervisor to run six workers
//!     store.command_queue().push(Command::scale("email", 6)).await?;
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod metrics;
pub mod options;
pub mod queue;
pub mod redis_store;
pub mod repository;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::command::{Command, CommandKind};
    pub use crate::config::{ForemanConfig, StoreConfig};
    pub use crate::error::{ForemanError, Result};
    pub use crate::metrics::{QueueLoad, QueueMetrics, StaticQueueMetrics};
    pub use crate::options::{Balance, ScalingStrategy, SupervisorOptions, WorkerCommand};
    pub use crate::queue::{CommandQueue, InMemoryCommandQueue};
    pub use crate::redis_store::{
        RedisCommandQueue, RedisQueueMetrics, RedisStore, RedisSupervisorRepository,
    };
    pub use crate::repository::{
        InMemorySupervisorRepository, SupervisorRecord, SupervisorRepository, SupervisorStatus,
    };
}
