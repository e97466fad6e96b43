//! Control commands addressed to a running supervisor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// What a command asks the supervisor to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "options", rename_all = "snake_case")]
pub enum CommandKind {
    /// Distribute `processes` evenly across all pools
    Scale {
        /// Total process count
        processes: usize,
    },
    /// Set the target scale of individual pools, keyed by queue
    Balance {
        /// Queue to target process count
        queues: BTreeMap<String, usize>,
    },
    /// Rolling restart of every pool
    Restart,
    /// Stop workers from taking new jobs
    Pause,
    /// Resume paused workers
    Continue,
    /// Drain all pools and exit
    Terminate {
        /// Exit status of the supervisor process
        #[serde(default)]
        status: i32,
    },
}

impl CommandKind {
    /// Short name used in logs and the CLI
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Scale { .. } => "scale",
            CommandKind::Balance { .. } => "balance",
            CommandKind::Restart => "restart",
            CommandKind::Pause => "pause",
            CommandKind::Continue => "continue",
            CommandKind::Terminate { .. } => "terminate",
        }
    }
}

/// A command queued for one supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Unique command id
    pub id: Uuid,

    /// Name of the supervisor the command targets
    pub supervisor: String,

    /// Command type and options
    #[serde(flatten)]
    pub kind: CommandKind,

    /// When the command was queued
    pub created_at: DateTime<Utc>,
}

impl Command {
    /// Create a new command for `supervisor`
    pub fn new(supervisor: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            supervisor: supervisor.into(),
            kind,
            created_at: Utc::now(),
        }
    }

    /// Scale command
    pub fn scale(supervisor: impl Into<String>, processes: usize) -> Self {
        Self::new(supervisor, CommandKind::Scale { processes })
    }

    /// Balance command
    pub fn balance(supervisor: impl Into<String>, queues: BTreeMap<String, usize>) -> Self {
        Self::new(supervisor, CommandKind::Balance { queues })
    }

    /// Terminate command
    pub fn terminate(supervisor: impl Into<String>, status: i32) -> Self {
        Self::new(supervisor, CommandKind::Terminate { status })
    }
}
