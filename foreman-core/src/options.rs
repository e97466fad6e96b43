//! Supervisor options
//!
//! [`SupervisorOptions`] is the configuration snapshot a supervisor is built from. It is
//! persisted alongside every supervisor record so external tooling can see exactly how a
//! running supervisor was started.

use crate::error::{ForemanError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// How worker processes are distributed across the supervisor's queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Balance {
    /// A single pool consumes the combined queue list
    #[default]
    #[serde(alias = "false", alias = "single")]
    Off,
    /// One pool per queue, processes split evenly
    Simple,
    /// One pool per queue, redistributed by the auto-scaler
    Auto,
}

impl std::fmt::Display for Balance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Balance::Off => write!(f, "off"),
            Balance::Simple => write!(f, "simple"),
            Balance::Auto => write!(f, "auto"),
        }
    }
}

/// Load signal the auto-scaler distributes processes by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScalingStrategy {
    /// Estimated time to clear each queue (size × average runtime)
    #[default]
    Time,
    /// Number of jobs waiting on each queue
    Size,
}

/// Command line used to launch one worker process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCommand {
    /// Program to execute
    pub program: String,

    /// Arguments placed before the generated worker flags
    pub args: Vec<String>,

    /// Working directory for workers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: "foreman-worker".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

/// Configuration snapshot for one supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorOptions {
    /// Unique supervisor name
    pub name: String,

    /// Queue connection the workers consume from
    pub connection: String,

    /// Queues serviced by this supervisor, in priority order
    pub queues: Vec<String>,

    /// Pool layout and balancing mode
    pub balance: Balance,

    /// Load signal used when `balance` is `auto`
    pub auto_scaling_strategy: ScalingStrategy,

    /// Upper bound on worker processes across all pools
    pub max_processes: usize,

    /// Lower bound on worker processes per pool while auto-scaling
    pub min_processes: usize,

    /// Most processes a single auto-scale run may add to or remove from one pool
    pub balance_max_shift: usize,

    /// Minimum time between two auto-scale runs
    #[serde(with = "humantime_serde")]
    pub balance_cooldown: Duration,

    /// Process that launched this supervisor; the supervisor exits when it disappears
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u32>,

    /// Name passed to workers for identification
    pub workers_name: String,

    /// Worker executable
    pub worker: WorkerCommand,

    /// Time a worker sleeps when its queue is empty
    #[serde(with = "humantime_serde")]
    pub sleep: Duration,

    /// Per-job timeout; also the grace window for terminating workers
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Attempts per job before it is failed
    pub tries: u32,

    /// Memory limit per worker in megabytes
    pub memory: u64,

    /// Jobs a worker processes before exiting (0 = unlimited)
    pub max_jobs: u64,

    /// Wall time a worker runs before exiting (zero = unlimited)
    #[serde(with = "humantime_serde")]
    pub max_time: Duration,

    /// Delay before a failed job is retried
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,

    /// Scheduling priority adjustment for workers
    pub nice: i32,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            connection: "redis".to_string(),
            queues: vec!["default".to_string()],
            balance: Balance::Off,
            auto_scaling_strategy: ScalingStrategy::Time,
            max_processes: 1,
            min_processes: 1,
            balance_max_shift: 1,
            balance_cooldown: Duration::from_secs(3),
            parent_id: None,
            workers_name: "default".to_string(),
            worker: WorkerCommand::default(),
            sleep: Duration::from_secs(3),
            timeout: Duration::from_secs(60),
            tries: 1,
            memory: 128,
            max_jobs: 0,
            max_time: Duration::ZERO,
            backoff: Duration::ZERO,
            nice: 0,
        }
    }
}

impl SupervisorOptions {
    /// Create options for `name` servicing `queues`
    pub fn new<I, S>(name: impl Into<String>, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            queues: queues.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the balancing mode
    pub fn with_balance(mut self, balance: Balance) -> Self {
        self.balance = balance;
        self
    }

    /// Set the maximum process count
    pub fn with_max_processes(mut self, max: usize) -> Self {
        self.max_processes = max;
        self
    }

    /// Set the per-pool minimum used while auto-scaling
    pub fn with_min_processes(mut self, min: usize) -> Self {
        self.min_processes = min;
        self
    }

    /// Set the auto-scaling shift limit
    pub fn with_balance_max_shift(mut self, shift: usize) -> Self {
        self.balance_max_shift = shift;
        self
    }

    /// Set the auto-scaling cooldown
    pub fn with_balance_cooldown(mut self, cooldown: Duration) -> Self {
        self.balance_cooldown = cooldown;
        self
    }

    /// Set the worker executable
    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = worker;
        self
    }

    /// Set the job timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the auto-scaler manages this supervisor's pools
    pub fn auto_scaling(&self) -> bool {
        self.balance == Balance::Auto
    }

    /// Whether each queue gets its own pool
    pub fn pool_per_queue(&self) -> bool {
        self.balance != Balance::Off
    }

    /// Comma separated queue list
    pub fn queue_list(&self) -> String {
        self.queues.join(",")
    }

    /// Queue identifiers of the pools this supervisor creates
    pub fn pool_queues(&self) -> Vec<String> {
        if self.pool_per_queue() {
            self.queues.clone()
        } else {
            vec![self.queue_list()]
        }
    }

    /// Master portion of a `master:supervisor` name
    pub fn master_name(&self) -> String {
        match self.name.rsplit_once(':') {
            Some((master, _)) => master.to_string(),
            None => String::new(),
        }
    }

    /// Process count the supervisor scales to when it starts
    pub fn initial_processes(&self) -> usize {
        if self.auto_scaling() {
            self.min_processes * self.pool_queues().len()
        } else {
            self.max_processes
        }
    }

    /// Validate the option set
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the name or queue list is empty, a queue name is
    /// blank or repeated, the process bounds are inverted, or the shift limit is zero.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ForemanError::Configuration(
                "supervisor name must not be empty".to_string(),
            ));
        }

        if self.queues.is_empty() {
            return Err(ForemanError::Configuration(format!(
                "supervisor {} has no queues",
                self.name
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for queue in &self.queues {
            if queue.trim().is_empty() {
                return Err(ForemanError::Configuration(format!(
                    "supervisor {} has a blank queue name",
                    self.name
                )));
            }
            // Pools are keyed by queue name
            if !seen.insert(queue.as_str()) {
                return Err(ForemanError::Configuration(format!(
                    "supervisor {} lists queue {} more than once",
                    self.name, queue
                )));
            }
        }

        if self.auto_scaling() && self.min_processes > self.max_processes {
            return Err(ForemanError::Configuration(format!(
                "supervisor {}: min_processes ({}) exceeds max_processes ({})",
                self.name, self.min_processes, self.max_processes
            )));
        }

        if self.balance_max_shift == 0 {
            return Err(ForemanError::Configuration(format!(
                "supervisor {}: balance_max_shift must be at least 1",
                self.name
            )));
        }

        Ok(())
    }

    /// Serialize as JSON for storage
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
