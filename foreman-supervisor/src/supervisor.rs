//! The supervisor control loop
//!
//! A [`Supervisor`] owns one [`ProcessPool`] per queue (or a single pool for the combined
//! queue list) and drives them from a 1-second tick:
//!
//! 1. apply pending control actions and queued commands
//! 2. if working, run the auto-scaler (at most once per cooldown) and monitor every pool
//! 3. persist a snapshot to the repository and notify the loop observer
//!
//! Errors raised inside a tick are handed to the [`ErrorSink`] and the loop carries on.
//! The loop ends only through [`Supervisor::terminate`], whose status `monitor` returns.

use crate::autoscaler::{AutoScaler, PoolState};
use crate::control::{self, ControlAction, ControlHandle, Ticker};
use crate::counter::{ProcfsCounter, SystemProcessCounter};
use crate::events::{ErrorSink, LogErrorSink, LogObserver, LoopObserver};
use crate::pool::ProcessPool;
use crate::process::{
    CommandLauncher, OutputSink, WorkerLauncher, WorkerProcess, WorkerSpec, log_output,
};
use crate::{Result, SupervisorError};
use chrono::Utc;
use foreman_core::command::CommandKind;
use foreman_core::metrics::{QueueLoad, QueueMetrics, StaticQueueMetrics};
use foreman_core::options::SupervisorOptions;
use foreman_core::queue::{CommandQueue, InMemoryCommandQueue};
use foreman_core::repository::{
    InMemorySupervisorRepository, SupervisorRecord, SupervisorRepository, SupervisorStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default cadence of the control loop
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle of a supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Built, loop not entered yet
    Starting,
    /// Dispatching and monitoring workers
    Working,
    /// Workers paused
    Paused,
    /// Draining pools before exit
    Terminating,
    /// All workers gone
    Exited,
}

/// Builder wiring a supervisor to its collaborators
pub struct SupervisorBuilder {
    options: SupervisorOptions,
    launcher: Option<Arc<dyn WorkerLauncher>>,
    commands: Option<Arc<dyn CommandQueue>>,
    repository: Option<Arc<dyn SupervisorRepository>>,
    metrics: Option<Arc<dyn QueueMetrics>>,
    counter: Option<Arc<dyn SystemProcessCounter>>,
    errors: Option<Arc<dyn ErrorSink>>,
    observer: Option<Arc<dyn LoopObserver>>,
    output: Option<OutputSink>,
    tick_interval: Duration,
}

impl SupervisorBuilder {
    /// Worker launcher (defaults to [`CommandLauncher`])
    pub fn launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Command queue (defaults to an in-memory queue)
    pub fn command_queue(mut self, commands: Arc<dyn CommandQueue>) -> Self {
        self.commands = Some(commands);
        self
    }

    /// Supervisor repository (defaults to an in-memory repository)
    pub fn repository(mut self, repository: Arc<dyn SupervisorRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Queue load source for auto-scaling (defaults to zero load)
    pub fn metrics(mut self, metrics: Arc<dyn QueueMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// OS process counter (defaults to [`ProcfsCounter`])
    pub fn process_counter(mut self, counter: Arc<dyn SystemProcessCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Sink for errors recovered inside the loop
    pub fn error_sink(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Observer notified once per tick
    pub fn observer(mut self, observer: Arc<dyn LoopObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Callback receiving worker output lines
    pub fn output(mut self, output: OutputSink) -> Self {
        self.output = Some(output);
        self
    }

    /// Loop cadence
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Build the supervisor, discarding commands queued for an earlier incarnation
    pub async fn build(self) -> Result<Supervisor> {
        self.options.validate()?;

        let commands = self
            .commands
            .unwrap_or_else(|| Arc::new(InMemoryCommandQueue::new()));
        commands.flush(&self.options.name).await?;

        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(CommandLauncher::new()));
        let output = self.output.unwrap_or_else(log_output);

        let shared = Arc::new(self.options.clone());
        let pools = self
            .options
            .pool_queues()
            .into_iter()
            .map(|queue| {
                ProcessPool::new(
                    WorkerSpec::new(Arc::clone(&shared), queue),
                    Arc::clone(&launcher),
                    Arc::clone(&output),
                )
            })
            .collect();

        let (actions_tx, actions_rx) = mpsc::unbounded_channel();

        Ok(Supervisor {
            name: self.options.name.clone(),
            auto_scale_cooldown: self.options.balance_cooldown,
            options: self.options,
            pools,
            state: SupervisorState::Starting,
            last_auto_scaled: None,
            tick_interval: self.tick_interval,
            commands,
            repository: self
                .repository
                .unwrap_or_else(|| Arc::new(InMemorySupervisorRepository::new())),
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(StaticQueueMetrics::new())),
            counter: self
                .counter
                .unwrap_or_else(|| Arc::new(ProcfsCounter::new())),
            errors: self.errors.unwrap_or_else(|| Arc::new(LogErrorSink)),
            observer: self.observer.unwrap_or_else(|| Arc::new(LogObserver)),
            actions_tx,
            actions_rx: Some(actions_rx),
            shutdown: CancellationToken::new(),
        })
    }
}

/// Control loop for one named group of worker pools
pub struct Supervisor {
    name: String,
    options: SupervisorOptions,
    pools: Vec<ProcessPool>,
    state: SupervisorState,
    last_auto_scaled: Option<Instant>,
    auto_scale_cooldown: Duration,
    tick_interval: Duration,
    commands: Arc<dyn CommandQueue>,
    repository: Arc<dyn SupervisorRepository>,
    metrics: Arc<dyn QueueMetrics>,
    counter: Arc<dyn SystemProcessCounter>,
    errors: Arc<dyn ErrorSink>,
    observer: Arc<dyn LoopObserver>,
    actions_tx: mpsc::UnboundedSender<ControlAction>,
    actions_rx: Option<mpsc::UnboundedReceiver<ControlAction>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("pools", &self.pools)
            .finish()
    }
}

impl Supervisor {
    /// Start building a supervisor from `options`
    pub fn builder(options: SupervisorOptions) -> SupervisorBuilder {
        SupervisorBuilder {
            options,
            launcher: None,
            commands: None,
            repository: None,
            metrics: None,
            counter: None,
            errors: None,
            observer: None,
            output: None,
            tick_interval: TICK_INTERVAL,
        }
    }

    /// Supervisor name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current options; only `max_processes` ever changes
    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// Lifecycle state
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Whether the loop is dispatching and monitoring workers
    pub fn is_working(&self) -> bool {
        self.state == SupervisorState::Working
    }

    /// Pools in creation order
    pub fn pools(&self) -> &[ProcessPool] {
        &self.pools
    }

    /// Handle for sending control actions from other tasks
    pub fn control(&self) -> ControlHandle {
        ControlHandle::new(self.actions_tx.clone(), self.shutdown.clone())
    }

    /// Run the supervisor until it terminates; returns the exit status
    ///
    /// # Errors
    ///
    /// Fails without entering the loop when another supervisor with the same name is
    /// registered, or when signal handlers cannot be installed.
    pub async fn monitor(mut self) -> Result<i32> {
        self.ensure_no_duplicate_supervisors().await?;

        let signals = control::listen_for_signals(self.control()).map_err(|e| {
            SupervisorError::Supervisor(format!("failed to install signal handlers: {}", e))
        })?;

        let status = self.run().await;
        signals.abort();
        status
    }

    /// Fail if a supervisor with this name is already registered
    pub async fn ensure_no_duplicate_supervisors(&self) -> Result<()> {
        if self.repository.find(&self.name).await?.is_some() {
            return Err(SupervisorError::Duplicate(self.name.clone()));
        }
        Ok(())
    }

    /// Enter the working state and scale to the initial process count
    pub fn start(&mut self) -> Result<()> {
        if self.state != SupervisorState::Starting {
            return Ok(());
        }

        let initial = self.options.initial_processes();
        info!(
            "Starting supervisor {} with {} pool(s) and {} process(es)",
            self.name,
            self.pools.len(),
            initial
        );
        self.state = SupervisorState::Working;
        self.scale(initial)
    }

    async fn run(&mut self) -> Result<i32> {
        if let Err(e) = self.start() {
            self.errors.report(&self.name, &e);
        }
        if let Err(e) = self.persist().await {
            self.errors.report(&self.name, &e);
        }

        let mut actions = self.actions_rx.take().ok_or_else(|| {
            SupervisorError::Supervisor(format!("supervisor {} is already running", self.name))
        })?;
        let mut ticker = Ticker::new(self.tick_interval, self.shutdown.clone());

        loop {
            tokio::select! {
                Some(action) = actions.recv() => {
                    match self.apply_action(action) {
                        Ok(Some(status)) => return self.terminate(status).await,
                        Ok(None) => {}
                        Err(e) => self.errors.report(&self.name, &e),
                    }
                }
                ticked = ticker.tick() => {
                    if !ticked {
                        return self.terminate(0).await;
                    }
                    if let Some(status) = self.loop_once().await {
                        return Ok(status);
                    }
                }
            }
        }
    }

    /// Run one iteration of the control loop
    ///
    /// Returns the exit status if the iteration terminated the supervisor.
    pub async fn loop_once(&mut self) -> Option<i32> {
        match self.tick().await {
            Ok(exit) => exit,
            Err(e) => {
                self.errors.report(&self.name, &e);
                None
            }
        }
    }

    async fn tick(&mut self) -> Result<Option<i32>> {
        if self.parent_is_gone() {
            warn!("Parent of supervisor {} is gone; terminating", self.name);
            return self.terminate(0).await.map(Some);
        }

        if let Some(status) = self.process_pending_actions() {
            return self.terminate(status).await.map(Some);
        }

        if let Some(status) = self.process_pending_commands().await? {
            return self.terminate(status).await.map(Some);
        }

        if self.is_working() {
            if let Err(e) = self.auto_scale().await {
                self.errors.report(&self.name, &e);
            }
            self.monitor_pools();
        }
        self.prune_terminating_processes();

        if let Err(e) = self.persist().await {
            self.errors.report(&self.name, &e);
        }
        self.observer.looped(self);

        Ok(None)
    }

    // Actions sent through the control handle while the loop is driven by `loop_once`
    fn process_pending_actions(&mut self) -> Option<i32> {
        let mut pending = Vec::new();
        if let Some(actions) = self.actions_rx.as_mut() {
            while let Ok(action) = actions.try_recv() {
                pending.push(action);
            }
        }

        for action in pending {
            match self.apply_action(action) {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(e) => self.errors.report(&self.name, &e),
            }
        }
        None
    }

    async fn process_pending_commands(&mut self) -> Result<Option<i32>> {
        let commands = self.commands.pending(&self.name).await?;

        for command in commands {
            debug!(
                "Supervisor {} processing {} command {}",
                self.name,
                command.kind.name(),
                command.id
            );
            match self.apply_command(command.kind) {
                Ok(Some(status)) => return Ok(Some(status)),
                Ok(None) => {}
                Err(e) => self.errors.report(&self.name, &e),
            }
        }

        Ok(None)
    }

    /// Apply a queued command; returns the exit status for `terminate`
    pub fn apply_command(&mut self, kind: CommandKind) -> Result<Option<i32>> {
        match kind {
            CommandKind::Scale { processes } => self.scale(processes).map(|_| None),
            CommandKind::Balance { queues } => self.balance(&queues).map(|_| None),
            CommandKind::Restart => self.apply_action(ControlAction::Restart),
            CommandKind::Pause => self.apply_action(ControlAction::Pause),
            CommandKind::Continue => self.apply_action(ControlAction::Continue),
            CommandKind::Terminate { status } => {
                self.apply_action(ControlAction::Terminate(status))
            }
        }
    }

    /// Apply a control action; returns the exit status for `Terminate`
    pub fn apply_action(&mut self, action: ControlAction) -> Result<Option<i32>> {
        match action {
            ControlAction::Terminate(status) => return Ok(Some(status)),
            ControlAction::Restart => self.restart()?,
            ControlAction::Pause => self.pause()?,
            ControlAction::Continue => self.resume()?,
        }
        Ok(None)
    }

    /// Distribute `processes` evenly over all pools
    ///
    /// Raises `max_processes` if needed; it is never lowered. Each pool receives
    /// `processes / pool_count`, rounded down.
    pub fn scale(&mut self, processes: usize) -> Result<()> {
        let pool_count = self.pools.len().max(1);
        self.options.max_processes = self
            .options
            .max_processes
            .max(processes)
            .max(self.pools.len());

        let per_pool = processes / pool_count;
        let targets: BTreeMap<String, usize> = self
            .pools
            .iter()
            .map(|pool| (pool.queue().to_string(), per_pool))
            .collect();

        info!(
            "Scaling supervisor {} to {} process(es) per pool",
            self.name, per_pool
        );
        self.balance(&targets)
    }

    /// Scale individual pools; queues without a pool are skipped
    pub fn balance(&mut self, targets: &BTreeMap<String, usize>) -> Result<()> {
        let mut first_error = None;

        for (queue, &processes) in targets {
            let Some(pool) = self.pools.iter_mut().find(|pool| pool.queue() == queue) else {
                debug!("Supervisor {} has no pool for queue {}", self.name, queue);
                continue;
            };
            if let Err(e) = pool.scale(processes) {
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Rolling restart of every pool
    pub fn restart(&mut self) -> Result<()> {
        if !self.accepts_lifecycle_change() {
            return Ok(());
        }
        info!("Restarting supervisor {}", self.name);
        self.state = SupervisorState::Working;
        self.each_pool(ProcessPool::restart)
    }

    /// Stop every worker from taking new jobs
    pub fn pause(&mut self) -> Result<()> {
        if !self.accepts_lifecycle_change() {
            return Ok(());
        }
        info!("Pausing supervisor {}", self.name);
        self.state = SupervisorState::Paused;
        self.each_pool(ProcessPool::pause)
    }

    /// Resume paused workers
    pub fn resume(&mut self) -> Result<()> {
        if !self.accepts_lifecycle_change() {
            return Ok(());
        }
        info!("Continuing supervisor {}", self.name);
        self.state = SupervisorState::Working;
        self.each_pool(ProcessPool::resume)
    }

    /// Drain every pool to zero and wait for the workers to exit
    ///
    /// Forgets the repository record first so the name is free and no new commands
    /// target this instance. Workers that outlive `options.timeout` are killed; a forced
    /// shutdown through [`ControlHandle::force_shutdown`] kills them all at once.
    /// Returns `status` for the process to exit with.
    pub async fn terminate(&mut self, status: i32) -> Result<i32> {
        if matches!(
            self.state,
            SupervisorState::Terminating | SupervisorState::Exited
        ) {
            return Ok(status);
        }

        info!("Terminating supervisor {} (status {})", self.name, status);
        self.state = SupervisorState::Terminating;

        if let Err(e) = self.repository.forget(&self.name).await {
            self.errors.report(&self.name, &e.into());
        }

        for pool in &mut self.pools {
            if let Err(e) = pool.scale(0) {
                self.errors.report(&self.name, &e);
            }
        }

        let mut ticker = Ticker::new(self.tick_interval, self.shutdown.clone());
        loop {
            self.prune_terminating_processes();

            let remaining = self.terminating_processes().len();
            if remaining == 0 {
                break;
            }

            debug!(
                "Supervisor {} waiting for {} worker(s) to exit",
                self.name, remaining
            );
            if !ticker.tick().await {
                warn!(
                    "Forced shutdown of supervisor {}; killing {} worker(s)",
                    self.name, remaining
                );
                for pool in &mut self.pools {
                    pool.kill_all();
                }
                break;
            }
        }

        self.state = SupervisorState::Exited;
        info!("Supervisor {} exited", self.name);
        Ok(status)
    }

    /// Prune hanging terminating workers and return the remaining total
    pub fn prune_and_get_total_processes(&mut self) -> usize {
        self.prune_terminating_processes();
        self.total_process_count()
    }

    /// Active workers across all pools
    pub fn processes(&self) -> Vec<&WorkerProcess> {
        self.pools.iter().flat_map(|pool| pool.processes()).collect()
    }

    /// Terminating workers across all pools
    pub fn terminating_processes(&self) -> Vec<&WorkerProcess> {
        self.pools
            .iter()
            .flat_map(|pool| pool.terminating_processes())
            .collect()
    }

    /// Active plus terminating workers across all pools
    pub fn total_process_count(&self) -> usize {
        self.pools.iter().map(ProcessPool::total_process_count).sum()
    }

    /// Worker processes the OS reports for this supervisor
    ///
    /// Logs a warning when the count differs from internal bookkeeping.
    pub fn total_system_process_count(&self) -> Result<usize> {
        let system = self.counter.count(&self.name)?;
        let tracked = self.total_process_count();
        if system != tracked {
            warn!(
                "Supervisor {} tracks {} worker(s) but the process table shows {}",
                self.name, tracked, system
            );
        }
        Ok(system)
    }

    /// Snapshot written to the repository
    pub fn record(&self) -> SupervisorRecord {
        let processes = self
            .pools
            .iter()
            .map(|pool| {
                (
                    format!("{}:{}", self.options.connection, pool.queue()),
                    pool.processes().len(),
                )
            })
            .collect();

        SupervisorRecord {
            name: self.name.clone(),
            master: self.options.master_name(),
            pid: std::process::id(),
            status: if self.state == SupervisorState::Paused {
                SupervisorStatus::Paused
            } else {
                SupervisorStatus::Running
            },
            processes,
            options: self.options.clone(),
            updated_at: Utc::now(),
        }
    }

    /// Write the current snapshot to the repository
    pub async fn persist(&self) -> Result<()> {
        let record = self.record();
        self.repository.update(&record).await?;
        Ok(())
    }

    /// Run the auto-scaler if enabled and the cooldown has passed; returns whether it ran
    pub async fn auto_scale(&mut self) -> Result<bool> {
        if !self.options.auto_scaling() {
            return Ok(false);
        }

        let now = Instant::now();
        if self
            .last_auto_scaled
            .is_some_and(|at| now.duration_since(at) < self.auto_scale_cooldown)
        {
            return Ok(false);
        }
        self.last_auto_scaled = Some(now);

        self.prune_terminating_processes();

        let mut loads = HashMap::new();
        let mut states = Vec::with_capacity(self.pools.len());
        for pool in &self.pools {
            let mut load = QueueLoad::default();
            for queue in pool.queue().split(',') {
                load = load.merge(self.metrics.load(queue).await?);
            }
            loads.insert(pool.queue().to_string(), load);
            states.push(PoolState::new(pool.queue(), pool.processes().len()));
        }

        let targets =
            AutoScaler::new(&self.options).scale(&states, &loads, self.total_process_count());
        self.balance(&targets)?;
        Ok(true)
    }

    fn monitor_pools(&mut self) {
        for pool in &mut self.pools {
            match pool.monitor() {
                Ok(0) => {}
                Ok(launched) => debug!("Pool {} launched {} worker(s)", pool.queue(), launched),
                Err(e) => self.errors.report(&self.name, &e),
            }
        }
    }

    fn prune_terminating_processes(&mut self) {
        let grace = self.options.timeout;
        for pool in &mut self.pools {
            pool.prune_terminating_processes(grace);
        }
    }

    fn each_pool(&mut self, mut f: impl FnMut(&mut ProcessPool) -> Result<()>) -> Result<()> {
        let mut first_error = None;
        for pool in &mut self.pools {
            if let Err(e) = f(pool) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn accepts_lifecycle_change(&self) -> bool {
        !matches!(
            self.state,
            SupervisorState::Terminating | SupervisorState::Exited
        )
    }

    #[cfg(unix)]
    fn parent_is_gone(&self) -> bool {
        match self.options.parent_id {
            Some(parent) if parent > 1 => {
                nix::unistd::getppid().as_raw() as u32 != parent
            }
            _ => false,
        }
    }

    #[cfg(not(unix))]
    fn parent_is_gone(&self) -> bool {
        false
    }
}
