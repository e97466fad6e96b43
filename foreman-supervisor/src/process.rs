//! Worker processes
//!
//! A [`WorkerProcess`] is one OS process consuming a single queue (or, for single-pool
//! supervisors, a comma separated queue list). Launching goes through the
//! [`WorkerLauncher`] trait so pools can be exercised without spawning real processes;
//! [`CommandLauncher`] is the production launcher.

use crate::{Result, SupervisorError};
use foreman_core::options::SupervisorOptions;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Delay before a worker that was just restarted may be restarted again
pub const RESTART_COOLDOWN: Duration = Duration::from_secs(1);

/// Delay applied once a worker dies again inside its restart cooldown
pub const FAILED_RESTART_COOLDOWN: Duration = Duration::from_secs(60);

/// Signals the supervisor sends to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// Finish the current job and exit (SIGTERM)
    Terminate,
    /// Stop taking new jobs (SIGUSR2)
    Pause,
    /// Resume taking jobs (SIGCONT)
    Continue,
    /// Exit immediately (SIGKILL)
    Kill,
}

#[cfg(unix)]
impl From<WorkerSignal> for nix::sys::signal::Signal {
    fn from(signal: WorkerSignal) -> Self {
        use nix::sys::signal::Signal;
        match signal {
            WorkerSignal::Terminate => Signal::SIGTERM,
            WorkerSignal::Pause => Signal::SIGUSR2,
            WorkerSignal::Continue => Signal::SIGCONT,
            WorkerSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// Lifecycle state of a worker as tracked by its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Taking jobs
    Running,
    /// Alive but not taking jobs
    Paused,
    /// Asked to exit, not yet confirmed dead
    Terminating,
}

/// Which stream a line of worker output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line written by a worker
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub pid: u32,
    pub queue: String,
    pub stream: OutputStream,
    pub line: String,
}

/// Callback receiving worker output
pub type OutputSink = Arc<dyn Fn(WorkerOutput) + Send + Sync>;

/// Output sink that logs every line under the `foreman::worker` target
pub fn log_output() -> OutputSink {
    Arc::new(|output: WorkerOutput| match output.stream {
        OutputStream::Stdout => {
            info!(target: "foreman::worker", pid = output.pid, queue = %output.queue, "{}", output.line)
        }
        OutputStream::Stderr => {
            warn!(target: "foreman::worker", pid = output.pid, queue = %output.queue, "{}", output.line)
        }
    })
}

/// Everything needed to launch a worker for one queue
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    queue: String,
    options: Arc<SupervisorOptions>,
}

impl WorkerSpec {
    /// Create a spec for `queue` under the given supervisor options
    pub fn new(options: Arc<SupervisorOptions>, queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            options,
        }
    }

    /// Queue (or comma separated queue list) the worker consumes
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Name of the owning supervisor
    pub fn supervisor(&self) -> &str {
        &self.options.name
    }

    /// Program and arguments for the worker
    pub fn command_line(&self) -> (String, Vec<String>) {
        let options = &self.options;
        let mut args = Vec::new();

        let program = if options.nice != 0 {
            args.push("-n".to_string());
            args.push(options.nice.to_string());
            args.push(options.worker.program.clone());
            "nice".to_string()
        } else {
            options.worker.program.clone()
        };

        args.extend(options.worker.args.iter().cloned());
        args.push(format!("--name={}", options.workers_name));
        args.push(format!("--supervisor={}", options.name));
        args.push(format!("--queue={}", self.queue));
        args.push(format!("--sleep={}", options.sleep.as_secs()));
        args.push(format!("--timeout={}", options.timeout.as_secs()));
        args.push(format!("--tries={}", options.tries));
        args.push(format!("--memory={}", options.memory));
        args.push(format!("--max-jobs={}", options.max_jobs));
        args.push(format!("--max-time={}", options.max_time.as_secs()));
        args.push(format!("--backoff={}", options.backoff.as_secs()));

        (program, args)
    }

    /// Environment passed to the worker on top of the supervisor's own
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .options
            .worker
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("FOREMAN_SUPERVISOR".to_string(), self.options.name.clone()));
        env.push(("FOREMAN_QUEUE".to_string(), self.queue.clone()));
        env
    }
}

/// A launched OS process
pub trait WorkerChild: Send + Sync {
    /// OS process id
    fn pid(&self) -> u32;

    /// Non-blocking liveness check
    fn is_running(&mut self) -> bool;

    /// Deliver a signal; signalling an exited process is not an error
    fn signal(&mut self, signal: WorkerSignal) -> Result<()>;
}

/// Starts worker processes
pub trait WorkerLauncher: Send + Sync {
    /// Launch one worker described by `spec`, forwarding its output to `output`
    fn launch(&self, spec: &WorkerSpec, output: &OutputSink) -> Result<Box<dyn WorkerChild>>;
}

/// Launches workers as child processes of the supervisor
#[derive(Debug, Clone, Default)]
pub struct CommandLauncher;

impl CommandLauncher {
    /// Create a launcher
    pub fn new() -> Self {
        Self
    }
}

impl WorkerLauncher for CommandLauncher {
    fn launch(&self, spec: &WorkerSpec, output: &OutputSink) -> Result<Box<dyn WorkerChild>> {
        let (program, args) = spec.command_line();

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args)
            .envs(spec.env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A worker never outlives the pool that tracks it
            .kill_on_drop(true);

        if let Some(ref working_dir) = spec.options.worker.working_dir {
            cmd.current_dir(working_dir);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            queue: spec.queue().to_string(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| {
            SupervisorError::Process(format!("worker for {} exited during spawn", spec.queue()))
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, OutputStream::Stdout, pid, spec.queue(), output);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, OutputStream::Stderr, pid, spec.queue(), output);
        }

        debug!("Launched worker {} for queue {} ({})", pid, spec.queue(), program);

        Ok(Box::new(OsWorker {
            child,
            pid,
            exit_status: None,
        }))
    }
}

fn forward_output<R>(reader: R, stream: OutputStream, pid: u32, queue: &str, sink: &OutputSink)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let sink = Arc::clone(sink);
    let queue = queue.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink(WorkerOutput {
                pid,
                queue: queue.clone(),
                stream,
                line,
            });
        }
    });
}

/// Worker backed by a real child process
#[derive(Debug)]
pub struct OsWorker {
    child: tokio::process::Child,
    pid: u32,
    exit_status: Option<ExitStatus>,
}

impl WorkerChild for OsWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_running(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }

        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("Worker {} exited ({})", self.pid, status);
                self.exit_status = Some(status);
                false
            }
            Err(e) => {
                warn!("Failed to poll worker {}: {}", self.pid, e);
                false
            }
        }
    }

    fn signal(&mut self, signal: WorkerSignal) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        if signal == WorkerSignal::Kill {
            return self.child.start_kill().map_err(|e| SupervisorError::Signal {
                pid: self.pid,
                reason: e.to_string(),
            });
        }

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(self.pid as i32), Signal::from(signal)) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(SupervisorError::Signal {
                    pid: self.pid,
                    reason: e.to_string(),
                }),
            }
        }

        #[cfg(not(unix))]
        {
            match signal {
                WorkerSignal::Terminate => {
                    self.child.start_kill().map_err(|e| SupervisorError::Signal {
                        pid: self.pid,
                        reason: e.to_string(),
                    })
                }
                other => Err(SupervisorError::Signal {
                    pid: self.pid,
                    reason: format!("{:?} is not supported on this platform", other),
                }),
            }
        }
    }
}

/// One worker tracked by a pool
pub struct WorkerProcess {
    spec: WorkerSpec,
    child: Box<dyn WorkerChild>,
    status: ProcessStatus,
    restart_again_at: Option<Instant>,
    restarts: u32,
    terminated_at: Option<Instant>,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.child.pid())
            .field("queue", &self.spec.queue())
            .field("status", &self.status)
            .field("restarts", &self.restarts)
            .finish()
    }
}

impl WorkerProcess {
    /// Launch a new worker
    pub fn start(
        spec: WorkerSpec,
        launcher: &dyn WorkerLauncher,
        output: &OutputSink,
    ) -> Result<Self> {
        let child = launcher.launch(&spec, output)?;
        Ok(Self {
            spec,
            child,
            status: ProcessStatus::Running,
            restart_again_at: None,
            restarts: 0,
            terminated_at: None,
        })
    }

    /// OS process id of the current child
    pub fn pid(&self) -> u32 {
        self.child.pid()
    }

    /// Queue the worker consumes
    pub fn queue(&self) -> &str {
        self.spec.queue()
    }

    /// Tracked lifecycle state
    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    /// Number of times this worker has been relaunched after dying
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Whether the OS process is alive
    pub fn is_running(&mut self) -> bool {
        self.child.is_running()
    }

    /// Whether a relaunch is currently held back by the restart cooldown
    pub fn cooling_down(&self) -> bool {
        self.restart_again_at
            .is_some_and(|at| Instant::now() < at)
    }

    /// Stop taking new jobs
    pub fn pause(&mut self) -> Result<()> {
        if self.status == ProcessStatus::Terminating {
            return Ok(());
        }
        self.child.signal(WorkerSignal::Pause)?;
        self.status = ProcessStatus::Paused;
        Ok(())
    }

    /// Resume taking jobs
    pub fn resume(&mut self) -> Result<()> {
        if self.status == ProcessStatus::Terminating {
            return Ok(());
        }
        self.child.signal(WorkerSignal::Continue)?;
        self.status = ProcessStatus::Running;
        Ok(())
    }

    /// Ask the worker to finish its job and exit
    pub fn terminate(&mut self) -> Result<()> {
        if self.terminated_at.is_none() {
            self.terminated_at = Some(Instant::now());
        }
        self.status = ProcessStatus::Terminating;
        self.child.signal(WorkerSignal::Terminate)
    }

    /// Kill the worker immediately
    pub fn kill(&mut self) -> Result<()> {
        self.child.signal(WorkerSignal::Kill)
    }

    /// How long ago the worker was asked to terminate
    pub fn terminating_for(&self) -> Option<Duration> {
        self.terminated_at.map(|at| at.elapsed())
    }

    /// Relaunch the worker if it died; returns whether a relaunch happened
    ///
    /// The first relaunch is immediate. A worker that dies again within
    /// [`RESTART_COOLDOWN`] of being relaunched is held back for
    /// [`FAILED_RESTART_COOLDOWN`] before the next attempt.
    pub fn monitor(&mut self, launcher: &dyn WorkerLauncher, output: &OutputSink) -> Result<bool> {
        let now = Instant::now();

        if self.child.is_running() {
            if self.restart_again_at.is_some_and(|at| now >= at) {
                self.restart_again_at = None;
            }
            return Ok(false);
        }

        if self.cooling_down() {
            return Ok(false);
        }

        let delay = if self.restart_again_at.is_some() {
            warn!(
                "Worker for queue {} died again right after a restart; next attempt in {:?}",
                self.queue(),
                FAILED_RESTART_COOLDOWN
            );
            FAILED_RESTART_COOLDOWN
        } else {
            RESTART_COOLDOWN
        };
        let old_pid = self.child.pid();
        self.child = launcher.launch(&self.spec, output)?;
        self.restart_again_at = Some(now + delay);
        self.restarts += 1;

        warn!(
            "Worker {} for queue {} died unexpectedly, relaunched as {}",
            old_pid,
            self.queue(),
            self.child.pid()
        );

        if self.status == ProcessStatus::Paused {
            self.child.signal(WorkerSignal::Pause)?;
        }

        Ok(true)
    }
}
