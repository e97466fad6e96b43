//! Process pool for one queue

use crate::process::{OutputSink, WorkerLauncher, WorkerProcess, WorkerSpec};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Workers servicing one queue, reconciled against a target scale
pub struct ProcessPool {
    spec: WorkerSpec,
    launcher: Arc<dyn WorkerLauncher>,
    output: OutputSink,
    target: usize,
    processes: Vec<WorkerProcess>,
    terminating: Vec<WorkerProcess>,
    working: bool,
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("queue", &self.queue())
            .field("target", &self.target)
            .field("processes", &self.processes.len())
            .field("terminating", &self.terminating.len())
            .field("working", &self.working)
            .finish()
    }
}

impl ProcessPool {
    /// Create an empty pool; workers are launched by [`ProcessPool::scale`]
    pub fn new(spec: WorkerSpec, launcher: Arc<dyn WorkerLauncher>, output: OutputSink) -> Self {
        Self {
            spec,
            launcher,
            output,
            target: 0,
            processes: Vec::new(),
            terminating: Vec::new(),
            working: true,
        }
    }

    /// Queue identifier of the pool
    pub fn queue(&self) -> &str {
        self.spec.queue()
    }

    /// Target number of active workers
    pub fn target(&self) -> usize {
        self.target
    }

    /// Whether workers are taking jobs
    pub fn is_working(&self) -> bool {
        self.working
    }

    /// Active workers
    pub fn processes(&self) -> &[WorkerProcess] {
        &self.processes
    }

    /// Workers asked to exit that have not been pruned yet
    pub fn terminating_processes(&self) -> &[WorkerProcess] {
        &self.terminating
    }

    /// Active plus terminating workers
    pub fn total_process_count(&self) -> usize {
        self.processes.len() + self.terminating.len()
    }

    /// Move the pool towards `processes` active workers
    ///
    /// Growing launches the difference; shrinking signals the oldest workers to exit and
    /// moves them to the terminating set without waiting for them.
    pub fn scale(&mut self, processes: usize) -> Result<()> {
        self.target = processes;
        let active = self.processes.len();

        if processes > active {
            debug!("Scaling {} up from {} to {}", self.queue(), active, processes);
            for _ in active..processes {
                self.launch()?;
            }
        } else if processes < active {
            debug!("Scaling {} down from {} to {}", self.queue(), active, processes);
            let excess: Vec<WorkerProcess> = self.processes.drain(..active - processes).collect();
            self.mark_for_termination(excess)?;
        }

        Ok(())
    }

    /// Relaunch dead workers and top the pool back up to its target
    ///
    /// Every worker is checked even when a relaunch fails; the first failure is returned
    /// after the pass. Returns the number of workers launched.
    pub fn monitor(&mut self) -> Result<usize> {
        let mut launched = 0;
        let mut first_error = None;

        for process in &mut self.processes {
            match process.monitor(self.launcher.as_ref(), &self.output) {
                Ok(true) => launched += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to relaunch worker for {}: {}", self.spec.queue(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        // A previous launch may have failed part way through a scale
        while self.processes.len() < self.target {
            if let Err(e) = self.launch() {
                first_error.get_or_insert(e);
                break;
            }
            launched += 1;
        }

        first_error.map_or(Ok(launched), Err)
    }

    /// Replace every active worker with a fresh one at the current target
    pub fn restart(&mut self) -> Result<()> {
        info!("Restarting {} workers for {}", self.processes.len(), self.queue());

        self.working = true;
        let old: Vec<WorkerProcess> = self.processes.drain(..).collect();
        self.mark_for_termination(old)?;

        for _ in 0..self.target {
            self.launch()?;
        }
        Ok(())
    }

    /// Stop every active worker from taking new jobs
    pub fn pause(&mut self) -> Result<()> {
        self.working = false;
        self.each_process(WorkerProcess::pause)
    }

    /// Resume every active worker
    pub fn resume(&mut self) -> Result<()> {
        self.working = true;
        self.each_process(WorkerProcess::resume)
    }

    /// Drop terminating workers that have exited
    ///
    /// Workers still alive after `grace` are killed and dropped as well. Returns how many
    /// workers had to be killed.
    pub fn prune_terminating_processes(&mut self, grace: Duration) -> usize {
        let mut killed = 0;
        let queue = self.queue().to_string();

        self.terminating.retain_mut(|process| {
            if !process.is_running() {
                return false;
            }

            let hanging = process
                .terminating_for()
                .is_some_and(|elapsed| elapsed >= grace);
            if !hanging {
                return true;
            }

            warn!(
                "Worker {} for {} ignored termination for {:?}; killing it",
                process.pid(),
                queue,
                grace
            );
            if let Err(e) = process.kill() {
                warn!("Failed to kill worker {}: {}", process.pid(), e);
            }
            killed += 1;
            false
        });

        killed
    }

    /// Kill every worker, active or terminating, without waiting
    pub fn kill_all(&mut self) {
        for process in self.processes.iter_mut().chain(self.terminating.iter_mut()) {
            if let Err(e) = process.kill() {
                warn!("Failed to kill worker {}: {}", process.pid(), e);
            }
        }
        self.processes.clear();
        self.terminating.clear();
        self.target = 0;
    }

    fn launch(&mut self) -> Result<()> {
        let mut process =
            WorkerProcess::start(self.spec.clone(), self.launcher.as_ref(), &self.output)?;
        if !self.working {
            process.pause()?;
        }
        self.processes.push(process);
        Ok(())
    }

    // Signal every worker even if some fail
    fn each_process(&mut self, mut f: impl FnMut(&mut WorkerProcess) -> Result<()>) -> Result<()> {
        let mut first_error = None;
        for process in &mut self.processes {
            if let Err(e) = f(process) {
                warn!("Failed to signal worker {}: {}", process.pid(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn mark_for_termination(&mut self, processes: Vec<WorkerProcess>) -> Result<()> {
        let mut first_error = None;
        for mut process in processes {
            if let Err(e) = process.terminate() {
                warn!("Failed to terminate worker {}: {}", process.pid(), e);
                first_error.get_or_insert(e);
            }
            self.terminating.push(process);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
