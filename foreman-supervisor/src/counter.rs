//! OS process table cross-check
//!
//! The supervisor's bookkeeping can drift from reality (a worker reparented, a pid reused).
//! A [`SystemProcessCounter`] asks the OS how many worker processes claim a supervisor.

use crate::Result;
use std::collections::HashMap;

/// Counts worker processes in the OS process table
pub trait SystemProcessCounter: Send + Sync {
    /// Number of live processes started with `--supervisor=<supervisor>`
    fn count(&self, supervisor: &str) -> Result<usize>;
}

/// Counter reading the process table through `procfs`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcfsCounter;

impl ProcfsCounter {
    pub fn new() -> Self {
        Self
    }
}

/// Whether a worker command line carries `--supervisor=<supervisor>`
pub fn claims_supervisor<S: AsRef<str>>(cmdline: &[S], supervisor: &str) -> bool {
    let needle = format!("--supervisor={}", supervisor);
    cmdline.iter().any(|arg| arg.as_ref() == needle)
}

/// Count process trees from `(pid, ppid)` pairs of claiming processes
///
/// A claiming process whose parent also claims is a fork of a worker (a subshell, a
/// child that has not exec'd yet) and is not counted again.
pub fn count_worker_trees(claims: impl IntoIterator<Item = (i32, i32)>) -> usize {
    let claims: HashMap<i32, i32> = claims.into_iter().collect();
    claims
        .values()
        .filter(|ppid| !claims.contains_key(ppid))
        .count()
}

#[cfg(target_os = "linux")]
impl SystemProcessCounter for ProcfsCounter {
    fn count(&self, supervisor: &str) -> Result<usize> {
        let processes = procfs::process::all_processes().map_err(|e| {
            crate::SupervisorError::Process(format!("cannot read process table: {}", e))
        })?;

        // Processes may exit between listing and reading
        let claims = processes.filter_map(|process| process.ok()).filter_map(|process| {
            let cmdline = process.cmdline().ok()?;
            if !claims_supervisor(cmdline.as_slice(), supervisor) {
                return None;
            }
            let stat = process.stat().ok()?;
            Some((process.pid(), stat.ppid))
        });

        Ok(count_worker_trees(claims))
    }
}

#[cfg(not(target_os = "linux"))]
impl SystemProcessCounter for ProcfsCounter {
    fn count(&self, _supervisor: &str) -> Result<usize> {
        Err(crate::SupervisorError::Process(
            "process table inspection needs procfs".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_supervisor_exact_argument() {
        let cmdline = ["php", "artisan", "queue:work", "--supervisor=email", "--queue=high"];
        assert!(claims_supervisor(&cmdline[..], "email"));
        assert!(!claims_supervisor(&cmdline[..], "mail"));
        assert!(!claims_supervisor(&cmdline[..], "email-2"));
    }

    #[test]
    fn test_forks_of_a_worker_count_once() {
        // 101 and 102 are workers of supervisor 1; 103 is a subshell forked by 101;
        // 104 was orphaned and reparented to init
        let claims = [(101, 1), (102, 1), (103, 101), (104, 1)];
        assert_eq!(count_worker_trees(claims), 3);
        assert_eq!(count_worker_trees([]), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_procfs_counter_sees_spawned_worker() {
        let supervisor = format!("counter-{}", std::process::id());
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("( sleep 1; sleep 1 ) & wait")
            .arg("foreman-worker")
            .arg(format!("--supervisor={}", supervisor))
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let counter = ProcfsCounter::new();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while counter.count(&supervisor).unwrap() != 1 {
            assert!(tokio::time::Instant::now() < deadline, "worker never showed up");
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        // The forked subshell carries the same argument but is not a second worker
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(counter.count(&supervisor).unwrap(), 1);

        child.kill().await.unwrap();
    }
}
