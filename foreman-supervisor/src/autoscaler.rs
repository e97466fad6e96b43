//! Load-based process distribution
//!
//! The auto-scaler is a pure decision: given how many workers each pool runs and how much
//! work waits on each queue, it returns the process count every pool should move to. The
//! supervisor gathers the inputs and applies the result through `balance`.
//!
//! Each run moves a pool by at most `balance_max_shift` processes, keeps every pool within
//! `[min_processes, max_processes]`, and never lets the supervisor's total exceed
//! `max_processes`. Pools that need fewer workers are settled first so capacity they
//! release is available to busier pools in the same run.

use foreman_core::metrics::QueueLoad;
use foreman_core::options::{ScalingStrategy, SupervisorOptions};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Current size of one pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolState {
    /// Queue identifier of the pool
    pub queue: String,
    /// Active processes in the pool
    pub processes: usize,
}

impl PoolState {
    pub fn new(queue: impl Into<String>, processes: usize) -> Self {
        Self {
            queue: queue.into(),
            processes,
        }
    }
}

/// Computes target process counts from queue load
#[derive(Debug, Clone, Copy)]
pub struct AutoScaler<'a> {
    options: &'a SupervisorOptions,
}

impl<'a> AutoScaler<'a> {
    pub fn new(options: &'a SupervisorOptions) -> Self {
        Self { options }
    }

    /// Target process count for every pool
    ///
    /// `total_processes` is the supervisor-wide count including workers still
    /// terminating; it bounds how far pools may grow.
    pub fn scale(
        &self,
        pools: &[PoolState],
        loads: &HashMap<String, QueueLoad>,
        total_processes: usize,
    ) -> BTreeMap<String, usize> {
        let desired = self.desired_processes(pools, loads);

        let mut order: Vec<usize> = (0..pools.len()).collect();
        order.sort_by(|&a, &b| desired[a].total_cmp(&desired[b]));

        let mut total = total_processes;
        let mut targets = BTreeMap::new();

        for index in order {
            let pool = &pools[index];
            let wanted = self.clamp(desired[index]);
            let current = pool.processes;
            let shift = self.options.balance_max_shift;

            let next = if wanted > current {
                let room = self.options.max_processes.saturating_sub(total).min(shift);
                (current + room).min(wanted)
            } else if wanted < current {
                let room = total.saturating_sub(self.options.min_processes).min(shift);
                current.saturating_sub(room).max(wanted)
            } else {
                current
            };

            if next != current {
                debug!(
                    "Auto-scaling {} from {} to {} (wanted {})",
                    pool.queue, current, next, wanted
                );
            }

            total = (total + next).saturating_sub(current);
            targets.insert(pool.queue.clone(), next);
        }

        targets
    }

    /// Unbounded share of `max_processes` each pool should run
    fn desired_processes(
        &self,
        pools: &[PoolState],
        loads: &HashMap<String, QueueLoad>,
    ) -> Vec<f64> {
        let load_of = |pool: &PoolState| loads.get(&pool.queue).copied().unwrap_or_default();
        let signal = |load: QueueLoad| match self.options.auto_scaling_strategy {
            ScalingStrategy::Time => load.time_to_clear().as_secs_f64(),
            ScalingStrategy::Size => load.size as f64,
        };

        let total_signal: f64 = pools.iter().map(|pool| signal(load_of(pool))).sum();
        let max = self.options.max_processes as f64;
        let min = self.options.min_processes as f64;

        pools
            .iter()
            .map(|pool| {
                let load = load_of(pool);
                if total_signal > 0.0 {
                    signal(load) * max / total_signal
                } else if load.size > 0 {
                    // Jobs waiting with no runtime history yet
                    max
                } else {
                    min
                }
            })
            .collect()
    }

    fn clamp(&self, desired: f64) -> usize {
        let desired = desired.ceil().max(0.0) as usize;
        desired
            .max(self.options.min_processes)
            .min(self.options.max_processes.max(self.options.min_processes))
    }
}
