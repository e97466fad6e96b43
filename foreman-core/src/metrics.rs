//! Queue load signals consumed by the auto-scaler

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Load on one queue at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueLoad {
    /// Jobs ready to run now
    pub size: u64,
    /// Average job runtime
    pub runtime: Duration,
}

impl QueueLoad {
    /// Create a load snapshot
    pub fn new(size: u64, runtime: Duration) -> Self {
        Self { size, runtime }
    }

    /// Estimated time for one worker to clear the queue
    pub fn time_to_clear(&self) -> Duration {
        self.runtime
            .saturating_mul(u32::try_from(self.size).unwrap_or(u32::MAX))
    }

    /// Combine two loads (used for single-pool queue lists)
    pub fn merge(self, other: QueueLoad) -> QueueLoad {
        let size = self.size + other.size;
        let runtime = if size == 0 {
            Duration::ZERO
        } else {
            // Size-weighted average runtime
            let total = self.time_to_clear() + other.time_to_clear();
            total / u32::try_from(size).unwrap_or(u32::MAX)
        };
        QueueLoad { size, runtime }
    }
}

/// Trait for per-queue load sources
#[async_trait]
pub trait QueueMetrics: Send + Sync {
    /// Number of jobs ready to run on `queue`
    async fn ready_now(&self, queue: &str) -> Result<u64>;

    /// Average runtime of jobs on `queue`
    async fn runtime_for_queue(&self, queue: &str) -> Result<Duration>;

    /// Load snapshot for `queue`
    async fn load(&self, queue: &str) -> Result<QueueLoad> {
        Ok(QueueLoad::new(
            self.ready_now(queue).await?,
            self.runtime_for_queue(queue).await?,
        ))
    }
}

/// Metrics source with fixed, externally updated values
#[derive(Debug, Clone, Default)]
pub struct StaticQueueMetrics {
    loads: Arc<RwLock<HashMap<String, QueueLoad>>>,
}

impl StaticQueueMetrics {
    /// Create a source reporting zero load everywhere
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the load reported for `queue`
    pub async fn set(&self, queue: impl Into<String>, load: QueueLoad) {
        self.loads.write().await.insert(queue.into(), load);
    }
}

#[async_trait]
impl QueueMetrics for StaticQueueMetrics {
    async fn ready_now(&self, queue: &str) -> Result<u64> {
        Ok(self
            .loads
            .read()
            .await
            .get(queue)
            .map(|load| load.size)
            .unwrap_or(0))
    }

    async fn runtime_for_queue(&self, queue: &str) -> Result<Duration> {
        Ok(self
            .loads
            .read()
            .await
            .get(queue)
            .map(|load| load.runtime)
            .unwrap_or_default())
    }
}
