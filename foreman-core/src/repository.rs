//! Supervisor repository abstraction
//!
//! Every running supervisor writes its live state here once per tick. The repository is
//! the only place the rest of the system learns which supervisors exist, so it doubles as
//! the duplicate-name guard at startup.

use crate::error::Result;
use crate::options::SupervisorOptions;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Steady state a supervisor reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorStatus {
    /// Dispatching and monitoring workers
    Running,
    /// Workers are paused
    Paused,
}

impl std::fmt::Display for SupervisorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorStatus::Running => write!(f, "running"),
            SupervisorStatus::Paused => write!(f, "paused"),
        }
    }
}

impl std::str::FromStr for SupervisorStatus {
    type Err = crate::error::ForemanError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(SupervisorStatus::Running),
            "paused" => Ok(SupervisorStatus::Paused),
            other => Err(crate::error::ForemanError::InvalidRecord(format!(
                "unknown supervisor status: {}",
                other
            ))),
        }
    }
}

/// Persisted snapshot of one supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorRecord {
    /// Supervisor name
    pub name: String,

    /// Master portion of the name, empty for standalone supervisors
    pub master: String,

    /// OS process id of the supervisor
    pub pid: u32,

    /// Running or paused
    pub status: SupervisorStatus,

    /// Active process count per `connection:queue`
    pub processes: BTreeMap<String, usize>,

    /// Options the supervisor runs with
    pub options: SupervisorOptions,

    /// Time of the last write
    pub updated_at: DateTime<Utc>,
}

impl SupervisorRecord {
    /// Total active processes across pools
    pub fn total_processes(&self) -> usize {
        self.processes.values().sum()
    }
}

/// Trait for supervisor repository backends
#[async_trait]
pub trait SupervisorRepository: Send + Sync {
    /// Look up a supervisor by name
    async fn find(&self, name: &str) -> Result<Option<SupervisorRecord>>;

    /// Insert or replace the record for `record.name`
    async fn update(&self, record: &SupervisorRecord) -> Result<()>;

    /// Remove a supervisor's record
    async fn forget(&self, name: &str) -> Result<()>;

    /// Names of supervisors that wrote recently
    async fn names(&self) -> Result<Vec<String>>;

    /// Drop records that have not been written for `max_age`
    async fn flush_expired(&self, max_age: Duration) -> Result<()>;
}

/// In-memory supervisor repository
#[derive(Debug, Clone, Default)]
pub struct InMemorySupervisorRepository {
    records: Arc<RwLock<HashMap<String, SupervisorRecord>>>,
}

impl InMemorySupervisorRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SupervisorRepository for InMemorySupervisorRepository {
    async fn find(&self, name: &str) -> Result<Option<SupervisorRecord>> {
        Ok(self.records.read().await.get(name).cloned())
    }

    async fn update(&self, record: &SupervisorRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn forget(&self, name: &str) -> Result<()> {
        self.records.write().await.remove(name);
        Ok(())
    }

    async fn names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.records.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn flush_expired(&self, max_age: Duration) -> Result<()> {
        let Some(cutoff) = ChronoDuration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(());
        };
        self.records
            .write()
            .await
            .retain(|_, record| record.updated_at >= cutoff);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, updated_at: DateTime<Utc>) -> SupervisorRecord {
        SupervisorRecord {
            name: name.to_string(),
            master: String::new(),
            pid: 42,
            status: SupervisorStatus::Running,
            processes: BTreeMap::from([
                ("redis:high".to_string(), 3),
                ("redis:low".to_string(), 2),
            ]),
            options: SupervisorOptions::new(name, ["high", "low"]),
            updated_at,
        }
    }

    #[tokio::test]
    async fn test_update_find_forget() {
        let repository = InMemorySupervisorRepository::new();
        assert!(repository.find("email").await.unwrap().is_none());

        repository.update(&record("email", Utc::now())).await.unwrap();
        let found = repository.find("email").await.unwrap().unwrap();
        assert_eq!(found.total_processes(), 5);

        repository.forget("email").await.unwrap();
        assert!(repository.find("email").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_writes_are_scoped_by_name() {
        let repository = InMemorySupervisorRepository::new();
        repository.update(&record("email", Utc::now())).await.unwrap();
        repository.update(&record("billing", Utc::now())).await.unwrap();

        repository.forget("email").await.unwrap();

        assert_eq!(repository.names().await.unwrap(), vec!["billing".to_string()]);
    }

    #[tokio::test]
    async fn test_flush_expired() {
        let repository = InMemorySupervisorRepository::new();
        repository
            .update(&record("stale", Utc::now() - ChronoDuration::seconds(60)))
            .await
            .unwrap();
        repository.update(&record("fresh", Utc::now())).await.unwrap();

        repository
            .flush_expired(Duration::from_secs(14))
            .await
            .unwrap();

        assert_eq!(repository.names().await.unwrap(), vec!["fresh".to_string()]);
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(
            "paused".parse::<SupervisorStatus>().unwrap(),
            SupervisorStatus::Paused
        );
        assert!("stopped".parse::<SupervisorStatus>().is_err());
    }
}
