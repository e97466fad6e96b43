//! Redis-backed command queue, supervisor repository, and queue metrics
//!
//! Key layout (with the default `foreman:` prefix):
//!
//! | Key                              | Type       | Contents                           |
//! |----------------------------------|------------|------------------------------------|
//! | `foreman:commands:{name}`        | list       | JSON [`Command`]s, oldest first    |
//! | `foreman:supervisor:{name}`      | hash       | one [`SupervisorRecord`], 30s TTL  |
//! | `foreman:supervisors`            | sorted set | names scored by last write         |
//! | `foreman:metrics:queue:{queue}`  | hash       | `runtime` in milliseconds          |
//! | `queues:{queue}`                 | list       | pending jobs (owned by transport)  |

use crate::command::Command;
use crate::error::{ForemanError, Result};
use crate::metrics::QueueMetrics;
use crate::queue::CommandQueue;
use crate::repository::{SupervisorRecord, SupervisorRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, aio::ConnectionManager};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Seconds a supervisor record survives without being rewritten
pub const RECORD_TTL_SECS: i64 = 30;

/// Records older than this are not listed by [`SupervisorRepository::names`]
pub const RECENT_WINDOW_SECS: i64 = 29;

/// Key builder for a given prefix
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    /// Create a key builder
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Pending commands for a supervisor
    pub fn commands(&self, name: &str) -> String {
        format!("{}commands:{}", self.prefix, name)
    }

    /// Record hash for a supervisor
    pub fn supervisor(&self, name: &str) -> String {
        format!("{}supervisor:{}", self.prefix, name)
    }

    /// Index of known supervisors
    pub fn supervisors(&self) -> String {
        format!("{}supervisors", self.prefix)
    }

    /// Runtime metrics for a queue
    pub fn queue_metrics(&self, queue: &str) -> String {
        format!("{}metrics:queue:{}", self.prefix, queue)
    }

    /// Job list of a queue, as written by the queue transport
    pub fn queue_jobs(queue: &str) -> String {
        format!("queues:{}", queue)
    }
}

/// Shared Redis connection used by all Redis-backed stores
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    keys: Keys,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"ConnectionManager")
            .field("keys", &self.keys)
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis at `url`
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        info!("Connecting to Redis at {}", url);

        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!("Connected to Redis");

        Ok(Self {
            conn,
            keys: Keys::new(prefix),
        })
    }

    /// Command queue over this connection
    pub fn command_queue(&self) -> RedisCommandQueue {
        RedisCommandQueue {
            store: self.clone(),
        }
    }

    /// Supervisor repository over this connection
    pub fn repository(&self) -> RedisSupervisorRepository {
        RedisSupervisorRepository {
            store: self.clone(),
        }
    }

    /// Queue metrics over this connection
    pub fn metrics(&self) -> RedisQueueMetrics {
        RedisQueueMetrics {
            store: self.clone(),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

/// Command queue stored in Redis lists
#[derive(Debug, Clone)]
pub struct RedisCommandQueue {
    store: RedisStore,
}

#[async_trait]
impl CommandQueue for RedisCommandQueue {
    async fn push(&self, command: Command) -> Result<()> {
        let key = self.store.keys.commands(&command.supervisor);
        let payload = serde_json::to_string(&command)?;
        debug!("Queueing {} command for {}", command.kind.name(), command.supervisor);

        let mut conn = self.store.conn();
        conn.rpush::<_, _, ()>(key, payload).await?;
        Ok(())
    }

    async fn pending(&self, supervisor: &str) -> Result<Vec<Command>> {
        let key = self.store.keys.commands(supervisor);
        let mut conn = self.store.conn();

        // Read and delete in one transaction so a command is never delivered twice
        let (payloads, _): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .lrange(&key, 0, -1)
            .del(&key)
            .query_async(&mut conn)
            .await?;

        let mut commands = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_str::<Command>(&payload) {
                Ok(command) => commands.push(command),
                Err(e) => warn!("Discarding malformed command for {}: {}", supervisor, e),
            }
        }
        Ok(commands)
    }

    async fn flush(&self, supervisor: &str) -> Result<()> {
        let mut conn = self.store.conn();
        conn.del::<_, ()>(self.store.keys.commands(supervisor)).await?;
        Ok(())
    }
}

/// Supervisor repository stored in Redis hashes
#[derive(Debug, Clone)]
pub struct RedisSupervisorRepository {
    store: RedisStore,
}

/// Flatten a record into hash fields
pub fn record_fields(record: &SupervisorRecord) -> Result<Vec<(&'static str, String)>> {
    Ok(vec![
        ("name", record.name.clone()),
        ("master", record.master.clone()),
        ("pid", record.pid.to_string()),
        ("status", record.status.to_string()),
        ("processes", serde_json::to_string(&record.processes)?),
        ("options", record.options.to_json()?),
        ("updated_at", record.updated_at.to_rfc3339()),
    ])
}

/// Rebuild a record from hash fields; an empty hash means no record
pub fn record_from_fields(fields: &HashMap<String, String>) -> Result<Option<SupervisorRecord>> {
    if fields.is_empty() {
        return Ok(None);
    }

    let field = |name: &str| {
        fields.get(name).ok_or_else(|| {
            ForemanError::InvalidRecord(format!("supervisor record is missing {}", name))
        })
    };

    let pid = field("pid")?
        .parse()
        .map_err(|e| ForemanError::InvalidRecord(format!("invalid pid: {}", e)))?;
    let updated_at = DateTime::parse_from_rfc3339(field("updated_at")?)
        .map_err(|e| ForemanError::InvalidRecord(format!("invalid updated_at: {}", e)))?
        .with_timezone(&Utc);

    Ok(Some(SupervisorRecord {
        name: field("name")?.clone(),
        master: field("master")?.clone(),
        pid,
        status: field("status")?.parse()?,
        processes: serde_json::from_str(field("processes")?)?,
        options: serde_json::from_str(field("options")?)?,
        updated_at,
    }))
}

#[async_trait]
impl SupervisorRepository for RedisSupervisorRepository {
    async fn find(&self, name: &str) -> Result<Option<SupervisorRecord>> {
        let mut conn = self.store.conn();
        let fields: HashMap<String, String> =
            conn.hgetall(self.store.keys.supervisor(name)).await?;
        record_from_fields(&fields)
    }

    async fn update(&self, record: &SupervisorRecord) -> Result<()> {
        let key = self.store.keys.supervisor(&record.name);
        let fields = record_fields(record)?;
        let mut conn = self.store.conn();

        redis::pipe()
            .hset_multiple(&key, &fields)
            .ignore()
            .expire(&key, RECORD_TTL_SECS)
            .ignore()
            .zadd(
                self.store.keys.supervisors(),
                &record.name,
                record.updated_at.timestamp(),
            )
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn forget(&self, name: &str) -> Result<()> {
        let mut conn = self.store.conn();
        redis::pipe()
            .atomic()
            .del(self.store.keys.supervisor(name))
            .ignore()
            .zrem(self.store.keys.supervisors(), name)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn names(&self) -> Result<Vec<String>> {
        let mut conn = self.store.conn();
        let since = Utc::now().timestamp() - RECENT_WINDOW_SECS;
        let names: Vec<String> = conn
            .zrangebyscore(self.store.keys.supervisors(), since, "+inf")
            .await?;
        Ok(names)
    }

    async fn flush_expired(&self, max_age: Duration) -> Result<()> {
        let mut conn = self.store.conn();
        let cutoff = Utc::now().timestamp() - max_age.as_secs() as i64;
        conn.zrembyscore::<_, _, _, ()>(self.store.keys.supervisors(), "-inf", cutoff)
            .await?;
        Ok(())
    }
}

/// Queue metrics read from the transport's job lists
#[derive(Debug, Clone)]
pub struct RedisQueueMetrics {
    store: RedisStore,
}

#[async_trait]
impl QueueMetrics for RedisQueueMetrics {
    async fn ready_now(&self, queue: &str) -> Result<u64> {
        let mut conn = self.store.conn();
        let size: u64 = conn.llen(Keys::queue_jobs(queue)).await?;
        Ok(size)
    }

    async fn runtime_for_queue(&self, queue: &str) -> Result<Duration> {
        let mut conn = self.store.conn();
        let runtime: Option<f64> = conn
            .hget(self.store.keys.queue_metrics(queue), "runtime")
            .await?;
        let seconds = runtime.unwrap_or(0.0).max(0.0) / 1000.0;
        Ok(Duration::try_from_secs_f64(seconds).unwrap_or_default())
    }
}
