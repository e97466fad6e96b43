//! Command queue abstraction
//!
//! The command queue is the mailbox through which external actors (the CLI, dashboards,
//! other supervisors) reach a running supervisor. Any number of writers may push; only the
//! supervisor that owns the name drains, and every drained command is delivered at most once.

use crate::command::Command;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Trait for command queue backends
#[async_trait]
pub trait CommandQueue: Send + Sync {
    /// Queue a command for the supervisor named in `command.supervisor`
    async fn push(&self, command: Command) -> Result<()>;

    /// Remove and return every pending command for `supervisor`, oldest first
    async fn pending(&self, supervisor: &str) -> Result<Vec<Command>>;

    /// Discard every pending command for `supervisor`
    async fn flush(&self, supervisor: &str) -> Result<()>;
}

/// In-memory command queue
#[derive(Debug, Clone, Default)]
pub struct InMemoryCommandQueue {
    commands: Arc<Mutex<HashMap<String, VecDeque<Command>>>>,
}

impl InMemoryCommandQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commands waiting for `supervisor`
    pub async fn len(&self, supervisor: &str) -> usize {
        self.commands
            .lock()
            .await
            .get(supervisor)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl CommandQueue for InMemoryCommandQueue {
    async fn push(&self, command: Command) -> Result<()> {
        let mut commands = self.commands.lock().await;
        commands
            .entry(command.supervisor.clone())
            .or_default()
            .push_back(command);
        Ok(())
    }

    async fn pending(&self, supervisor: &str) -> Result<Vec<Command>> {
        let mut commands = self.commands.lock().await;
        Ok(commands
            .remove(supervisor)
            .map(Vec::from)
            .unwrap_or_default())
    }

    async fn flush(&self, supervisor: &str) -> Result<()> {
        self.commands.lock().await.remove(supervisor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;

    #[tokio::test]
    async fn test_pending_drains_in_fifo_order() {
        let queue = InMemoryCommandQueue::new();
        queue.push(Command::scale("email", 3)).await.unwrap();
        queue
            .push(Command::new("email", CommandKind::Pause))
            .await
            .unwrap();
        queue.push(Command::scale("billing", 1)).await.unwrap();

        let pending = queue.pending("email").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].kind, CommandKind::Scale { processes: 3 });
        assert_eq!(pending[1].kind, CommandKind::Pause);

        // Drained commands are gone, other names are untouched
        assert!(queue.pending("email").await.unwrap().is_empty());
        assert_eq!(queue.len("billing").await, 1);
    }

    #[tokio::test]
    async fn test_flush_discards_only_named_supervisor() {
        let queue = InMemoryCommandQueue::new();
        queue.push(Command::scale("email", 3)).await.unwrap();
        queue.push(Command::scale("billing", 1)).await.unwrap();

        queue.flush("email").await.unwrap();

        assert_eq!(queue.len("email").await, 0);
        assert_eq!(queue.len("billing").await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let queue = InMemoryCommandQueue::new();
        let mut handles = Vec::new();
        for i in 0..16 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.push(Command::scale("email", i)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(queue.pending("email").await.unwrap().len(), 16);
    }
}
