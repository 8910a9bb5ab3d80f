//! Per-worker session: identity plus exit cleanup

use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::manager::{Binding, SharedQueueManager};

/// Identity a worker presents to the fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerId {
    /// OS process id; owner token for latches and slots
    pub pid: u32,
    /// Cluster node this worker acts for
    pub node: i32,
}

/// A worker's view of the fabric.
///
/// Tracks every queue name the worker acquired and releases them all when
/// the session ends, so an unexpected worker exit can never leave a
/// producer waiting on this worker's slots.
pub struct QueueSession {
    manager: Arc<SharedQueueManager>,
    id: WorkerId,
    held: Vec<String>,
}

impl QueueSession {
    /// Session for the current process acting for `node`
    pub fn new(manager: Arc<SharedQueueManager>, node: i32) -> Self {
        Self::with_identity(
            manager,
            WorkerId {
                pid: std::process::id(),
                node,
            },
        )
    }

    /// Session with an explicit identity (multi-worker harnesses)
    pub fn with_identity(manager: Arc<SharedQueueManager>, id: WorkerId) -> Self {
        Self {
            manager,
            id,
            held: Vec::new(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn manager(&self) -> &Arc<SharedQueueManager> {
        &self.manager
    }

    /// Reserve the named queue for `nconsumers` and remember to release it
    pub fn acquire(&mut self, name: &str, nconsumers: usize) -> Result<()> {
        self.manager.acquire(self.id, name, nconsumers)?;
        self.held.push(name.to_string());
        Ok(())
    }

    /// Bind to the named queue; see [`SharedQueueManager::bind`]
    pub fn bind(
        &self,
        name: &str,
        consumer_nodes: &[i32],
        distribution_nodes: &[i32],
    ) -> Result<Binding> {
        SharedQueueManager::bind(&self.manager, self.id, name, consumer_nodes, distribution_nodes)
    }

    /// Release one held queue
    pub fn release(&mut self, name: &str) -> Result<()> {
        self.manager.release(self.id, name)?;
        if let Some(pos) = self.held.iter().position(|held| held == name) {
            self.held.remove(pos);
        }
        Ok(())
    }

    /// Tell the fabric this worker's node will not read the named queue
    pub fn disconnect_consumer(&self, name: &str) {
        self.manager.disconnect_consumer(self.id, name);
    }

    /// Release every queue this session still holds
    pub fn release_all(&mut self) {
        while let Some(name) = self.held.pop() {
            if let Err(err) = self.manager.release(self.id, &name) {
                warn!(queue = %name, error = %err, "release at session end failed");
            }
        }
    }
}

impl Drop for QueueSession {
    fn drop(&mut self) {
        self.release_all();
    }
}
