//! Per-node timeout timers.
//!
//! A timer is armed when a node starts running and cancelled when it reaches
//! a final status. Firing only queues an [`EngineJob::Timeout`]; the decision
//! of what to expire is made by
//! [`InterruptManager::on_timeout`](super::InterruptManager::on_timeout).

use std::time::Duration;

use dashmap::DashMap;
use log::{debug, trace};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::waiter::{EngineJob, JobSender};

pub struct TimeoutTracker {
    timers: DashMap<Uuid, CancellationToken>,
    jobs: JobSender,
    handle: Handle,
}

impl TimeoutTracker {
    pub fn new(jobs: JobSender, handle: Handle) -> Self {
        Self {
            timers: DashMap::new(),
            jobs,
            handle,
        }
    }

    /// Arms (or re-arms) the timer for a node execution.
    pub fn arm(&self, node_execution_id: Uuid, after: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self.timers.insert(node_execution_id, token.clone()) {
            previous.cancel();
        }
        debug!(
            "Timeout for node execution '{}' armed ({}s)",
            node_execution_id,
            after.as_secs_f64()
        );

        let jobs = self.jobs.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!("Timeout for '{}' cancelled", node_execution_id);
                }
                _ = tokio::time::sleep(after) => {
                    jobs.send(EngineJob::Timeout(node_execution_id));
                }
            }
        });
    }

    /// Cancels a node's timer. Returns false if none was armed.
    pub fn cancel(&self, node_execution_id: Uuid) -> bool {
        match self.timers.remove(&node_execution_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn armed(&self) -> usize {
        self.timers.len()
    }
}
