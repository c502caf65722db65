//! Plan Execution Snapshots
//!
//! A JSON image of one plan execution: the plan execution record, every
//! node execution and every interrupt registered against it.
//!
//! Snapshots are written to `{state_dir}/{plan_execution_id}.state` when a
//! plan ends, and on demand. [`Engine::recover`] loads one back into the
//! repositories and re-arms what was in flight.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::adviser::AdviserResponse;
use crate::interrupt::{Interrupt, InterruptState};
use crate::waiter::{EngineJob, ErrorResponse, NotifyCallback};

use super::engine::{Engine, EngineError};
use super::node::NodeExecution;
use super::plan_execution::PlanExecution;
use super::status::Status;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to access snapshot {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed snapshot: {0}")]
    Format(#[from] serde_json::Error),
}

impl From<SnapshotError> for EngineError {
    fn from(e: SnapshotError) -> Self {
        EngineError::Snapshot(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ExecutionSnapshot {
    pub plan_execution: PlanExecution,
    pub node_executions: Vec<NodeExecution>,
    #[serde(default)]
    pub interrupts: Vec<Interrupt>,
    pub saved_at: DateTime<Utc>,
}

impl ExecutionSnapshot {
    pub fn path_for(state_dir: &Path, plan_execution_id: &str) -> PathBuf {
        state_dir.join(format!("{}.state", plan_execution_id))
    }

    /// Writes the snapshot into `state_dir`, creating it if needed.
    pub fn save(&self, state_dir: &Path) -> Result<PathBuf, SnapshotError> {
        fs::create_dir_all(state_dir).map_err(|source| SnapshotError::Io {
            path: state_dir.display().to_string(),
            source,
        })?;

        let path = Self::path_for(state_dir, &self.plan_execution.uuid);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|source| SnapshotError::Io {
            path: path.display().to_string(),
            source,
        })?;

        info!("Saved execution snapshot to {}", path.display());
        Ok(path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| SnapshotError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let snapshot: ExecutionSnapshot = serde_json::from_str(&content)?;
        info!(
            "Loaded snapshot of '{}' ({} node executions)",
            snapshot.plan_execution.uuid,
            snapshot.node_executions.len()
        );
        Ok(snapshot)
    }

    /// Deletes the snapshot file, if present.
    pub fn delete(state_dir: &Path, plan_execution_id: &str) -> Result<(), SnapshotError> {
        let path = Self::path_for(state_dir, plan_execution_id);
        if path.exists() {
            fs::remove_file(&path).map_err(|source| SnapshotError::Io {
                path: path.display().to_string(),
                source,
            })?;
            info!("Deleted snapshot: {}", path.display());
        }
        Ok(())
    }
}

impl Engine {
    /// Captures the current state of a plan execution.
    pub fn snapshot(&self, plan_execution_id: &str) -> Result<ExecutionSnapshot, EngineError> {
        let plan_execution = self.plan_executions.get(plan_execution_id)?;
        let mut node_executions = self.nodes.find_by_plan_execution(plan_execution_id);
        node_executions.sort_by_key(|ne| ne.created_at);
        let interrupts = self
            .interrupts
            .repository()
            .find_by_plan_execution(plan_execution_id);

        Ok(ExecutionSnapshot {
            plan_execution,
            node_executions,
            interrupts,
            saved_at: Utc::now(),
        })
    }

    /// Writes a snapshot to the configured state directory.
    pub fn write_snapshot(&self, plan_execution_id: &str) -> Result<PathBuf, EngineError> {
        let state_dir = self.config.state_dir.as_ref().ok_or_else(|| {
            EngineError::Snapshot("no state directory configured".to_string())
        })?;
        let snapshot = self.snapshot(plan_execution_id)?;
        Ok(snapshot.save(state_dir)?)
    }

    /// Rehydrates a snapshot and puts in-flight work back in motion.
    ///
    /// - QUEUED nodes are started again
    /// - RUNNING nodes lost their step call and are errored
    /// - WAITING nodes wait again on their pending correlation ids; children
    ///   that had already reported are reported again. Their timeout is armed
    ///   with whatever was left of it
    /// - INTERVENTION_WAITING nodes get their intervention timeout back, less
    ///   the time already spent parked
    /// - interrupts that were registered but not yet applied are applied
    ///
    /// Returns the number of nodes put back in motion.
    pub fn recover(&self, snapshot: ExecutionSnapshot) -> Result<usize, EngineError> {
        let plan_execution_id = snapshot.plan_execution.uuid.clone();
        let plan_status = snapshot.plan_execution.status;

        self.plan_executions.save(snapshot.plan_execution)?;
        for node_execution in &snapshot.node_executions {
            self.nodes.save(node_execution.clone())?;
        }
        let mut unapplied = Vec::new();
        for mut interrupt in snapshot.interrupts {
            if matches!(
                interrupt.state,
                InterruptState::Registered | InterruptState::Processing
            ) {
                interrupt.state = InterruptState::Registered;
                unapplied.push(interrupt.uuid);
            }
            self.interrupts.repository().save(interrupt)?;
        }
        self.track(&plan_execution_id, plan_status);

        if plan_status.is_final() {
            info!(
                "Recovered plan execution '{}' is already {}",
                plan_execution_id, plan_status
            );
            return Ok(0);
        }

        let now = Utc::now();
        let mut revived = 0;
        for node_execution in &snapshot.node_executions {
            match node_execution.status {
                Status::Queued => {
                    self.jobs.send(EngineJob::StartNode {
                        node_execution_id: node_execution.uuid,
                    });
                    revived += 1;
                }
                Status::Running => {
                    self.jobs.send(EngineJob::Fail {
                        node_execution_id: node_execution.uuid,
                        error: ErrorResponse::new(
                            "Engine restarted while the step was running",
                            Vec::new(),
                        ),
                    });
                    revived += 1;
                }
                Status::Waiting(mode) => {
                    self.rearm_wait(node_execution, mode.spawns_children());
                    self.rearm_timeout(node_execution, now)?;
                    revived += 1;
                }
                Status::InterventionWaiting => {
                    if self.rearm_intervention(node_execution, now) {
                        revived += 1;
                    }
                }
                _ => {}
            }
        }

        for interrupt_id in unapplied {
            debug!("Re-queueing unapplied interrupt '{}'", interrupt_id);
            self.jobs.send(EngineJob::ApplyInterrupt(interrupt_id));
        }

        info!(
            "Recovered plan execution '{}', {} node(s) back in motion",
            plan_execution_id, revived
        );
        Ok(revived)
    }

    fn rearm_wait(&self, node_execution: &NodeExecution, children: bool) {
        let correlation_ids = node_execution.pending_correlation_ids();
        debug!(
            "Re-arming wait of node '{}' on {} id(s)",
            node_execution.identifier,
            correlation_ids.len()
        );
        self.waiter.wait_for_all(
            NotifyCallback::Resume {
                node_execution_id: node_execution.uuid,
            },
            correlation_ids.clone(),
        );

        if !children {
            return;
        }
        // A child chain that already ended reported into the lost waiter.
        for correlation_id in correlation_ids {
            if let Some(last) = self.chain_end(node_execution.uuid, &correlation_id) {
                warn!(
                    "Child '{}' had already finished, reporting it again",
                    last.identifier
                );
                self.waiter.notify_success(
                    &correlation_id,
                    json!({ "status": last.status, "node_execution_id": last.uuid }),
                );
            }
        }
    }

    fn rearm_timeout(
        &self,
        node_execution: &NodeExecution,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let node = self
            .plans
            .get_node(node_execution.ambiance.plan_id(), &node_execution.node_id)?;
        if let Some(timeout) = node.timeout() {
            let started = node_execution.start_ts.unwrap_or(now);
            self.timeouts
                .arm(node_execution.uuid, remaining(timeout, started, now));
        }
        Ok(())
    }

    fn rearm_intervention(&self, node_execution: &NodeExecution, now: DateTime<Utc>) -> bool {
        let Some(AdviserResponse::ManualIntervention {
            timeout_secs: Some(secs),
            timeout_action,
        }) = &node_execution.adviser_response
        else {
            return false;
        };
        let parked = node_execution
            .end_ts
            .or(node_execution.start_ts)
            .unwrap_or(now);
        self.schedule_intervention_timeout(
            node_execution,
            remaining(Duration::from_secs(*secs), parked, now),
            *timeout_action,
        );
        true
    }

    /// The finished last node of the child chain reporting under
    /// `correlation_id`, if the chain has ended.
    fn chain_end(&self, parent_id: uuid::Uuid, correlation_id: &str) -> Option<NodeExecution> {
        self.latest_children(parent_id)
            .into_iter()
            .filter(|c| c.notify_id.to_string() == correlation_id)
            .find(|c| c.is_final() && c.next_id.is_none())
    }
}

/// What is left of `budget` counted from `since`; zero once it ran out.
fn remaining(budget: Duration, since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let elapsed = (now - since).to_std().unwrap_or_default();
    budget.saturating_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::node::NodeExecution;
    use crate::plan::{Ambiance, Level, PlanNode, StepType};
    use std::collections::HashMap;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn snapshot() -> ExecutionSnapshot {
        let node = PlanNode::new("n1", "build", StepType::step("NOOP"));
        let id = Uuid::new_v4();
        let ambiance =
            Ambiance::new("exec-1", "plan").clone_for_child(Level::for_node(&node, id.to_string(), 0));
        ExecutionSnapshot {
            plan_execution: PlanExecution::new("exec-1", "plan", HashMap::new()),
            node_executions: vec![NodeExecution::new(id, ambiance, &node)],
            interrupts: Vec::new(),
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = snapshot().save(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("exec-1.state"));

        let loaded = ExecutionSnapshot::load(&path).unwrap();
        assert_eq!(loaded.plan_execution.uuid, "exec-1");
        assert_eq!(loaded.node_executions.len(), 1);
        assert_eq!(loaded.node_executions[0].identifier, "build");
    }

    #[test]
    fn test_save_creates_state_dir() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested").join(".pipewright");
        snapshot().save(&nested).unwrap();
        assert!(nested.join("exec-1.state").exists());
    }

    #[test]
    fn test_load_missing() {
        let dir = tempdir().unwrap();
        let result = ExecutionSnapshot::load(dir.path().join("nope.state"));
        assert!(matches!(result, Err(SnapshotError::Io { .. })));
    }

    #[test]
    fn test_load_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.state");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ExecutionSnapshot::load(&path),
            Err(SnapshotError::Format(_))
        ));
    }

    #[test]
    fn test_remaining_budget() {
        let now = Utc::now();
        let budget = Duration::from_secs(60);
        assert_eq!(
            remaining(budget, now - chrono::Duration::seconds(20), now),
            Duration::from_secs(40)
        );
        assert_eq!(remaining(budget, now - chrono::Duration::minutes(5), now), Duration::ZERO);
        assert_eq!(remaining(budget, now + chrono::Duration::seconds(5), now), budget);
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        snapshot().save(dir.path()).unwrap();
        ExecutionSnapshot::delete(dir.path(), "exec-1").unwrap();
        assert!(!dir.path().join("exec-1.state").exists());
        ExecutionSnapshot::delete(dir.path(), "exec-1").unwrap();
    }
}
