//! Execution Repositories
//!
//! Persistence contracts for node and plan execution records, plus the
//! in-memory implementations the engine ships with.
//!
//! Status changes go through [`NodeExecutionRepository::transition`], a
//! conditional update: the mutation is applied only if the stored status
//! still satisfies the caller's expectation and the move is legal. The
//! in-memory store backs this with `DashMap`, so the critical section is the
//! shard holding that one record.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, trace};
use thiserror::Error;
use uuid::Uuid;

use super::node::NodeExecution;
use super::plan_execution::PlanExecution;
use super::status::Status;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("Node execution '{0}' not found")]
    NodeExecutionNotFound(Uuid),

    #[error("Plan execution '{0}' not found")]
    PlanExecutionNotFound(String),

    #[error("Storage failure: {0}")]
    Storage(String),
}

pub trait NodeExecutionRepository: Send + Sync {
    fn get(&self, id: Uuid) -> Result<NodeExecution, RepositoryError>;

    fn save(&self, node_execution: NodeExecution) -> Result<(), RepositoryError>;

    /// Unconditional update of non-status fields.
    fn update(
        &self,
        id: Uuid,
        ops: &dyn Fn(&mut NodeExecution),
    ) -> Result<NodeExecution, RepositoryError>;

    /// Conditionally moves a node to `to`.
    ///
    /// Returns `Ok(None)` when the stored status fails `expected` or cannot
    /// legally move to `to`; the record is left untouched in that case.
    fn transition(
        &self,
        id: Uuid,
        to: Status,
        expected: &dyn Fn(Status) -> bool,
        ops: &dyn Fn(&mut NodeExecution),
    ) -> Result<Option<NodeExecution>, RepositoryError>;

    fn find_children(&self, parent_id: Uuid) -> Vec<NodeExecution>;

    fn find_by_plan_execution(&self, plan_execution_id: &str) -> Vec<NodeExecution>;

    /// Sets `valid_until` on every node of a plan execution.
    fn set_valid_until(&self, plan_execution_id: &str, until: DateTime<Utc>) -> usize;

    /// Deletes records whose `valid_until` has passed.
    fn purge_expired(&self, now: DateTime<Utc>) -> usize;

    fn find(&self, id: Uuid) -> Option<NodeExecution> {
        self.get(id).ok()
    }

    /// Every descendant of `id`, parents before their children.
    fn find_descendants(&self, id: Uuid) -> Vec<NodeExecution> {
        let mut result = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for child in self.find_children(current) {
                queue.push_back(child.uuid);
                result.push(child);
            }
        }
        result
    }

    fn find_active_by_plan_execution(&self, plan_execution_id: &str) -> Vec<NodeExecution> {
        self.find_by_plan_execution(plan_execution_id)
            .into_iter()
            .filter(|ne| ne.status.is_active())
            .collect()
    }
}

pub trait PlanExecutionRepository: Send + Sync {
    fn get(&self, id: &str) -> Result<PlanExecution, RepositoryError>;

    fn save(&self, plan_execution: PlanExecution) -> Result<(), RepositoryError>;

    /// Conditional status update with the same contract as node transitions.
    fn transition(
        &self,
        id: &str,
        to: Status,
        expected: &dyn Fn(Status) -> bool,
        ops: &dyn Fn(&mut PlanExecution),
    ) -> Result<Option<PlanExecution>, RepositoryError>;

    fn update(
        &self,
        id: &str,
        ops: &dyn Fn(&mut PlanExecution),
    ) -> Result<PlanExecution, RepositoryError>;
}

#[derive(Default)]
pub struct InMemoryNodeExecutionRepository {
    records: DashMap<Uuid, NodeExecution>,
}

impl InMemoryNodeExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl NodeExecutionRepository for InMemoryNodeExecutionRepository {
    fn get(&self, id: Uuid) -> Result<NodeExecution, RepositoryError> {
        self.records
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(RepositoryError::NodeExecutionNotFound(id))
    }

    fn save(&self, node_execution: NodeExecution) -> Result<(), RepositoryError> {
        trace!(
            "Saving node execution '{}' ({})",
            node_execution.uuid,
            node_execution.status
        );
        self.records.insert(node_execution.uuid, node_execution);
        Ok(())
    }

    fn update(
        &self,
        id: Uuid,
        ops: &dyn Fn(&mut NodeExecution),
    ) -> Result<NodeExecution, RepositoryError> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or(RepositoryError::NodeExecutionNotFound(id))?;
        ops(record.value_mut());
        record.version += 1;
        Ok(record.value().clone())
    }

    fn transition(
        &self,
        id: Uuid,
        to: Status,
        expected: &dyn Fn(Status) -> bool,
        ops: &dyn Fn(&mut NodeExecution),
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or(RepositoryError::NodeExecutionNotFound(id))?;

        let current = record.status;
        if !expected(current) || !current.can_transition_to(to) {
            debug!(
                "Rejected transition of node execution '{}' from {} to {}",
                id, current, to
            );
            return Ok(None);
        }

        record.status = to;
        if to.is_final() && record.end_ts.is_none() {
            record.end_ts = Some(Utc::now());
        }
        ops(record.value_mut());
        record.version += 1;
        Ok(Some(record.value().clone()))
    }

    fn find_children(&self, parent_id: Uuid) -> Vec<NodeExecution> {
        let mut children: Vec<NodeExecution> = self
            .records
            .iter()
            .filter(|r| r.parent_id == Some(parent_id))
            .map(|r| r.value().clone())
            .collect();
        children.sort_by_key(|ne| ne.created_at);
        children
    }

    fn find_by_plan_execution(&self, plan_execution_id: &str) -> Vec<NodeExecution> {
        let mut nodes: Vec<NodeExecution> = self
            .records
            .iter()
            .filter(|r| r.plan_execution_id() == plan_execution_id)
            .map(|r| r.value().clone())
            .collect();
        nodes.sort_by_key(|ne| ne.created_at);
        nodes
    }

    fn set_valid_until(&self, plan_execution_id: &str, until: DateTime<Utc>) -> usize {
        let mut count = 0;
        for mut record in self.records.iter_mut() {
            if record.plan_execution_id() == plan_execution_id {
                record.valid_until = Some(until);
                record.version += 1;
                count += 1;
            }
        }
        count
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, ne| !ne.is_expired_at(now));
        let purged = before.saturating_sub(self.records.len());
        if purged > 0 {
            debug!("Purged {} expired node executions", purged);
        }
        purged
    }
}

#[derive(Default)]
pub struct InMemoryPlanExecutionRepository {
    records: DashMap<String, PlanExecution>,
}

impl InMemoryPlanExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlanExecutionRepository for InMemoryPlanExecutionRepository {
    fn get(&self, id: &str) -> Result<PlanExecution, RepositoryError> {
        self.records
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| RepositoryError::PlanExecutionNotFound(id.to_string()))
    }

    fn save(&self, plan_execution: PlanExecution) -> Result<(), RepositoryError> {
        self.records.insert(plan_execution.uuid.clone(), plan_execution);
        Ok(())
    }

    fn transition(
        &self,
        id: &str,
        to: Status,
        expected: &dyn Fn(Status) -> bool,
        ops: &dyn Fn(&mut PlanExecution),
    ) -> Result<Option<PlanExecution>, RepositoryError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| RepositoryError::PlanExecutionNotFound(id.to_string()))?;

        // Plan statuses only enforce finality.
        let current = record.status;
        if !expected(current) || current.is_final() || current == to {
            return Ok(None);
        }

        record.status = to;
        if to.is_final() {
            record.end_ts = Some(Utc::now());
        }
        ops(record.value_mut());
        record.version += 1;
        Ok(Some(record.value().clone()))
    }

    fn update(
        &self,
        id: &str,
        ops: &dyn Fn(&mut PlanExecution),
    ) -> Result<PlanExecution, RepositoryError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| RepositoryError::PlanExecutionNotFound(id.to_string()))?;
        ops(record.value_mut());
        record.version += 1;
        Ok(record.value().clone())
    }
}
