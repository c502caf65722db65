//! Interrupt Manager
//!
//! Accepts control operations and arbitrates when they apply.
//!
//! [`InterruptManager::register`] validates synchronously and returns as soon
//! as the interrupt is persisted; the actual application is queued as an
//! [`EngineJob::ApplyInterrupt`] and happens on the executor, at a status
//! transition boundary of the target.

use std::sync::Arc;

use log::{debug, info};
use uuid::Uuid;

use crate::execution::{NodeExecutionRepository, PlanExecutionRepository, RepositoryError};
use crate::waiter::{EngineJob, JobSender};

use super::model::{Interrupt, InterruptConfig, InterruptType, IssuedBy, TargetScope};
use super::repository::InterruptRepository;
use super::InterruptError;

pub struct InterruptManager {
    repository: Arc<dyn InterruptRepository>,
    nodes: Arc<dyn NodeExecutionRepository>,
    plans: Arc<dyn PlanExecutionRepository>,
    jobs: JobSender,
}

impl InterruptManager {
    pub fn new(
        repository: Arc<dyn InterruptRepository>,
        nodes: Arc<dyn NodeExecutionRepository>,
        plans: Arc<dyn PlanExecutionRepository>,
        jobs: JobSender,
    ) -> Self {
        Self {
            repository,
            nodes,
            plans,
            jobs,
        }
    }

    pub fn repository(&self) -> &Arc<dyn InterruptRepository> {
        &self.repository
    }

    /// Validates and persists an interrupt, then queues its application.
    ///
    /// # Errors
    ///
    /// Returns an error without persisting anything if the target does not
    /// exist, the target scope is wrong for the type, or the config payload
    /// does not fit the type.
    pub fn register(&self, interrupt: Interrupt) -> Result<Uuid, InterruptError> {
        self.validate(&interrupt)?;

        let id = interrupt.uuid;
        info!(
            "Registered {} interrupt '{}' from {} for {}",
            interrupt.interrupt_type,
            id,
            interrupt.issued_by,
            describe_target(&interrupt)
        );
        self.repository.save(interrupt)?;
        self.jobs.send(EngineJob::ApplyInterrupt(id));
        Ok(id)
    }

    /// Reacts to a fired node timeout.
    ///
    /// Missing or final nodes are ignored. Nodes waiting on children get an
    /// EXPIRE_ALL so the subtree does not outlive its parent; any other node
    /// gets MARK_EXPIRED.
    pub fn on_timeout(&self, node_execution_id: Uuid) -> Result<Option<Uuid>, InterruptError> {
        let node = match self.nodes.get(node_execution_id) {
            Ok(node) => node,
            Err(RepositoryError::NodeExecutionNotFound(_)) => {
                debug!(
                    "Timeout for unknown node execution '{}' ignored",
                    node_execution_id
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if node.is_final() {
            debug!(
                "Timeout for node '{}' ignored, already {}",
                node.identifier, node.status
            );
            return Ok(None);
        }

        let interrupt_type = match node.mode {
            Some(mode) if mode.spawns_children() => InterruptType::ExpireAll,
            _ => InterruptType::MarkExpired,
        };
        info!(
            "Node '{}' timed out while {}, issuing {}",
            node.identifier, node.status, interrupt_type
        );

        let interrupt = Interrupt::new(
            interrupt_type,
            node.plan_execution_id(),
            Some(node.uuid),
            IssuedBy::Timeout,
        )
        .with_config(InterruptConfig::Expire {
            reason: Some("node timed out".to_string()),
        });
        self.register(interrupt).map(Some)
    }

    fn validate(&self, interrupt: &Interrupt) -> Result<(), InterruptError> {
        let interrupt_type = interrupt.interrupt_type;

        match self.plans.get(&interrupt.plan_execution_id) {
            Ok(_) => {}
            Err(RepositoryError::PlanExecutionNotFound(id)) => {
                return Err(InterruptError::PlanExecutionNotFound(id))
            }
            Err(e) => return Err(e.into()),
        }

        match (interrupt_type.target_scope(), interrupt.node_execution_id) {
            (TargetScope::Node, None) => {
                return Err(InterruptError::MissingNodeTarget(interrupt_type))
            }
            (TargetScope::Plan, Some(_)) => {
                return Err(InterruptError::UnexpectedNodeTarget(interrupt_type))
            }
            _ => {}
        }

        if !interrupt.config.accepts(interrupt_type) {
            return Err(InterruptError::InvalidConfig {
                interrupt_type,
                config: format!("{:?}", interrupt.config),
            });
        }

        let Some(node_execution_id) = interrupt.node_execution_id else {
            return Ok(());
        };

        let node = self.nodes.get(node_execution_id).map_err(|e| match e {
            RepositoryError::NodeExecutionNotFound(id) => InterruptError::TargetNotFound(id),
            other => other.into(),
        })?;

        if node.plan_execution_id() != interrupt.plan_execution_id {
            return Err(InterruptError::TargetNotInPlan {
                node_execution_id,
                plan_execution_id: interrupt.plan_execution_id.clone(),
            });
        }

        if let InterruptConfig::Retry {
            max_retries: Some(max),
        } = interrupt.config
        {
            if node.retry_index >= max {
                return Err(InterruptError::RetryLimitReached {
                    retry_index: node.retry_index,
                    max_retries: max,
                });
            }
        }

        Ok(())
    }
}

fn describe_target(interrupt: &Interrupt) -> String {
    match interrupt.node_execution_id {
        Some(id) => format!("node execution '{}'", id),
        None => format!("plan execution '{}'", interrupt.plan_execution_id),
    }
}
