//! Step Capability
//!
//! The contract between the engine and concrete step kinds. The engine is
//! agnostic to what a step does; it only calls the entry point matching the
//! execution mode the facilitator chose:
//!
//! - SYNC: [`Step::execute_sync`]
//! - ASYNC: [`Step::execute_async`], returning the callback ids to wait on
//! - TASK: [`Step::obtain_task`], dispatched through a [`TaskDispatcher`]
//! - CHILD / CHILDREN: [`Step::obtain_child`] / [`Step::obtain_children`]
//!
//! Every suspending mode finishes with [`Step::handle_resume`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::plan::{Ambiance, PlanNode};
use crate::waiter::{ResponseMap, Waiter};

use super::node::{FailureInfo, FailureType, NodeExecution, StepOutcome};
use super::status::{ExecutionMode, Status};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StepError {
    #[error("Step '{kind}' does not support {mode} mode")]
    UnsupportedMode { kind: String, mode: ExecutionMode },

    #[error("Invalid step parameters: {0}")]
    InvalidParameters(String),

    #[error("Node '{0}' has no child nodes")]
    MissingChildren(String),

    #[error("Task dispatch failed: {0}")]
    Dispatch(String),

    #[error("{}", .0.message)]
    Failed(FailureInfo),
}

impl StepError {
    /// Classifies the error for the node's failure info.
    pub fn to_failure_info(&self) -> FailureInfo {
        match self {
            StepError::Failed(info) => info.clone(),
            StepError::UnsupportedMode { .. }
            | StepError::InvalidParameters(_)
            | StepError::MissingChildren(_) => FailureInfo::configuration(self.to_string()),
            StepError::Dispatch(_) => FailureInfo::new(self.to_string(), FailureType::Connectivity),
        }
    }
}

/// Result of a step: the status it concluded with and what it produced.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepResponse {
    pub status: Status,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub outcomes: Vec<StepOutcome>,
}

impl StepResponse {
    pub fn succeeded() -> Self {
        Self {
            status: Status::Succeeded,
            failure_info: None,
            outcomes: Vec::new(),
        }
    }

    pub fn failed(failure_info: FailureInfo) -> Self {
        Self {
            status: Status::Failed,
            failure_info: Some(failure_info),
            outcomes: Vec::new(),
        }
    }

    pub fn errored(failure_info: FailureInfo) -> Self {
        Self {
            status: Status::Errored,
            failure_info: Some(failure_info),
            outcomes: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_outcome(mut self, name: impl Into<String>, value: Value) -> Self {
        self.outcomes.push(StepOutcome::new(name, value));
        self
    }
}

/// What a step sees when it is invoked.
pub struct StepContext<'a> {
    pub node_execution_id: Uuid,
    pub ambiance: &'a Ambiance,
    pub node: &'a PlanNode,
    pub waiter: &'a Waiter,
}

/// What a step sees when a suspended node resumes.
pub struct ResumePackage<'a> {
    pub node_execution_id: Uuid,
    pub ambiance: &'a Ambiance,
    pub node: &'a PlanNode,
    pub mode: ExecutionMode,
    pub responses: &'a ResponseMap,
    /// Latest attempt of each child, for CHILD/CHILDREN modes
    pub children: &'a [NodeExecution],
}

/// Work description handed to the task dispatcher in TASK mode.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub task_type: String,
    #[serde(default)]
    pub payload: Value,
}

pub trait Step: Send + Sync {
    fn execute_sync(&self, ctx: &StepContext<'_>) -> Result<StepResponse, StepError> {
        Err(StepError::UnsupportedMode {
            kind: ctx.node.step_type.kind.clone(),
            mode: ExecutionMode::Sync,
        })
    }

    /// Starts out-of-process work and returns the correlation ids to wait on.
    fn execute_async(&self, ctx: &StepContext<'_>) -> Result<Vec<String>, StepError> {
        Err(StepError::UnsupportedMode {
            kind: ctx.node.step_type.kind.clone(),
            mode: ExecutionMode::Async,
        })
    }

    fn obtain_task(&self, ctx: &StepContext<'_>) -> Result<TaskDescriptor, StepError> {
        Err(StepError::UnsupportedMode {
            kind: ctx.node.step_type.kind.clone(),
            mode: ExecutionMode::Task,
        })
    }

    fn obtain_child(&self, ctx: &StepContext<'_>) -> Result<String, StepError> {
        ctx.node
            .child_node_ids
            .first()
            .cloned()
            .ok_or_else(|| StepError::MissingChildren(ctx.node.identifier.clone()))
    }

    fn obtain_children(&self, ctx: &StepContext<'_>) -> Result<Vec<String>, StepError> {
        Ok(ctx.node.child_node_ids.clone())
    }

    /// Default: children aggregate worst-wins; other modes succeed with the
    /// responses recorded as outcomes.
    fn handle_resume(&self, package: &ResumePackage<'_>) -> Result<StepResponse, StepError> {
        if package.mode.spawns_children() {
            let status = Status::aggregate(package.children.iter().map(|c| c.status));
            let failure_info = package
                .children
                .iter()
                .find(|c| c.status == status)
                .and_then(|c| c.failure_info.clone());
            return Ok(StepResponse {
                status,
                failure_info,
                outcomes: Vec::new(),
            });
        }

        let mut ids: Vec<&String> = package.responses.keys().collect();
        ids.sort();
        let outcomes = ids
            .into_iter()
            .map(|id| StepOutcome::new(id.clone(), package.responses[id].clone()))
            .collect();
        Ok(StepResponse {
            status: Status::Succeeded,
            failure_info: None,
            outcomes,
        })
    }
}

/// Transport for TASK mode: hands a descriptor to remote workers.
pub trait TaskDispatcher: Send + Sync {
    /// Queues the task and returns the correlation id its completion will
    /// be notified under.
    fn queue_task(&self, ambiance: &Ambiance, task: &TaskDescriptor) -> Result<String, StepError>;
}

/// Immutable step lookup table, keyed by step kind.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: impl Into<String>, step: Arc<dyn Step>) -> Self {
        self.steps.insert(kind.into(), step);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}
