//! Proctors report the current state of a forcer.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::NodeExecutionRepository;

use super::forcer::ForcerState;

/// Context key holding the plan execution a barrier belongs to.
pub const PLAN_EXECUTION_ID_KEY: &str = "planExecutionId";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProctorError {
    #[error("Barrier context is missing '{0}'")]
    MissingContext(String),

    #[error("State lookup for forcer '{forcer_id}' failed: {reason}")]
    Lookup { forcer_id: String, reason: String },
}

/// What a barrier does when its proctor cannot answer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProctorFailurePolicy {
    /// Treat the forcer as still approaching
    #[default]
    FailClosed,
    /// Treat the forcer as abandoned, which releases the barrier via ENDURE
    TreatAsAbandoned,
    /// Return the error to the caller
    Propagate,
}

pub trait Proctor: Send + Sync {
    fn get_forcer_state(
        &self,
        forcer_id: &str,
        context: &HashMap<String, String>,
    ) -> Result<ForcerState, ProctorError>;
}

/// Derives forcer state from node executions.
///
/// Forcer ids are plan node ids; the plan execution comes from the
/// [`PLAN_EXECUTION_ID_KEY`] context entry. Superseded retry attempts are
/// ignored.
pub struct ExecutionProctor {
    nodes: Arc<dyn NodeExecutionRepository>,
}

impl ExecutionProctor {
    pub fn new(nodes: Arc<dyn NodeExecutionRepository>) -> Self {
        Self { nodes }
    }
}

impl Proctor for ExecutionProctor {
    fn get_forcer_state(
        &self,
        forcer_id: &str,
        context: &HashMap<String, String>,
    ) -> Result<ForcerState, ProctorError> {
        let plan_execution_id = context
            .get(PLAN_EXECUTION_ID_KEY)
            .ok_or_else(|| ProctorError::MissingContext(PLAN_EXECUTION_ID_KEY.to_string()))?;

        let executions: Vec<_> = self
            .nodes
            .find_by_plan_execution(plan_execution_id)
            .into_iter()
            .filter(|ne| ne.node_id == forcer_id && !ne.old_retry)
            .collect();

        if executions.is_empty() {
            return Ok(ForcerState::Absent);
        }
        if executions.iter().any(|ne| ne.status.is_active()) {
            return Ok(ForcerState::Approaching);
        }
        if executions.iter().all(|ne| ne.status.is_positive()) {
            return Ok(ForcerState::Arrived);
        }
        Ok(ForcerState::Abandoned)
    }
}
