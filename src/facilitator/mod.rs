//! Facilitator Module
//!
//! Facilitators choose how a node's work is carried out. A node lists
//! facilitator obtainments in order; the first facilitator that returns a
//! response decides the [`ExecutionMode`].
//!
//! Every built-in facilitator accepts the same parameters:
//!
//! - `initial_wait_secs`: delay before the step is invoked
//! - `when_group`: only facilitate when the node's level group matches

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::execution::ExecutionMode;
use crate::plan::Ambiance;

pub const SYNC: &str = "SYNC";
pub const ASYNC: &str = "ASYNC";
pub const TASK: &str = "TASK";
pub const CHILD: &str = "CHILD";
pub const CHILDREN: &str = "CHILDREN";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FacilitatorError {
    #[error("Invalid parameters for facilitator '{facilitator_type}': {reason}")]
    InvalidParameters {
        facilitator_type: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FacilitatorResponse {
    pub mode: ExecutionMode,
    pub initial_wait: Option<Duration>,
}

impl FacilitatorResponse {
    pub fn of(mode: ExecutionMode) -> Self {
        Self {
            mode,
            initial_wait: None,
        }
    }
}

pub trait Facilitator: Send + Sync {
    /// Returns `Ok(None)` to let the next obtainment decide.
    fn facilitate(
        &self,
        ambiance: &Ambiance,
        parameters: &Value,
    ) -> Result<Option<FacilitatorResponse>, FacilitatorError>;
}

#[derive(Deserialize, Default)]
struct FacilitatorParameters {
    #[serde(default)]
    initial_wait_secs: Option<u64>,
    #[serde(default)]
    when_group: Option<String>,
}

/// Facilitator that always selects one fixed mode.
pub struct ModeFacilitator {
    name: &'static str,
    mode: ExecutionMode,
}

impl ModeFacilitator {
    pub fn new(name: &'static str, mode: ExecutionMode) -> Self {
        Self { name, mode }
    }
}

impl Facilitator for ModeFacilitator {
    fn facilitate(
        &self,
        ambiance: &Ambiance,
        parameters: &Value,
    ) -> Result<Option<FacilitatorResponse>, FacilitatorError> {
        let params: FacilitatorParameters = if parameters.is_null() {
            FacilitatorParameters::default()
        } else {
            serde_json::from_value(parameters.clone()).map_err(|e| {
                FacilitatorError::InvalidParameters {
                    facilitator_type: self.name.to_string(),
                    reason: e.to_string(),
                }
            })?
        };

        if let Some(group) = params.when_group.as_deref() {
            if ambiance.current_group() != Some(group) {
                return Ok(None);
            }
        }

        Ok(Some(FacilitatorResponse {
            mode: self.mode,
            initial_wait: params
                .initial_wait_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }))
    }
}

/// Immutable facilitator lookup table, keyed by facilitator type.
#[derive(Clone, Default)]
pub struct FacilitatorRegistry {
    facilitators: HashMap<String, Arc<dyn Facilitator>>,
}

impl FacilitatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        Self::new()
            .with(SYNC, Arc::new(ModeFacilitator::new(SYNC, ExecutionMode::Sync)))
            .with(ASYNC, Arc::new(ModeFacilitator::new(ASYNC, ExecutionMode::Async)))
            .with(TASK, Arc::new(ModeFacilitator::new(TASK, ExecutionMode::Task)))
            .with(CHILD, Arc::new(ModeFacilitator::new(CHILD, ExecutionMode::Child)))
            .with(
                CHILDREN,
                Arc::new(ModeFacilitator::new(CHILDREN, ExecutionMode::Children)),
            )
    }

    pub fn with(
        mut self,
        facilitator_type: impl Into<String>,
        facilitator: Arc<dyn Facilitator>,
    ) -> Self {
        self.facilitators.insert(facilitator_type.into(), facilitator);
        self
    }

    pub fn get(&self, facilitator_type: &str) -> Option<Arc<dyn Facilitator>> {
        self.facilitators.get(facilitator_type).cloned()
    }
}
