//! Plan Module
//!
//! The static side of an execution: the resolved step graph and the
//! ambiance that threads through it.
//!
//! # Structure
//!
//! - [`ambiance`]: Execution context and level stack
//! - [`model`]: Plan, PlanNode and obtainments
//! - [`loader`]: Loading resolved plans from YAML
//! - [`repository`]: Read-only plan storage

pub mod ambiance;
pub mod loader;
pub mod model;
pub mod repository;

use thiserror::Error;

pub use ambiance::{Ambiance, AmbianceError, Level};
pub use loader::{load_plan, parse_plan};
pub use model::{
    AdviserObtainment, FacilitatorObtainment, Plan, PlanDefinition, PlanNode, SkipType,
    StepCategory, StepType,
};
pub use repository::{InMemoryPlanRepository, PlanRepository};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    #[error("Plan '{0}' not found")]
    PlanNotFound(String),

    #[error("Node '{node_id}' not found in plan '{plan_id}'")]
    NodeNotFound { plan_id: String, node_id: String },

    #[error("Node '{from}' references unknown node '{to}'")]
    DanglingReference { from: String, to: String },

    #[error("Failed to read plan: {0}")]
    Io(String),

    #[error("Failed to parse plan: {0}")]
    Parse(String),
}
