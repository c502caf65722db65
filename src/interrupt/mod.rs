//! Interrupt Module
//!
//! Externally or internally issued control operations against running
//! nodes and plans, plus per-node timeout handling.
//!
//! # Components
//!
//! - [`model`]: Interrupt types, issuers and config payloads
//! - [`manager`]: Registration and timeout arbitration
//! - [`handlers`]: Application of each interrupt type on the engine
//! - [`repository`]: Registered interrupt storage
//! - [`timeout`]: Per-node timeout timers

pub mod handlers;
pub mod manager;
pub mod model;
pub mod repository;
pub mod timeout;

use thiserror::Error;
use uuid::Uuid;

use crate::execution::RepositoryError;

pub use manager::InterruptManager;
pub use model::{Interrupt, InterruptConfig, InterruptState, InterruptType, IssuedBy, TargetScope};
pub use repository::{InMemoryInterruptRepository, InterruptRepository};
pub use timeout::TimeoutTracker;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InterruptError {
    #[error("Plan execution '{0}' not found")]
    PlanExecutionNotFound(String),

    #[error("Target node execution '{0}' not found")]
    TargetNotFound(Uuid),

    #[error("Node execution '{node_execution_id}' is not part of plan execution '{plan_execution_id}'")]
    TargetNotInPlan {
        node_execution_id: Uuid,
        plan_execution_id: String,
    },

    #[error("{0} interrupt requires a node target")]
    MissingNodeTarget(InterruptType),

    #[error("{0} interrupt applies to the whole plan and takes no node target")]
    UnexpectedNodeTarget(InterruptType),

    #[error("Config {config} is not valid for a {interrupt_type} interrupt")]
    InvalidConfig {
        interrupt_type: InterruptType,
        config: String,
    },

    #[error("Node already retried {retry_index} time(s), limit is {max_retries}")]
    RetryLimitReached { retry_index: u32, max_retries: u32 },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
