//! Execution Module
//!
//! The dynamic side of a run: node and plan execution records, their
//! status machine, the step contract and the engine that drives them.
//!
//! # Architecture
//!
//! - [`engine`]: Engine, builder and node lifecycle
//! - [`advance`]: Step responses, advisers, retries, scope and plan end
//! - [`status`]: Status state machine and execution modes
//! - [`node`]: Node execution records
//! - [`plan_execution`]: Plan execution records
//! - [`repository`]: Persistence contracts and in-memory stores
//! - [`step`]: The step capability and task dispatch
//! - [`condition`]: Skip condition evaluation
//! - [`snapshot`]: State snapshots and recovery

pub mod advance;
pub mod condition;
pub mod engine;
pub mod node;
pub mod plan_execution;
pub mod repository;
pub mod snapshot;
pub mod status;
pub mod step;

pub use condition::{ConditionEvaluator, LiteralConditionEvaluator};
pub use engine::{Engine, EngineBuilder, EngineError};
pub use node::{
    ChildReference, ExecutableResponse, FailureInfo, FailureType, InterruptEffect, NodeExecution,
    StepOutcome,
};
pub use plan_execution::PlanExecution;
pub use repository::{
    InMemoryNodeExecutionRepository, InMemoryPlanExecutionRepository, NodeExecutionRepository,
    PlanExecutionRepository, RepositoryError,
};
pub use snapshot::{ExecutionSnapshot, SnapshotError};
pub use status::{ExecutionMode, Status};
pub use step::{
    ResumePackage, Step, StepContext, StepError, StepRegistry, StepResponse, TaskDescriptor,
    TaskDispatcher,
};
