//! Waiter Module
//!
//! Asynchronous glue between external completion notifications and the
//! engine.
//!
//! # Architecture
//!
//! ```text
//! transport ──notify(id, Result)──► Waiter ──EngineJob──► channel
//!                                                           │
//!                          ResumeExecutor (blocking pool) ◄─┘
//!                                   │
//!                             Engine::run_job
//! ```
//!
//! The thread calling [`Waiter::notify`] never runs engine logic; it only
//! records the response and, once a wait is complete, sends a job.

pub mod executor;
pub mod notify;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::execution::{FailureInfo, FailureType};
use crate::interrupt::Interrupt;

pub use executor::{job_channel, spawn_executor, EngineJob, ExecutorHandle, JobSender};
pub use notify::Waiter;

/// Responses keyed by correlation id.
pub type ResponseMap = HashMap<String, Value>;

/// Payload of a failed remote completion.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(default)]
    pub failure_types: Vec<FailureType>,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>, failure_types: Vec<FailureType>) -> Self {
        Self {
            message: message.into(),
            failure_types,
        }
    }

    pub fn to_failure_info(&self) -> FailureInfo {
        let failure_types = if self.failure_types.is_empty() {
            vec![FailureType::Unknown]
        } else {
            self.failure_types.clone()
        };
        FailureInfo {
            message: self.message.clone(),
            failure_types,
        }
    }
}

/// What happens once every correlation id of a wait has been notified.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyCallback {
    /// Resume a suspended node with the collected responses
    Resume { node_execution_id: Uuid },
    /// Start a queued node (delayed retries, facilitator initial waits)
    StartNode { node_execution_id: Uuid },
    /// Register an interrupt (intervention timeouts)
    RegisterInterrupt { interrupt: Box<Interrupt> },
}

impl NotifyCallback {
    /// Node the callback acts on, if any.
    pub fn node_execution_id(&self) -> Option<Uuid> {
        match self {
            NotifyCallback::Resume { node_execution_id }
            | NotifyCallback::StartNode { node_execution_id } => Some(*node_execution_id),
            NotifyCallback::RegisterInterrupt { interrupt } => interrupt.node_execution_id,
        }
    }
}
