//! Node Execution Records
//!
//! The durable, mutable runtime record of one instantiated plan node, plus
//! the failure/outcome types that hang off it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::adviser::AdviserResponse;
use crate::interrupt::{InterruptType, IssuedBy};
use crate::plan::{Ambiance, PlanNode};

use super::status::{ExecutionMode, Status};

/// Machine-readable classification of a failure.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Unknown,
    /// Unknown step, facilitator or adviser type; never retried
    Configuration,
    Connectivity,
    Authentication,
    Authorization,
    Verification,
    Application,
    Timeout,
    /// The remote worker running a dispatched task failed
    Task,
    Policy,
}

/// Human-readable message plus classification for a broke node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FailureInfo {
    pub message: String,
    #[serde(default)]
    pub failure_types: Vec<FailureType>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>, failure_type: FailureType) -> Self {
        Self {
            message: message.into(),
            failure_types: vec![failure_type],
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(message, FailureType::Configuration)
    }

    pub fn has_type(&self, failure_type: FailureType) -> bool {
        self.failure_types.contains(&failure_type)
    }

    pub fn is_configuration_error(&self) -> bool {
        self.has_type(FailureType::Configuration)
    }
}

/// Named output produced by a step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub name: String,
    pub value: Value,
}

impl StepOutcome {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Metadata describing what a suspended node is waiting on.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutableResponse {
    Sync,
    Async { callback_ids: Vec<String> },
    Task { task_id: String, task_type: String },
    Child { child_node_id: String, child_execution_id: Uuid },
    Children { children: Vec<ChildReference> },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChildReference {
    pub node_id: String,
    pub execution_id: Uuid,
}

impl ExecutableResponse {
    /// Correlation ids the node must hear back from before it resumes.
    pub fn correlation_ids(&self) -> Vec<String> {
        match self {
            ExecutableResponse::Sync => Vec::new(),
            ExecutableResponse::Async { callback_ids } => callback_ids.clone(),
            ExecutableResponse::Task { task_id, .. } => vec![task_id.clone()],
            ExecutableResponse::Child {
                child_execution_id, ..
            } => vec![child_execution_id.to_string()],
            ExecutableResponse::Children { children } => children
                .iter()
                .map(|c| c.execution_id.to_string())
                .collect(),
        }
    }
}

/// Record of an interrupt that changed this node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InterruptEffect {
    pub interrupt_id: Uuid,
    pub interrupt_type: InterruptType,
    pub issued_by: IssuedBy,
    pub took_effect_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeExecution {
    pub uuid: Uuid,
    /// Ambiance whose top level is this node
    pub ambiance: Ambiance,
    pub node_id: String,
    pub identifier: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub previous_id: Option<Uuid>,
    #[serde(default)]
    pub next_id: Option<Uuid>,
    /// Correlation id the parent waits on; retries inherit it
    pub notify_id: Uuid,
    #[serde(default)]
    pub retry_index: u32,
    #[serde(default)]
    pub retry_ids: Vec<Uuid>,
    #[serde(default)]
    pub old_retry: bool,
    #[serde(default)]
    pub interrupt_history: Vec<InterruptEffect>,
    #[serde(default)]
    pub outcomes: Vec<StepOutcome>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,
    #[serde(default)]
    pub adviser_response: Option<AdviserResponse>,
    /// Final status the advisers saw before a manual intervention
    #[serde(default)]
    pub advised_status: Option<Status>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl NodeExecution {
    /// Creates a QUEUED node execution for `node` under `ambiance`.
    ///
    /// `ambiance` must already carry this execution's level on top.
    pub fn new(uuid: Uuid, ambiance: Ambiance, node: &PlanNode) -> Self {
        Self {
            uuid,
            ambiance,
            node_id: node.uuid.clone(),
            identifier: node.identifier.clone(),
            status: Status::Queued,
            mode: None,
            start_ts: None,
            end_ts: None,
            parent_id: None,
            previous_id: None,
            next_id: None,
            notify_id: uuid,
            retry_index: 0,
            retry_ids: Vec::new(),
            old_retry: false,
            interrupt_history: Vec::new(),
            outcomes: Vec::new(),
            failure_info: None,
            executable_responses: Vec::new(),
            adviser_response: None,
            advised_status: None,
            valid_until: None,
            version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent_id: Option<Uuid>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_previous(mut self, previous_id: Option<Uuid>) -> Self {
        self.previous_id = previous_id;
        self
    }

    pub fn plan_execution_id(&self) -> &str {
        self.ambiance.plan_execution_id()
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }

    /// Correlation ids of the most recent suspension, if any.
    pub fn pending_correlation_ids(&self) -> Vec<String> {
        self.executable_responses
            .last()
            .map(ExecutableResponse::correlation_ids)
            .unwrap_or_default()
    }

    pub fn duration(&self) -> Option<ChronoDuration> {
        match (self.start_ts, self.end_ts) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.map(|until| until <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Level, StepType};

    fn sample() -> NodeExecution {
        let node = PlanNode::new("n1", "build", StepType::step("NOOP"));
        let id = Uuid::new_v4();
        let ambiance = Ambiance::new("exec", "plan").clone_for_child(Level::for_node(&node, id.to_string(), 0));
        NodeExecution::new(id, ambiance, &node)
    }

    #[test]
    fn test_new_node_execution_defaults() {
        let ne = sample();
        assert_eq!(ne.status, Status::Queued);
        assert_eq!(ne.notify_id, ne.uuid);
        assert_eq!(ne.plan_execution_id(), "exec");
        assert_eq!(ne.ambiance.obtain_current_runtime_id(), Some(ne.uuid.to_string().as_str()));
        assert!(ne.pending_correlation_ids().is_empty());
    }

    #[test]
    fn test_pending_correlation_ids_use_latest_response() {
        let mut ne = sample();
        let child = Uuid::new_v4();
        ne.executable_responses.push(ExecutableResponse::Async {
            callback_ids: vec!["cb-1".to_string()],
        });
        ne.executable_responses.push(ExecutableResponse::Child {
            child_node_id: "c".to_string(),
            child_execution_id: child,
        });
        assert_eq!(ne.pending_correlation_ids(), vec![child.to_string()]);
    }

    #[test]
    fn test_failure_info_classification() {
        let info = FailureInfo::configuration("unknown step type 'X'");
        assert!(info.is_configuration_error());
        assert!(!FailureInfo::new("boom", FailureType::Task).is_configuration_error());
    }

    #[test]
    fn test_expiry_check() {
        let mut ne = sample();
        let now = Utc::now();
        assert!(!ne.is_expired_at(now));
        ne.valid_until = Some(now - ChronoDuration::seconds(1));
        assert!(ne.is_expired_at(now));
    }

    #[test]
    fn test_node_execution_serialization() {
        let mut ne = sample();
        ne.failure_info = Some(FailureInfo::new("remote failure", FailureType::Task));
        let json = serde_json::to_string(&ne).unwrap();
        let back: NodeExecution = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ne);
    }
}
