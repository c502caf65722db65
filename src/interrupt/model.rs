//! Interrupt Data Model

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    /// Abort one node and its active subtree
    Abort,
    /// Abort the whole plan execution
    AbortAll,
    /// Re-run a node waiting for intervention
    Retry,
    Pause,
    Resume,
    /// Expire a node and its active subtree
    ExpireAll,
    /// Expire only the targeted node
    MarkExpired,
    /// Treat a node waiting for intervention as passed
    Ignore,
}

/// Whether an interrupt type addresses a node, the plan, or either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScope {
    Node,
    Plan,
    Either,
}

impl InterruptType {
    pub fn target_scope(self) -> TargetScope {
        match self {
            InterruptType::AbortAll => TargetScope::Plan,
            InterruptType::Pause | InterruptType::Resume => TargetScope::Either,
            _ => TargetScope::Node,
        }
    }
}

impl fmt::Display for InterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterruptType::Abort => "ABORT",
            InterruptType::AbortAll => "ABORT_ALL",
            InterruptType::Retry => "RETRY",
            InterruptType::Pause => "PAUSE",
            InterruptType::Resume => "RESUME",
            InterruptType::ExpireAll => "EXPIRE_ALL",
            InterruptType::MarkExpired => "MARK_EXPIRED",
            InterruptType::Ignore => "IGNORE",
        };
        f.write_str(name)
    }
}

/// Who raised an interrupt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssuedBy {
    Adviser { adviser_type: String },
    Operator { identifier: String },
    Timeout,
}

impl fmt::Display for IssuedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssuedBy::Adviser { adviser_type } => write!(f, "adviser '{}'", adviser_type),
            IssuedBy::Operator { identifier } => write!(f, "operator '{}'", identifier),
            IssuedBy::Timeout => f.write_str("timeout"),
        }
    }
}

/// Type-specific payload carried by an interrupt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptConfig {
    #[default]
    None,
    Retry {
        #[serde(default)]
        max_retries: Option<u32>,
    },
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
    Expire {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl InterruptConfig {
    /// Whether this payload is valid for `interrupt_type`.
    pub fn accepts(&self, interrupt_type: InterruptType) -> bool {
        match self {
            InterruptConfig::None => true,
            InterruptConfig::Retry { max_retries } => {
                interrupt_type == InterruptType::Retry && max_retries.map_or(true, |m| m > 0)
            }
            InterruptConfig::Abort { .. } => {
                matches!(interrupt_type, InterruptType::Abort | InterruptType::AbortAll)
            }
            InterruptConfig::Expire { .. } => {
                matches!(
                    interrupt_type,
                    InterruptType::ExpireAll | InterruptType::MarkExpired
                )
            }
        }
    }
}

/// Processing state of a registered interrupt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processing,
    /// Applied and changed the target
    Processed,
    /// Target was already final or not in a state the interrupt applies to
    Discarded,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Interrupt {
    pub uuid: Uuid,
    pub interrupt_type: InterruptType,
    pub plan_execution_id: String,
    #[serde(default)]
    pub node_execution_id: Option<Uuid>,
    pub issued_by: IssuedBy,
    #[serde(default)]
    pub config: InterruptConfig,
    pub state: InterruptState,
    pub created_at: DateTime<Utc>,
}

impl Interrupt {
    pub fn new(
        interrupt_type: InterruptType,
        plan_execution_id: impl Into<String>,
        node_execution_id: Option<Uuid>,
        issued_by: IssuedBy,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            interrupt_type,
            plan_execution_id: plan_execution_id.into(),
            node_execution_id,
            issued_by,
            config: InterruptConfig::None,
            state: InterruptState::Registered,
            created_at: Utc::now(),
        }
    }

    /// Node-scoped interrupt raised by an operator.
    pub fn for_node(
        interrupt_type: InterruptType,
        plan_execution_id: impl Into<String>,
        node_execution_id: Uuid,
        operator: impl Into<String>,
    ) -> Self {
        Self::new(
            interrupt_type,
            plan_execution_id,
            Some(node_execution_id),
            IssuedBy::Operator {
                identifier: operator.into(),
            },
        )
    }

    /// Plan-scoped interrupt raised by an operator.
    pub fn for_plan(
        interrupt_type: InterruptType,
        plan_execution_id: impl Into<String>,
        operator: impl Into<String>,
    ) -> Self {
        Self::new(
            interrupt_type,
            plan_execution_id,
            None,
            IssuedBy::Operator {
                identifier: operator.into(),
            },
        )
    }

    pub fn with_config(mut self, config: InterruptConfig) -> Self {
        self.config = config;
        self
    }
}
