//! Plan Data Model
//!
//! Static, already-resolved description of the step graph. Plans are built
//! upstream (definition parsing is not part of this crate) and are read-only
//! for the lifetime of an execution, so nodes are shared as `Arc<PlanNode>`.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: deploy
//! start_node_id: build
//! nodes:
//!   - uuid: build
//!     identifier: build
//!     step_type: { kind: NOOP, category: STEP }
//!     facilitators:
//!       - type: SYNC
//!     advisers:
//!       - type: RETRY
//!         parameters: { retry_count: 2, wait_secs: [0] }
//!       - type: ON_SUCCESS
//!         parameters: { next_node_id: publish }
//!   - uuid: publish
//!     identifier: publish
//!     step_type: { kind: WAIT, category: STEP }
//!     facilitators:
//!       - type: ASYNC
//!     timeout_secs: 600
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broad grouping of a step, used when walking the level stack.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepCategory {
    Pipeline,
    Stage,
    Section,
    Fork,
    Strategy,
    Step,
}

/// The kind of step a node runs, e.g. `NOOP` in category `STEP`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepType {
    /// Registry key used to look up the step implementation
    pub kind: String,
    #[serde(default = "default_category")]
    pub category: StepCategory,
}

fn default_category() -> StepCategory {
    StepCategory::Step
}

impl StepType {
    pub fn new(kind: impl Into<String>, category: StepCategory) -> Self {
        Self {
            kind: kind.into(),
            category,
        }
    }

    /// Shorthand for a plain `STEP` category type.
    pub fn step(kind: impl Into<String>) -> Self {
        Self::new(kind, StepCategory::Step)
    }
}

/// Reference to a facilitator plus the parameters it should see.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FacilitatorObtainment {
    #[serde(rename = "type")]
    pub facilitator_type: String,
    #[serde(default)]
    pub parameters: Value,
}

impl FacilitatorObtainment {
    pub fn of(facilitator_type: impl Into<String>) -> Self {
        Self {
            facilitator_type: facilitator_type.into(),
            parameters: Value::Null,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Reference to an adviser plus the parameters it should see.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AdviserObtainment {
    #[serde(rename = "type")]
    pub adviser_type: String,
    #[serde(default)]
    pub parameters: Value,
}

impl AdviserObtainment {
    pub fn of(adviser_type: impl Into<String>, parameters: Value) -> Self {
        Self {
            adviser_type: adviser_type.into(),
            parameters,
        }
    }
}

/// What to do when a node's skip condition evaluates to true.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipType {
    /// Run the node normally regardless of the condition
    #[default]
    Noop,
    /// Mark the node SKIPPED and advance to the next sibling
    SkipNode,
}

/// Immutable definition of one node in a plan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlanNode {
    /// Unique id within the plan
    pub uuid: String,

    /// Human readable identifier (shown in logs and the timeline)
    pub identifier: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub step_type: StepType,

    /// Opaque parameters handed to the step implementation
    #[serde(default)]
    pub step_parameters: Value,

    #[serde(default)]
    pub facilitators: Vec<FacilitatorObtainment>,

    #[serde(default)]
    pub advisers: Vec<AdviserObtainment>,

    /// Child node ids used by CHILD/CHILDREN steps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_node_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_condition: Option<String>,

    #[serde(default)]
    pub skip_type: SkipType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl PlanNode {
    /// Creates a node with no facilitators or advisers attached.
    ///
    /// # Example
    ///
    /// ```
    /// use pipewright::plan::{PlanNode, StepType};
    ///
    /// let node = PlanNode::new("n1", "build", StepType::step("NOOP"))
    ///     .with_facilitator("SYNC")
    ///     .with_timeout_secs(30);
    /// assert_eq!(node.identifier, "build");
    /// ```
    pub fn new(uuid: impl Into<String>, identifier: impl Into<String>, step_type: StepType) -> Self {
        Self {
            uuid: uuid.into(),
            identifier: identifier.into(),
            name: None,
            step_type,
            step_parameters: Value::Null,
            facilitators: Vec::new(),
            advisers: Vec::new(),
            child_node_ids: Vec::new(),
            skip_condition: None,
            skip_type: SkipType::Noop,
            group: None,
            timeout_secs: None,
        }
    }

    pub fn with_facilitator(mut self, facilitator_type: impl Into<String>) -> Self {
        self.facilitators.push(FacilitatorObtainment::of(facilitator_type));
        self
    }

    pub fn with_facilitator_obtainment(mut self, obtainment: FacilitatorObtainment) -> Self {
        self.facilitators.push(obtainment);
        self
    }

    pub fn with_adviser(mut self, adviser_type: impl Into<String>, parameters: Value) -> Self {
        self.advisers.push(AdviserObtainment::of(adviser_type, parameters));
        self
    }

    pub fn with_children(mut self, child_node_ids: Vec<String>) -> Self {
        self.child_node_ids = child_node_ids;
        self
    }

    pub fn with_step_parameters(mut self, parameters: Value) -> Self {
        self.step_parameters = parameters;
        self
    }

    pub fn with_skip(mut self, condition: impl Into<String>, skip_type: SkipType) -> Self {
        self.skip_condition = Some(condition.into());
        self.skip_type = skip_type;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// A resolved step graph.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: String,
    pub start_node_id: String,
    nodes: HashMap<String, Arc<PlanNode>>,
}

/// Serialized shape of a plan (nodes as a list).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PlanDefinition {
    pub id: String,
    pub start_node_id: String,
    pub nodes: Vec<PlanNode>,
}

impl Plan {
    pub fn new(id: impl Into<String>, start_node_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            start_node_id: start_node_id.into(),
            nodes: HashMap::new(),
        }
    }

    /// Adds a node to the plan.
    pub fn add_node(&mut self, node: PlanNode) -> Result<(), String> {
        if self.nodes.contains_key(&node.uuid) {
            return Err(format!("Node '{}' already exists", node.uuid));
        }
        self.nodes.insert(node.uuid.clone(), Arc::new(node));
        Ok(())
    }

    pub fn with_node(mut self, node: PlanNode) -> Self {
        self.nodes.insert(node.uuid.clone(), Arc::new(node));
        self
    }

    pub fn get_node(&self, node_id: &str) -> Option<Arc<PlanNode>> {
        self.nodes.get(node_id).cloned()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<PlanNode>> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn to_definition(&self) -> PlanDefinition {
        let mut nodes: Vec<PlanNode> = self.nodes.values().map(|n| n.as_ref().clone()).collect();
        nodes.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        PlanDefinition {
            id: self.id.clone(),
            start_node_id: self.start_node_id.clone(),
            nodes,
        }
    }
}

impl From<PlanDefinition> for Plan {
    fn from(definition: PlanDefinition) -> Self {
        let nodes = definition
            .nodes
            .into_iter()
            .map(|node| (node.uuid.clone(), Arc::new(node)))
            .collect();
        Self {
            id: definition.id,
            start_node_id: definition.start_node_id,
            nodes,
        }
    }
}
