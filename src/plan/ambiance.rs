//! Execution Ambiance
//!
//! The context threaded through every node of a plan execution: which plan
//! execution it belongs to, the setup abstractions (account/org/project
//! scoping) and the stack of levels leading to the current node.
//!
//! An ambiance is a plain owned value. Every derived ambiance is a fresh
//! clone, so sibling branches never share a mutable map or level stack.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::model::{PlanNode, StepCategory, StepType};

pub const ACCOUNT_ID_KEY: &str = "accountId";
pub const ORG_IDENTIFIER_KEY: &str = "orgIdentifier";
pub const PROJECT_IDENTIFIER_KEY: &str = "projectIdentifier";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AmbianceError {
    #[error("Level with runtime id '{0}' is not part of this ambiance")]
    LevelNotFound(String),

    #[error("Ambiance has no levels")]
    NoLevels,
}

/// One entry on the level stack.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Level {
    /// Plan node id
    pub setup_id: String,
    /// Node execution id
    pub runtime_id: String,
    pub identifier: String,
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Epoch millis when the level was entered
    pub start_ts: i64,
    #[serde(default)]
    pub retry_index: u32,
}

impl Level {
    /// Builds the level a node execution occupies.
    pub fn for_node(node: &PlanNode, runtime_id: impl Into<String>, retry_index: u32) -> Self {
        Self {
            setup_id: node.uuid.clone(),
            runtime_id: runtime_id.into(),
            identifier: node.identifier.clone(),
            step_type: node.step_type.clone(),
            group: node.group.clone(),
            start_ts: Utc::now().timestamp_millis(),
            retry_index,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Ambiance {
    plan_execution_id: String,
    plan_id: String,
    #[serde(default)]
    setup_abstractions: HashMap<String, String>,
    #[serde(default)]
    levels: Vec<Level>,
}

impl Ambiance {
    /// Creates the root ambiance of a plan execution (no levels yet).
    pub fn new(plan_execution_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            plan_id: plan_id.into(),
            setup_abstractions: HashMap::new(),
            levels: Vec::new(),
        }
    }

    pub fn with_setup_abstractions(mut self, abstractions: HashMap<String, String>) -> Self {
        self.setup_abstractions = abstractions;
        self
    }

    pub fn set_setup_abstraction(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.setup_abstractions.insert(key.into(), value.into());
    }

    pub fn plan_execution_id(&self) -> &str {
        &self.plan_execution_id
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn setup_abstractions(&self) -> &HashMap<String, String> {
        &self.setup_abstractions
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Returns a copy with `level` pushed onto the stack.
    pub fn clone_for_child(&self, level: Level) -> Self {
        let mut cloned = self.clone();
        cloned.levels.push(level);
        cloned
    }

    /// Returns a copy truncated back to, and excluding, `level`.
    ///
    /// The level is matched by runtime id. Fails if it is not on the stack.
    pub fn clone_for_finish(&self, level: &Level) -> Result<Self, AmbianceError> {
        let position = self
            .levels
            .iter()
            .position(|l| l.runtime_id == level.runtime_id)
            .ok_or_else(|| AmbianceError::LevelNotFound(level.runtime_id.clone()))?;
        Ok(self.clone_with_levels(position))
    }

    /// Returns a copy with the current (top) level removed.
    pub fn clone_for_finish_current(&self) -> Result<Self, AmbianceError> {
        let current = self.current_level().ok_or(AmbianceError::NoLevels)?;
        self.clone_for_finish(current)
    }

    /// Returns a copy keeping at most the first `levels_to_keep` levels.
    pub fn clone_with_levels(&self, levels_to_keep: usize) -> Self {
        let mut cloned = self.clone();
        cloned.levels.truncate(levels_to_keep);
        cloned
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn obtain_current_runtime_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.runtime_id.as_str())
    }

    pub fn obtain_current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.setup_id.as_str())
    }

    pub fn obtain_step_identifier(&self) -> Option<&str> {
        self.current_level().map(|l| l.identifier.as_str())
    }

    /// Runtime id of the level directly below the current one.
    pub fn obtain_parent_runtime_id(&self) -> Option<&str> {
        if self.levels.len() < 2 {
            return None;
        }
        Some(self.levels[self.levels.len() - 2].runtime_id.as_str())
    }

    pub fn current_step_type(&self) -> Option<&StepType> {
        self.current_level().map(|l| &l.step_type)
    }

    pub fn current_group(&self) -> Option<&str> {
        self.current_level().and_then(|l| l.group.as_deref())
    }

    pub fn current_level_start_ts(&self) -> Result<i64, AmbianceError> {
        self.current_level()
            .map(|l| l.start_ts)
            .ok_or(AmbianceError::NoLevels)
    }

    /// Innermost level whose step belongs to the `STAGE` category.
    pub fn stage_level(&self) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.step_type.category == StepCategory::Stage)
    }

    pub fn account_id(&self) -> Option<&str> {
        self.setup_abstractions.get(ACCOUNT_ID_KEY).map(String::as_str)
    }

    pub fn org_identifier(&self) -> Option<&str> {
        self.setup_abstractions.get(ORG_IDENTIFIER_KEY).map(String::as_str)
    }

    pub fn project_identifier(&self) -> Option<&str> {
        self.setup_abstractions.get(PROJECT_IDENTIFIER_KEY).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(setup: &str, runtime: &str, category: StepCategory) -> Level {
        Level {
            setup_id: setup.to_string(),
            runtime_id: runtime.to_string(),
            identifier: setup.to_string(),
            step_type: StepType::new(setup.to_uppercase(), category),
            group: None,
            start_ts: 7,
            retry_index: 0,
        }
    }

    fn build_ambiance() -> Ambiance {
        let mut abstractions = HashMap::new();
        abstractions.insert(ACCOUNT_ID_KEY.to_string(), "acc".to_string());
        abstractions.insert(ORG_IDENTIFIER_KEY.to_string(), "org".to_string());
        abstractions.insert(PROJECT_IDENTIFIER_KEY.to_string(), "proj".to_string());

        Ambiance::new("exec-1", "plan-1")
            .with_setup_abstractions(abstractions)
            .clone_for_child(level("phase", "r-phase", StepCategory::Pipeline))
            .clone_for_child(level("section", "r-section", StepCategory::Stage))
    }

    #[test]
    fn test_clone_for_child_appends_level() {
        let ambiance = build_ambiance();
        let child = ambiance.clone_for_child(level("step", "r-step", StepCategory::Step));

        assert_eq!(ambiance.levels().len(), 2);
        assert_eq!(child.levels().len(), 3);
        assert_eq!(child.obtain_current_runtime_id(), Some("r-step"));
        assert_eq!(child.plan_execution_id(), "exec-1");
    }

    #[test]
    fn test_clone_for_finish_to_root_level() {
        let ambiance = build_ambiance();
        let phase = ambiance.levels()[0].clone();

        let finished = ambiance.clone_for_finish(&phase).unwrap();

        assert!(finished.levels().is_empty());
        assert_eq!(finished.plan_execution_id(), "exec-1");
        assert_eq!(finished.plan_id(), "plan-1");
    }

    #[test]
    fn test_clone_for_finish_unknown_level() {
        let ambiance = build_ambiance();
        let stranger = level("other", "r-other", StepCategory::Step);

        let result = ambiance.clone_for_finish(&stranger);
        assert_eq!(result, Err(AmbianceError::LevelNotFound("r-other".to_string())));
    }

    #[test]
    fn test_clone_for_finish_current() {
        let ambiance = build_ambiance();
        let finished = ambiance.clone_for_finish_current().unwrap();
        assert_eq!(finished.obtain_current_runtime_id(), Some("r-phase"));

        let empty = Ambiance::new("e", "p");
        assert_eq!(empty.clone_for_finish_current(), Err(AmbianceError::NoLevels));
    }

    #[test]
    fn test_clones_do_not_share_state() {
        let original = build_ambiance();
        let mut cloned = original.clone_for_child(level("step", "r-step", StepCategory::Step));
        cloned.set_setup_abstraction(ACCOUNT_ID_KEY, "changed");
        cloned.set_setup_abstraction("extra", "value");

        assert_eq!(original.account_id(), Some("acc"));
        assert!(!original.setup_abstractions().contains_key("extra"));
        assert_eq!(original.levels().len(), 2);

        let sibling = original.clone_with_levels(1);
        assert_eq!(sibling.levels().len(), 1);
        assert_eq!(original.levels().len(), 2);
    }

    #[test]
    fn test_clone_with_levels_caps_at_stack_size() {
        let ambiance = build_ambiance();
        assert_eq!(ambiance.clone_with_levels(0).levels().len(), 0);
        assert_eq!(ambiance.clone_with_levels(1).levels().len(), 1);
        assert_eq!(ambiance.clone_with_levels(5).levels().len(), 2);
    }

    #[test]
    fn test_property_getters() {
        let ambiance = build_ambiance();
        assert_eq!(ambiance.account_id(), Some("acc"));
        assert_eq!(ambiance.org_identifier(), Some("org"));
        assert_eq!(ambiance.project_identifier(), Some("proj"));
        assert_eq!(ambiance.obtain_current_setup_id(), Some("section"));
        assert_eq!(ambiance.obtain_parent_runtime_id(), Some("r-phase"));
        assert_eq!(ambiance.obtain_step_identifier(), Some("section"));
        assert_eq!(ambiance.current_level_start_ts(), Ok(7));
        assert_eq!(ambiance.stage_level().unwrap().runtime_id, "r-section");
    }

    #[test]
    fn test_empty_ambiance_getters() {
        let ambiance = Ambiance::new("e", "p");
        assert!(ambiance.obtain_current_runtime_id().is_none());
        assert!(ambiance.obtain_current_setup_id().is_none());
        assert!(ambiance.obtain_parent_runtime_id().is_none());
        assert!(ambiance.current_step_type().is_none());
        assert!(ambiance.current_group().is_none());
        assert_eq!(ambiance.current_level_start_ts(), Err(AmbianceError::NoLevels));
    }
}
