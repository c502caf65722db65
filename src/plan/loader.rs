//! Plan Loader
//!
//! Loads an already-resolved plan from a YAML file. Only referential
//! integrity is checked here (every referenced node exists); authoring-level
//! validation belongs to whatever produced the plan.

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde_json::Value;

use super::model::{Plan, PlanDefinition};
use super::PlanError;

/// Adviser parameter keys that reference other nodes.
const NODE_REFERENCE_KEYS: &[&str] = &["next_node_id", "rollback_node_id"];

/// Loads a plan from a YAML file.
///
/// # Returns
///
/// * `Ok(Plan)` - Plan with all node references resolvable
/// * `Err` - File unreadable, malformed, or referencing unknown nodes
pub fn load_plan(path: impl AsRef<Path>) -> Result<Plan, PlanError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|e| PlanError::Io(format!("{}: {}", path.display(), e)))?;

    let plan = parse_plan(&content)?;
    info!(
        "Loaded plan '{}' from {} ({} nodes)",
        plan.id,
        path.display(),
        plan.len()
    );
    Ok(plan)
}

/// Parses a plan from YAML text and checks its references.
pub fn parse_plan(content: &str) -> Result<Plan, PlanError> {
    let definition: PlanDefinition =
        serde_yaml::from_str(content).map_err(|e| PlanError::Parse(e.to_string()))?;
    let plan = Plan::from(definition);
    check_references(&plan)?;
    Ok(plan)
}

/// Ensures the start node and every child/next/rollback reference exist.
pub fn check_references(plan: &Plan) -> Result<(), PlanError> {
    let dangling = |from: &str, to: &str| PlanError::DanglingReference {
        from: from.to_string(),
        to: to.to_string(),
    };

    if plan.get_node(&plan.start_node_id).is_none() {
        return Err(dangling("<start>", &plan.start_node_id));
    }

    for node in plan.nodes() {
        for child in &node.child_node_ids {
            if plan.get_node(child).is_none() {
                return Err(dangling(&node.uuid, child));
            }
        }

        for adviser in &node.advisers {
            for key in NODE_REFERENCE_KEYS {
                if let Some(Value::String(target)) = adviser.parameters.get(*key) {
                    if plan.get_node(target).is_none() {
                        return Err(dangling(&node.uuid, target));
                    }
                }
            }
        }
    }

    debug!("Plan '{}' references resolved", plan.id);
    Ok(())
}
