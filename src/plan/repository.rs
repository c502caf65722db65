//! Plan storage
//!
//! Plans are registered once and then only read. The engine resolves nodes
//! through [`PlanRepository::get_node`] every time it needs one.

use std::sync::Arc;

use dashmap::DashMap;
use log::debug;

use super::model::{Plan, PlanNode};
use super::PlanError;

pub trait PlanRepository: Send + Sync {
    fn save(&self, plan: Plan) -> Result<(), PlanError>;

    fn get_plan(&self, plan_id: &str) -> Result<Arc<Plan>, PlanError>;

    fn get_node(&self, plan_id: &str, node_id: &str) -> Result<Arc<PlanNode>, PlanError> {
        let plan = self.get_plan(plan_id)?;
        plan.get_node(node_id).ok_or_else(|| PlanError::NodeNotFound {
            plan_id: plan_id.to_string(),
            node_id: node_id.to_string(),
        })
    }
}

#[derive(Default)]
pub struct InMemoryPlanRepository {
    plans: DashMap<String, Arc<Plan>>,
}

impl InMemoryPlanRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlanRepository for InMemoryPlanRepository {
    fn save(&self, plan: Plan) -> Result<(), PlanError> {
        debug!("Registering plan '{}' with {} nodes", plan.id, plan.len());
        self.plans.insert(plan.id.clone(), Arc::new(plan));
        Ok(())
    }

    fn get_plan(&self, plan_id: &str) -> Result<Arc<Plan>, PlanError> {
        self.plans
            .get(plan_id)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| PlanError::PlanNotFound(plan_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanNode, StepType};

    #[test]
    fn test_get_node() {
        let repo = InMemoryPlanRepository::new();
        let plan = Plan::new("p1", "a").with_node(PlanNode::new("a", "a", StepType::step("NOOP")));
        repo.save(plan).unwrap();

        assert_eq!(repo.get_node("p1", "a").unwrap().identifier, "a");
        assert!(matches!(
            repo.get_node("p1", "missing"),
            Err(PlanError::NodeNotFound { .. })
        ));
        assert!(matches!(repo.get_plan("p2"), Err(PlanError::PlanNotFound(_))));
    }
}
