//! Skip condition evaluation.

use crate::plan::Ambiance;

pub trait ConditionEvaluator: Send + Sync {
    /// Evaluates a node's skip condition. `Err` carries a readable reason.
    fn evaluate(&self, ambiance: &Ambiance, expression: &str) -> Result<bool, String>;
}

/// Understands only the literals `true` and `false`.
pub struct LiteralConditionEvaluator;

impl ConditionEvaluator for LiteralConditionEvaluator {
    fn evaluate(&self, _ambiance: &Ambiance, expression: &str) -> Result<bool, String> {
        match expression.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(format!("cannot evaluate condition '{}'", other)),
        }
    }
}
