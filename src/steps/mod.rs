//! Built-in Steps
//!
//! Orchestration steps every engine knows without registration:
//!
//! | Kind      | Mode     | Behaviour                                        |
//! |-----------|----------|--------------------------------------------------|
//! | `NOOP`    | SYNC     | Succeeds immediately                             |
//! | `SECTION` | CHILD    | Runs its first child node, result of the child   |
//! | `FORK`    | CHILDREN | Runs all child nodes concurrently, worst-wins     |
//! | `WAIT`    | ASYNC    | Succeeds after `wait_secs` / `wait_ms`           |

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::execution::{Step, StepContext, StepError, StepRegistry, StepResponse};

pub const NOOP: &str = "NOOP";
pub const SECTION: &str = "SECTION";
pub const FORK: &str = "FORK";
pub const WAIT: &str = "WAIT";

/// Registry with every built-in step.
pub fn builtin_registry() -> StepRegistry {
    StepRegistry::new()
        .with(NOOP, Arc::new(NoopStep))
        .with(SECTION, Arc::new(SectionStep))
        .with(FORK, Arc::new(ForkStep))
        .with(WAIT, Arc::new(WaitStep))
}

pub struct NoopStep;

impl Step for NoopStep {
    fn execute_sync(&self, ctx: &StepContext<'_>) -> Result<StepResponse, StepError> {
        debug!("NOOP '{}'", ctx.node.identifier);
        Ok(StepResponse::succeeded())
    }
}

/// Groups a child chain; relies on the default child resolution.
pub struct SectionStep;

impl Step for SectionStep {}

/// Fans out to every child node.
pub struct ForkStep;

impl Step for ForkStep {
    fn obtain_children(&self, ctx: &StepContext<'_>) -> Result<Vec<String>, StepError> {
        if ctx.node.child_node_ids.is_empty() {
            return Err(StepError::MissingChildren(ctx.node.identifier.clone()));
        }
        Ok(ctx.node.child_node_ids.clone())
    }
}

#[derive(Deserialize, Default)]
struct WaitParameters {
    #[serde(default)]
    wait_secs: Option<u64>,
    #[serde(default)]
    wait_ms: Option<u64>,
}

/// Sleeps without holding a thread: the waiter notifies the node's own
/// callback id once the duration has passed.
pub struct WaitStep;

impl WaitStep {
    fn duration(ctx: &StepContext<'_>) -> Result<Duration, StepError> {
        let params: WaitParameters = if ctx.node.step_parameters.is_null() {
            WaitParameters::default()
        } else {
            serde_json::from_value(ctx.node.step_parameters.clone())
                .map_err(|e| StepError::InvalidParameters(e.to_string()))?
        };
        match (params.wait_secs, params.wait_ms) {
            (_, Some(ms)) => Ok(Duration::from_millis(ms)),
            (Some(secs), None) => Ok(Duration::from_secs(secs)),
            (None, None) => Err(StepError::InvalidParameters(
                "WAIT needs wait_secs or wait_ms".to_string(),
            )),
        }
    }
}

impl Step for WaitStep {
    fn execute_async(&self, ctx: &StepContext<'_>) -> Result<Vec<String>, StepError> {
        let duration = Self::duration(ctx)?;
        let callback_id = format!("wait-{}", Uuid::new_v4());
        debug!(
            "WAIT '{}' for {}ms",
            ctx.node.identifier,
            duration.as_millis()
        );
        ctx.waiter.notify_after(
            duration,
            callback_id.clone(),
            json!({ "waited_ms": u64::try_from(duration.as_millis()).unwrap_or(u64::MAX) }),
        );
        Ok(vec![callback_id])
    }
}
