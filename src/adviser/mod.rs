//! Adviser Module
//!
//! Advisers map the outcome of a node to the next control action. A node
//! lists its advisers in order; the first whose [`Adviser::can_advise`]
//! claims the outcome decides.
//!
//! Advisers are stateless. Everything they need (the node's status, failure,
//! retry index and the obtainment's parameters) arrives in the
//! [`AdvisingEvent`].
//!
//! # Built-in advisers
//!
//! | Type                  | Claims                 | Parameters                                      |
//! |-----------------------|------------------------|-------------------------------------------------|
//! | `ON_SUCCESS`          | positive statuses      | `next_node_id`                                  |
//! | `ON_FAIL`             | failed statuses        | `next_node_id`, `failure_types`                 |
//! | `RETRY`               | failed, not config     | `retry_count`, `wait_secs`, `after_retry`, `failure_types` |
//! | `MANUAL_INTERVENTION` | failed statuses        | `timeout_secs`, `timeout_action`, `failure_types` |
//! | `IGNORE`              | failed statuses        | `next_node_id`, `failure_types`                 |
//! | `ON_ABORT`            | ABORTED                | `rollback_node_id`                              |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::RetryPolicy;
use crate::execution::{FailureInfo, FailureType, Status};
use crate::interrupt::InterruptType;

pub const ON_SUCCESS: &str = "ON_SUCCESS";
pub const ON_FAIL: &str = "ON_FAIL";
pub const RETRY: &str = "RETRY";
pub const MANUAL_INTERVENTION: &str = "MANUAL_INTERVENTION";
pub const IGNORE: &str = "IGNORE";
pub const ON_ABORT: &str = "ON_ABORT";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdviserError {
    #[error("Invalid parameters for adviser '{adviser_type}': {reason}")]
    InvalidParameters { adviser_type: String, reason: String },
}

/// The next control action for a concluded node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserResponse {
    /// Continue with `next_node_id`, or finish the current scope
    Proceed {
        #[serde(default)]
        next_node_id: Option<String>,
    },
    /// Run the node again after `wait_ms`
    Retry { attempt: u32, wait_ms: u64 },
    /// Park the node until an operator interrupt arrives
    ManualIntervention {
        #[serde(default)]
        timeout_secs: Option<u64>,
        #[serde(default)]
        timeout_action: Option<InterruptType>,
    },
    /// Record IGNORE_FAILED and continue as if passed
    Ignore {
        #[serde(default)]
        next_node_id: Option<String>,
    },
    /// Unwind the ancestors, running `rollback_node_id` first
    OnAbort {
        #[serde(default)]
        rollback_node_id: Option<String>,
    },
}

impl AdviserResponse {
    pub fn end_scope() -> Self {
        AdviserResponse::Proceed { next_node_id: None }
    }

    pub fn retry_wait(&self) -> Option<Duration> {
        match self {
            AdviserResponse::Retry { wait_ms, .. } => Some(Duration::from_millis(*wait_ms)),
            _ => None,
        }
    }
}

/// Everything an adviser sees about a concluded node.
#[derive(Debug, Clone, Copy)]
pub struct AdvisingEvent<'a> {
    pub node_identifier: &'a str,
    pub status: Status,
    pub failure_info: Option<&'a FailureInfo>,
    pub retry_index: u32,
    pub parameters: &'a Value,
    pub retry_policy: &'a RetryPolicy,
}

impl AdvisingEvent<'_> {
    fn is_configuration_failure(&self) -> bool {
        self.failure_info
            .map(FailureInfo::is_configuration_error)
            .unwrap_or(false)
    }

    /// True when `filter` is empty or shares a type with the failure.
    fn failure_matches(&self, filter: &[FailureType]) -> bool {
        if filter.is_empty() {
            return true;
        }
        self.failure_info
            .map(|info| filter.iter().any(|t| info.has_type(*t)))
            .unwrap_or(false)
    }
}

pub trait Adviser: Send + Sync {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool;

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, AdviserError>;
}

fn parameters<T: DeserializeOwned + Default>(
    adviser_type: &str,
    value: &Value,
) -> Result<T, AdviserError> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone()).map_err(|e| AdviserError::InvalidParameters {
        adviser_type: adviser_type.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Deserialize, Default)]
struct NextNodeParameters {
    #[serde(default)]
    next_node_id: Option<String>,
    #[serde(default)]
    failure_types: Vec<FailureType>,
}

pub struct OnSuccessAdviser;

impl Adviser for OnSuccessAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.status.is_positive()
    }

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, AdviserError> {
        let params: NextNodeParameters = parameters(ON_SUCCESS, event.parameters)?;
        Ok(AdviserResponse::Proceed {
            next_node_id: params.next_node_id,
        })
    }
}

pub struct OnFailAdviser;

impl Adviser for OnFailAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        if !event.status.is_broke() {
            return false;
        }
        parameters::<NextNodeParameters>(ON_FAIL, event.parameters)
            .map(|p| event.failure_matches(&p.failure_types))
            .unwrap_or(true)
    }

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, AdviserError> {
        let params: NextNodeParameters = parameters(ON_FAIL, event.parameters)?;
        Ok(AdviserResponse::Proceed {
            next_node_id: params.next_node_id,
        })
    }
}

/// What a RETRY adviser does once its attempts are used up.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairAction {
    /// Leave the node failed and finish the scope
    #[default]
    MarkFailed,
    Proceed {
        #[serde(default)]
        next_node_id: Option<String>,
    },
    Ignore {
        #[serde(default)]
        next_node_id: Option<String>,
    },
    ManualIntervention {
        #[serde(default)]
        timeout_secs: Option<u64>,
        #[serde(default)]
        timeout_action: Option<InterruptType>,
    },
    Abort,
}

impl RepairAction {
    fn into_response(self) -> AdviserResponse {
        match self {
            RepairAction::MarkFailed => AdviserResponse::end_scope(),
            RepairAction::Proceed { next_node_id } => AdviserResponse::Proceed { next_node_id },
            RepairAction::Ignore { next_node_id } => AdviserResponse::Ignore { next_node_id },
            RepairAction::ManualIntervention {
                timeout_secs,
                timeout_action,
            } => AdviserResponse::ManualIntervention {
                timeout_secs,
                timeout_action,
            },
            RepairAction::Abort => AdviserResponse::OnAbort {
                rollback_node_id: None,
            },
        }
    }
}

#[derive(Deserialize, Default)]
struct RetryParameters {
    #[serde(default)]
    retry_count: u32,
    /// Wait before each attempt; the last entry repeats
    #[serde(default)]
    wait_secs: Vec<u64>,
    #[serde(default)]
    after_retry: RepairAction,
    #[serde(default)]
    failure_types: Vec<FailureType>,
}

pub struct RetryAdviser;

impl Adviser for RetryAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        if !event.status.is_broke() || event.is_configuration_failure() {
            return false;
        }
        parameters::<RetryParameters>(RETRY, event.parameters)
            .map(|p| event.failure_matches(&p.failure_types))
            .unwrap_or(true)
    }

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, AdviserError> {
        let params: RetryParameters = parameters(RETRY, event.parameters)?;

        if event.retry_index >= params.retry_count {
            return Ok(params.after_retry.into_response());
        }

        let attempt = event.retry_index + 1;
        let wait = match params.wait_secs.as_slice() {
            [] => event.retry_policy.wait_for(attempt),
            waits => {
                let index = (event.retry_index as usize).min(waits.len() - 1);
                Duration::from_secs(waits[index])
            }
        };
        Ok(AdviserResponse::Retry {
            attempt,
            wait_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
        })
    }
}

#[derive(Deserialize, Default)]
struct InterventionParameters {
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    timeout_action: Option<InterruptType>,
    #[serde(default)]
    failure_types: Vec<FailureType>,
}

pub struct ManualInterventionAdviser;

impl Adviser for ManualInterventionAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        if !event.status.is_broke() {
            return false;
        }
        parameters::<InterventionParameters>(MANUAL_INTERVENTION, event.parameters)
            .map(|p| event.failure_matches(&p.failure_types))
            .unwrap_or(true)
    }

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, AdviserError> {
        let params: InterventionParameters = parameters(MANUAL_INTERVENTION, event.parameters)?;
        Ok(AdviserResponse::ManualIntervention {
            timeout_secs: params.timeout_secs,
            timeout_action: params.timeout_action,
        })
    }
}

pub struct IgnoreAdviser;

impl Adviser for IgnoreAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        if !event.status.is_broke() {
            return false;
        }
        parameters::<NextNodeParameters>(IGNORE, event.parameters)
            .map(|p| event.failure_matches(&p.failure_types))
            .unwrap_or(true)
    }

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, AdviserError> {
        let params: NextNodeParameters = parameters(IGNORE, event.parameters)?;
        Ok(AdviserResponse::Ignore {
            next_node_id: params.next_node_id,
        })
    }
}

#[derive(Deserialize, Default)]
struct AbortParameters {
    #[serde(default)]
    rollback_node_id: Option<String>,
}

pub struct OnAbortAdviser;

impl Adviser for OnAbortAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.status == Status::Aborted
    }

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, AdviserError> {
        let params: AbortParameters = parameters(ON_ABORT, event.parameters)?;
        Ok(AdviserResponse::OnAbort {
            rollback_node_id: params.rollback_node_id,
        })
    }
}

/// Immutable adviser lookup table, keyed by adviser type.
#[derive(Clone, Default)]
pub struct AdviserRegistry {
    advisers: HashMap<String, Arc<dyn Adviser>>,
}

impl AdviserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in adviser.
    pub fn builtin() -> Self {
        Self::new()
            .with(ON_SUCCESS, Arc::new(OnSuccessAdviser))
            .with(ON_FAIL, Arc::new(OnFailAdviser))
            .with(RETRY, Arc::new(RetryAdviser))
            .with(MANUAL_INTERVENTION, Arc::new(ManualInterventionAdviser))
            .with(IGNORE, Arc::new(IgnoreAdviser))
            .with(ON_ABORT, Arc::new(OnAbortAdviser))
    }

    pub fn with(mut self, adviser_type: impl Into<String>, adviser: Arc<dyn Adviser>) -> Self {
        self.advisers.insert(adviser_type.into(), adviser);
        self
    }

    pub fn get(&self, adviser_type: &str) -> Option<Arc<dyn Adviser>> {
        self.advisers.get(adviser_type).cloned()
    }

    pub fn contains(&self, adviser_type: &str) -> bool {
        self.advisers.contains_key(adviser_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event<'a>(
        status: Status,
        failure: Option<&'a FailureInfo>,
        retry_index: u32,
        parameters: &'a Value,
        policy: &'a RetryPolicy,
    ) -> AdvisingEvent<'a> {
        AdvisingEvent {
            node_identifier: "deploy",
            status,
            failure_info: failure,
            retry_index,
            parameters,
            retry_policy: policy,
        }
    }

    #[test]
    fn test_on_success_claims_positive_only() {
        let params = json!({ "next_node_id": "publish" });
        let policy = RetryPolicy::default();
        let adviser = OnSuccessAdviser;

        let ok = event(Status::Succeeded, None, 0, &params, &policy);
        assert!(adviser.can_advise(&ok));
        assert_eq!(
            adviser.on_advise(&ok).unwrap(),
            AdviserResponse::Proceed {
                next_node_id: Some("publish".to_string())
            }
        );
        assert!(adviser.can_advise(&event(Status::IgnoreFailed, None, 0, &params, &policy)));
        assert!(!adviser.can_advise(&event(Status::Failed, None, 0, &params, &policy)));
    }

    #[test]
    fn test_retry_uses_explicit_waits() {
        let params = json!({ "retry_count": 3, "wait_secs": [1, 5] });
        let policy = RetryPolicy::default();
        let failure = FailureInfo::new("flaky", FailureType::Connectivity);
        let adviser = RetryAdviser;

        let first = event(Status::Failed, Some(&failure), 0, &params, &policy);
        assert_eq!(
            adviser.on_advise(&first).unwrap(),
            AdviserResponse::Retry {
                attempt: 1,
                wait_ms: 1_000
            }
        );

        let third = event(Status::Failed, Some(&failure), 2, &params, &policy);
        assert_eq!(
            adviser.on_advise(&third).unwrap(),
            AdviserResponse::Retry {
                attempt: 3,
                wait_ms: 5_000
            }
        );
    }

    #[test]
    fn test_retry_falls_back_to_policy() {
        let params = json!({ "retry_count": 2 });
        let policy = RetryPolicy {
            base_wait_ms: 100,
            multiplier: 3.0,
            max_wait_ms: 10_000,
        };
        let failure = FailureInfo::new("flaky", FailureType::Unknown);
        let response = RetryAdviser
            .on_advise(&event(Status::Errored, Some(&failure), 1, &params, &policy))
            .unwrap();
        assert_eq!(response.retry_wait(), Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_retry_exhausted_runs_repair_action() {
        let params = json!({
            "retry_count": 1,
            "after_retry": { "action": "MANUAL_INTERVENTION", "timeout_secs": 60, "timeout_action": "ABORT" }
        });
        let policy = RetryPolicy::default();
        let failure = FailureInfo::new("still failing", FailureType::Application);

        let response = RetryAdviser
            .on_advise(&event(Status::Failed, Some(&failure), 1, &params, &policy))
            .unwrap();
        assert_eq!(
            response,
            AdviserResponse::ManualIntervention {
                timeout_secs: Some(60),
                timeout_action: Some(InterruptType::Abort)
            }
        );
    }

    #[test]
    fn test_retry_skips_configuration_failures() {
        let params = json!({ "retry_count": 5 });
        let policy = RetryPolicy::default();
        let failure = FailureInfo::configuration("unknown step type 'BOGUS'");
        assert!(!RetryAdviser.can_advise(&event(Status::Failed, Some(&failure), 0, &params, &policy)));
    }

    #[test]
    fn test_failure_type_filter() {
        let params = json!({ "failure_types": ["TIMEOUT"] });
        let policy = RetryPolicy::default();
        let timeout = FailureInfo::new("too slow", FailureType::Timeout);
        let auth = FailureInfo::new("denied", FailureType::Authentication);

        assert!(IgnoreAdviser.can_advise(&event(Status::Expired, Some(&timeout), 0, &params, &policy)));
        assert!(!IgnoreAdviser.can_advise(&event(Status::Failed, Some(&auth), 0, &params, &policy)));
    }

    #[test]
    fn test_on_abort_claims_aborted() {
        let params = json!({ "rollback_node_id": "cleanup" });
        let policy = RetryPolicy::default();
        let aborted = event(Status::Aborted, None, 0, &params, &policy);

        assert!(OnAbortAdviser.can_advise(&aborted));
        assert!(!OnFailAdviser.can_advise(&aborted));
        assert_eq!(
            OnAbortAdviser.on_advise(&aborted).unwrap(),
            AdviserResponse::OnAbort {
                rollback_node_id: Some("cleanup".to_string())
            }
        );
    }

    #[test]
    fn test_invalid_parameters() {
        let params = json!({ "retry_count": "many" });
        let policy = RetryPolicy::default();
        let failure = FailureInfo::new("x", FailureType::Unknown);
        assert!(matches!(
            RetryAdviser.on_advise(&event(Status::Failed, Some(&failure), 0, &params, &policy)),
            Err(AdviserError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn test_builtin_registry() {
        let registry = AdviserRegistry::builtin();
        for kind in [ON_SUCCESS, ON_FAIL, RETRY, MANUAL_INTERVENTION, IGNORE, ON_ABORT] {
            assert!(registry.contains(kind), "{}", kind);
        }
        assert!(registry.get("BOGUS").is_none());
    }
}
