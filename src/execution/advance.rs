//! Graph advancement: settling step responses, applying adviser
//! decisions, retries, scope and plan completion.

use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::json;
use uuid::Uuid;

use crate::adviser::{AdviserResponse, AdvisingEvent, MANUAL_INTERVENTION};
use crate::interrupt::{Interrupt, InterruptType, IssuedBy, TargetScope};
use crate::plan::{Level, PlanNode};
use crate::waiter::{EngineJob, ErrorResponse, NotifyCallback};

use super::engine::{Engine, EngineError};
use super::node::{FailureInfo, FailureType, InterruptEffect, NodeExecution};
use super::status::Status;
use super::step::StepResponse;

impl Engine {
    /// Settles a RUNNING node with the step's response and advances the graph.
    ///
    /// Advisers run before the status is written so that a node parked for
    /// intervention, or ignored, is persisted in its advised status.
    pub fn handle_step_response(
        &self,
        node_execution_id: Uuid,
        response: StepResponse,
    ) -> Result<(), EngineError> {
        let current = self.nodes.get(node_execution_id)?;
        if current.status != Status::Running {
            info!(
                "Node '{}' is {}, discarding step response",
                current.identifier, current.status
            );
            return Ok(());
        }

        let response = if response.status.is_final() {
            response
        } else {
            StepResponse::errored(FailureInfo::new(
                format!("Step returned non-final status {}", response.status),
                FailureType::Unknown,
            ))
        };

        let node = self
            .plans
            .get_node(current.ambiance.plan_id(), &current.node_id)?;

        let (status, failure_info, advice) = match self.advise(
            current.ambiance.plan_id(),
            &node,
            response.status,
            response.failure_info.as_ref(),
            current.retry_index,
        ) {
            Ok(advice) => (response.status, response.failure_info.clone(), advice),
            Err(reason) => (Status::Failed, Some(FailureInfo::configuration(reason)), None),
        };

        let advice = match advice {
            Some(AdviserResponse::Retry { .. })
                if failure_info
                    .as_ref()
                    .map(FailureInfo::is_configuration_error)
                    .unwrap_or(false) =>
            {
                Some(AdviserResponse::end_scope())
            }
            other => other,
        };

        let (settled_status, advised_status) = match &advice {
            Some(AdviserResponse::ManualIntervention { .. }) => {
                (Status::InterventionWaiting, Some(status))
            }
            Some(AdviserResponse::Ignore { .. }) => (Status::IgnoreFailed, Some(status)),
            _ => (status, None),
        };

        let settled = self.nodes.transition(
            node_execution_id,
            settled_status,
            &|s| s == Status::Running,
            &|ne| {
                ne.outcomes.extend(response.outcomes.iter().cloned());
                ne.failure_info = failure_info.clone();
                ne.adviser_response = advice.clone();
                ne.advised_status = advised_status;
                if settled_status == Status::InterventionWaiting {
                    ne.end_ts = Some(Utc::now());
                }
            },
        )?;
        let Some(settled) = settled else {
            info!(
                "Node '{}' changed concurrently, discarding step response",
                current.identifier
            );
            return Ok(());
        };

        self.after_settle(&settled);
        match &settled.failure_info {
            Some(failure) if settled.status != Status::Succeeded => info!(
                "Node '{}' finished {}: {}",
                settled.identifier, settled.status, failure.message
            ),
            _ => info!("Node '{}' finished {}", settled.identifier, settled.status),
        }

        if let Err(e) = self.apply_advice(&settled, &node, advice) {
            self.abandon(&settled, e)?;
        }
        Ok(())
    }

    /// Asks the node's advisers, in order, for the next action.
    ///
    /// `Err` means the advisers themselves are misconfigured: an unknown
    /// adviser type, bad parameters, a panic, or advice pointing at a node
    /// the plan does not have.
    pub(crate) fn advise(
        &self,
        plan_id: &str,
        node: &PlanNode,
        status: Status,
        failure_info: Option<&FailureInfo>,
        retry_index: u32,
    ) -> Result<Option<AdviserResponse>, String> {
        for obtainment in &node.advisers {
            let adviser = self
                .advisers
                .get(&obtainment.adviser_type)
                .ok_or_else(|| format!("Unknown adviser type '{}'", obtainment.adviser_type))?;
            let event = AdvisingEvent {
                node_identifier: &node.identifier,
                status,
                failure_info,
                retry_index,
                parameters: &obtainment.parameters,
                retry_policy: &self.config.retry_policy,
            };
            let claimed = panic::catch_unwind(AssertUnwindSafe(|| {
                if adviser.can_advise(&event) {
                    adviser.on_advise(&event).map(Some)
                } else {
                    Ok(None)
                }
            }))
            .map_err(|_| format!("Adviser '{}' panicked", obtainment.adviser_type))?;
            if let Some(response) = claimed.map_err(|e| e.to_string())? {
                self.check_advice_target(plan_id, &obtainment.adviser_type, &response)?;
                debug!(
                    "Adviser '{}' advised {:?} for node '{}'",
                    obtainment.adviser_type, response, node.identifier
                );
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    fn check_advice_target(
        &self,
        plan_id: &str,
        adviser_type: &str,
        response: &AdviserResponse,
    ) -> Result<(), String> {
        let target = match response {
            AdviserResponse::Proceed {
                next_node_id: Some(id),
            }
            | AdviserResponse::Ignore {
                next_node_id: Some(id),
            }
            | AdviserResponse::OnAbort {
                rollback_node_id: Some(id),
            } => id,
            _ => return Ok(()),
        };
        self.plans
            .get_node(plan_id, target)
            .map(|_| ())
            .map_err(|e| format!("Adviser '{}' points at a missing node: {}", adviser_type, e))
    }

    /// Re-advises a node that reached a final status outside of a step
    /// response (interrupts, errors, skips) and advances the graph.
    pub(crate) fn conclude(&self, node_execution: &NodeExecution) -> Result<(), EngineError> {
        let node = self
            .plans
            .get_node(node_execution.ambiance.plan_id(), &node_execution.node_id)?;

        let advice = match self.advise(
            node_execution.ambiance.plan_id(),
            &node,
            node_execution.status,
            node_execution.failure_info.as_ref(),
            node_execution.retry_index,
        ) {
            Ok(advice) => advice,
            Err(reason) => {
                warn!(
                    "Advisers of node '{}' failed: {}",
                    node_execution.identifier, reason
                );
                None
            }
        };

        // A final node can no longer be parked or re-labelled.
        let advice = match advice {
            Some(AdviserResponse::ManualIntervention { .. })
            | Some(AdviserResponse::Ignore { next_node_id: None }) => {
                Some(AdviserResponse::end_scope())
            }
            Some(AdviserResponse::Ignore {
                next_node_id: Some(next),
            }) => Some(AdviserResponse::Proceed {
                next_node_id: Some(next),
            }),
            Some(AdviserResponse::Retry { .. })
                if node_execution
                    .failure_info
                    .as_ref()
                    .map(FailureInfo::is_configuration_error)
                    .unwrap_or(false) =>
            {
                Some(AdviserResponse::end_scope())
            }
            other => other,
        };

        let recorded = advice.clone();
        self.nodes.update(node_execution.uuid, &|ne| {
            ne.adviser_response = recorded.clone()
        })?;

        if let Err(e) = self.apply_advice(node_execution, &node, advice) {
            self.abandon(node_execution, e)?;
        }
        Ok(())
    }

    /// A settled node whose advice could not be carried out. The cause is
    /// recorded on the node and its scope ends as ERRORED: the parent gets
    /// an error response, a top-level node ends the plan.
    fn abandon(&self, node_execution: &NodeExecution, cause: EngineError) -> Result<(), EngineError> {
        let message = format!(
            "Could not advance past node '{}': {}",
            node_execution.identifier, cause
        );
        error!("{}", message);
        let failure = FailureInfo::configuration(message.clone());
        let abandoned = self.nodes.update(node_execution.uuid, &|ne| {
            ne.failure_info = Some(failure.clone())
        })?;

        match abandoned.parent_id {
            Some(_) => {
                self.waiter.notify_error(
                    &abandoned.notify_id.to_string(),
                    ErrorResponse::new(message, vec![FailureType::Configuration]),
                );
                Ok(())
            }
            None => self.finish_plan(abandoned.plan_execution_id(), Some(Status::Errored)),
        }
    }

    fn apply_advice(
        &self,
        node_execution: &NodeExecution,
        node: &PlanNode,
        advice: Option<AdviserResponse>,
    ) -> Result<(), EngineError> {
        match advice {
            None
            | Some(AdviserResponse::Proceed { next_node_id: None })
            | Some(AdviserResponse::Ignore { next_node_id: None }) => self.end_scope(node_execution),
            Some(AdviserResponse::Proceed {
                next_node_id: Some(next),
            })
            | Some(AdviserResponse::Ignore {
                next_node_id: Some(next),
            }) => self.start_next(node_execution, &next),
            Some(AdviserResponse::Retry { attempt, wait_ms }) => {
                info!(
                    "Retrying node '{}' (attempt {}) in {}ms",
                    node_execution.identifier, attempt, wait_ms
                );
                self.retry(node_execution, Duration::from_millis(wait_ms))
                    .map(|_| ())
            }
            Some(AdviserResponse::ManualIntervention {
                timeout_secs,
                timeout_action,
            }) => {
                info!(
                    "Node '{}' is waiting for manual intervention",
                    node_execution.identifier
                );
                if let Some(secs) = timeout_secs {
                    self.schedule_intervention_timeout(
                        node_execution,
                        Duration::from_secs(secs),
                        timeout_action,
                    );
                }
                Ok(())
            }
            Some(AdviserResponse::OnAbort { rollback_node_id }) => {
                self.unwind(node_execution, node, rollback_node_id.as_deref())
            }
        }
    }

    /// Registers `action` (MARK_EXPIRED by default) against a node parked
    /// for intervention once `after` has passed.
    pub(crate) fn schedule_intervention_timeout(
        &self,
        node_execution: &NodeExecution,
        after: Duration,
        action: Option<InterruptType>,
    ) {
        let action = action.unwrap_or(InterruptType::MarkExpired);
        let target = match action.target_scope() {
            TargetScope::Plan => None,
            _ => Some(node_execution.uuid),
        };
        let interrupt = Interrupt::new(
            action,
            node_execution.plan_execution_id(),
            target,
            IssuedBy::Adviser {
                adviser_type: MANUAL_INTERVENTION.to_string(),
            },
        );
        debug!(
            "{} for node '{}' scheduled in {}s",
            action,
            node_execution.identifier,
            after.as_secs()
        );
        self.waiter.schedule(
            after,
            NotifyCallback::RegisterInterrupt {
                interrupt: Box::new(interrupt),
            },
        );
    }

    /// Queues `next_node_id` as the sibling following `node_execution`.
    fn start_next(
        &self,
        node_execution: &NodeExecution,
        next_node_id: &str,
    ) -> Result<(), EngineError> {
        let next = self
            .plans
            .get_node(node_execution.ambiance.plan_id(), next_node_id)?;
        let sibling_ambiance = node_execution.ambiance.clone_for_finish_current()?;
        self.trigger_node(
            &sibling_ambiance,
            &next,
            node_execution.parent_id,
            Some(node_execution.uuid),
            None,
            Some(node_execution.notify_id),
        )?;
        Ok(())
    }

    /// Creates the next attempt of a failed node and queues it after `wait`.
    ///
    /// The new attempt keeps the notify id, so a waiting parent sees only
    /// the last attempt's result.
    pub(crate) fn retry(
        &self,
        node_execution: &NodeExecution,
        wait: Duration,
    ) -> Result<Uuid, EngineError> {
        let node = self
            .plans
            .get_node(node_execution.ambiance.plan_id(), &node_execution.node_id)?;

        let id = Uuid::new_v4();
        let retry_index = node_execution.retry_index + 1;
        let ambiance = node_execution
            .ambiance
            .clone_for_finish_current()?
            .clone_for_child(Level::for_node(&node, id.to_string(), retry_index));

        let mut attempt = NodeExecution::new(id, ambiance, &node)
            .with_parent(node_execution.parent_id)
            .with_previous(node_execution.previous_id);
        attempt.notify_id = node_execution.notify_id;
        attempt.retry_index = retry_index;
        attempt.retry_ids = node_execution.retry_ids.clone();
        attempt.retry_ids.push(node_execution.uuid);
        self.nodes.save(attempt)?;

        self.nodes
            .update(node_execution.uuid, &|ne| ne.old_retry = true)?;
        if let Some(previous_id) = node_execution.previous_id {
            self.nodes.update(previous_id, &|prev| prev.next_id = Some(id))?;
        }

        if wait.is_zero() {
            self.jobs.send(EngineJob::StartNode {
                node_execution_id: id,
            });
        } else {
            self.waiter
                .schedule(wait, NotifyCallback::StartNode { node_execution_id: id });
        }
        Ok(id)
    }

    /// Ends the scope `node_execution` was running in.
    ///
    /// Inside a parent the notify id is signalled; at the top level the
    /// plan execution ends.
    pub(crate) fn end_scope(&self, node_execution: &NodeExecution) -> Result<(), EngineError> {
        match node_execution.parent_id {
            Some(parent_id) => {
                debug!(
                    "Node '{}' ends its scope under '{}'",
                    node_execution.identifier, parent_id
                );
                self.waiter.notify_success(
                    &node_execution.notify_id.to_string(),
                    json!({
                        "status": node_execution.status,
                        "node_execution_id": node_execution.uuid,
                    }),
                );
                Ok(())
            }
            None => self.end_plan(node_execution.plan_execution_id()),
        }
    }

    /// Computes the plan's final status and finishes the plan execution.
    pub(crate) fn end_plan(&self, plan_execution_id: &str) -> Result<(), EngineError> {
        self.finish_plan(plan_execution_id, None)
    }

    /// `forced` replaces the status aggregated from the top-level nodes.
    fn finish_plan(
        &self,
        plan_execution_id: &str,
        forced: Option<Status>,
    ) -> Result<(), EngineError> {
        let plan_execution = self.plan_executions.get(plan_execution_id)?;
        if plan_execution.is_final() {
            return Ok(());
        }

        let status = if plan_execution.discontinuing {
            self.abort_active(plan_execution_id, None)?;
            Status::Aborted
        } else if let Some(status) = forced {
            status
        } else {
            let top_level = self
                .nodes
                .find_by_plan_execution(plan_execution_id)
                .into_iter()
                .filter(|ne| ne.parent_id.is_none() && !ne.old_retry && ne.is_final())
                .map(|ne| ne.status);
            match Status::aggregate(top_level) {
                Status::Skipped | Status::IgnoreFailed => Status::Succeeded,
                other => other,
            }
        };

        let ended = self.plan_executions.transition(
            plan_execution_id,
            status,
            &|s| s.is_active(),
            &|pe| pe.end_ts = Some(Utc::now()),
        )?;
        if ended.is_none() {
            return Ok(());
        }

        let ttl = self.retention();
        let until = Utc::now() + ttl;
        let retained = self.nodes.set_valid_until(plan_execution_id, until);
        self.plan_executions
            .update(plan_execution_id, &|pe| pe.valid_until = Some(until))?;
        debug!(
            "Retaining {} node execution(s) of '{}' until {}",
            retained, plan_execution_id, until
        );

        info!("Plan execution '{}' finished {}", plan_execution_id, status);
        self.waiter.prune(ttl);

        if self.config.state_dir.is_some() {
            if let Err(e) = self.write_snapshot(plan_execution_id) {
                warn!(
                    "Could not write snapshot for '{}': {}",
                    plan_execution_id, e
                );
            }
        }

        if let Some(tx) = self.completions.get(plan_execution_id) {
            tx.send_replace(status);
        }
        Ok(())
    }

    /// ON_ABORT: stops the plan from advancing and unwinds the ancestors.
    ///
    /// The rollback node, if any, runs at the top level; the plan ends
    /// ABORTED once it finishes.
    fn unwind(
        &self,
        node_execution: &NodeExecution,
        node: &PlanNode,
        rollback_node_id: Option<&str>,
    ) -> Result<(), EngineError> {
        let plan_execution_id = node_execution.plan_execution_id();
        self.plan_executions
            .update(plan_execution_id, &|pe| pe.discontinuing = true)?;
        info!(
            "Node '{}' aborted, unwinding plan execution '{}'",
            node.identifier, plan_execution_id
        );

        let mut ancestor = node_execution.parent_id;
        while let Some(id) = ancestor {
            self.nodes
                .transition(id, Status::Discontinuing, &|s| s.is_active(), &|_| {})?;
            ancestor = self.nodes.get(id)?.parent_id;
        }

        match rollback_node_id {
            Some(rollback_node_id) => {
                let rollback = self
                    .plans
                    .get_node(node_execution.ambiance.plan_id(), rollback_node_id)?;
                info!("Running rollback node '{}'", rollback.identifier);
                let root = node_execution.ambiance.clone_with_levels(0);
                self.trigger_node(&root, &rollback, None, None, None, None)?;
                Ok(())
            }
            None => self.end_plan(plan_execution_id),
        }
    }

    /// Moves every active node of a plan execution to ABORTED.
    pub(crate) fn abort_active(
        &self,
        plan_execution_id: &str,
        effect: Option<&InterruptEffect>,
    ) -> Result<usize, EngineError> {
        let mut aborted = 0;
        for active in self.nodes.find_active_by_plan_execution(plan_execution_id) {
            if self.terminate(active.uuid, Status::Aborted, None, effect)?.is_some() {
                aborted += 1;
            }
        }
        Ok(aborted)
    }

    /// Moves every active descendant of `node_execution_id` to `status`.
    pub(crate) fn terminate_descendants(
        &self,
        node_execution_id: Uuid,
        status: Status,
        failure: Option<&FailureInfo>,
        effect: Option<&InterruptEffect>,
    ) -> Result<usize, EngineError> {
        let mut terminated = 0;
        for descendant in self.nodes.find_descendants(node_execution_id).iter().rev() {
            if descendant.status.is_active()
                && self
                    .terminate(descendant.uuid, status, failure, effect)?
                    .is_some()
            {
                terminated += 1;
            }
        }
        Ok(terminated)
    }

    /// Forces one active node into a final status without advising it.
    pub(crate) fn terminate(
        &self,
        node_execution_id: Uuid,
        status: Status,
        failure: Option<&FailureInfo>,
        effect: Option<&InterruptEffect>,
    ) -> Result<Option<NodeExecution>, EngineError> {
        let terminated = self.nodes.transition(
            node_execution_id,
            status,
            &|s| s.is_active(),
            &|ne| {
                if let Some(failure) = failure {
                    ne.failure_info = Some(failure.clone());
                }
                if let Some(effect) = effect {
                    ne.interrupt_history.push(effect.clone());
                }
            },
        )?;
        if let Some(node_execution) = &terminated {
            debug!("Node '{}' forced to {}", node_execution.identifier, status);
            self.after_settle(node_execution);
            self.waiter.cancel_for(node_execution_id);
        }
        Ok(terminated)
    }
}
