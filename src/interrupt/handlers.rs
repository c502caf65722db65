//! Interrupt application.
//!
//! Runs on the executor once an interrupt has been registered. Each handler
//! changes state only through conditional transitions, so an interrupt that
//! races with a node finishing on its own simply finds nothing to do and is
//! recorded as DISCARDED.

use chrono::Utc;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::execution::{
    Engine, EngineError, FailureInfo, FailureType, InterruptEffect, NodeExecution, Status,
};
use crate::waiter::EngineJob;

use super::model::{Interrupt, InterruptConfig, InterruptState, InterruptType};

impl Engine {
    /// Applies a registered interrupt. Claims it first, so it is applied
    /// at most once.
    pub fn apply_interrupt(&self, interrupt_id: Uuid) -> Result<(), EngineError> {
        let repository = self.interrupts.repository();
        let Some(interrupt) = repository.claim(interrupt_id) else {
            debug!("Interrupt '{}' already claimed", interrupt_id);
            return Ok(());
        };

        let outcome = self.dispatch_interrupt(&interrupt);
        let state = match outcome {
            Ok(true) => InterruptState::Processed,
            _ => InterruptState::Discarded,
        };
        repository.finish(interrupt_id, state);

        match outcome {
            Ok(true) => info!(
                "{} interrupt '{}' applied",
                interrupt.interrupt_type, interrupt_id
            ),
            Ok(false) => info!(
                "{} interrupt '{}' discarded, nothing to act on",
                interrupt.interrupt_type, interrupt_id
            ),
            Err(ref e) => warn!(
                "{} interrupt '{}' failed: {}",
                interrupt.interrupt_type, interrupt_id, e
            ),
        }
        outcome.map(|_| ())
    }

    /// Returns whether the interrupt took effect.
    fn dispatch_interrupt(&self, interrupt: &Interrupt) -> Result<bool, EngineError> {
        let effect = InterruptEffect {
            interrupt_id: interrupt.uuid,
            interrupt_type: interrupt.interrupt_type,
            issued_by: interrupt.issued_by.clone(),
            took_effect_at: Utc::now(),
        };

        let Some(node_execution_id) = interrupt.node_execution_id else {
            let plan_execution_id = interrupt.plan_execution_id.as_str();
            return match interrupt.interrupt_type {
                InterruptType::AbortAll => self.abort_plan(plan_execution_id, &effect),
                InterruptType::Pause => self.pause_plan(plan_execution_id),
                InterruptType::Resume => self.resume_plan(plan_execution_id),
                _ => Ok(false),
            };
        };

        let target = self.nodes.get(node_execution_id)?;
        if target.is_final() {
            debug!(
                "Node '{}' is already {}, {} has no effect",
                target.identifier, target.status, interrupt.interrupt_type
            );
            return Ok(false);
        }

        match interrupt.interrupt_type {
            InterruptType::Abort => self.abort_node(&target, &effect),
            InterruptType::AbortAll => self.abort_plan(&interrupt.plan_execution_id, &effect),
            InterruptType::Pause => self.pause_node(&target, &effect),
            InterruptType::Resume => self.resume_node(&target, &effect),
            InterruptType::Retry => self.retry_intervention(&target, &effect),
            InterruptType::Ignore => self.ignore_intervention(&target, &effect),
            InterruptType::MarkExpired => {
                self.expire_node(&target, &effect, expiry(&interrupt.config), false)
            }
            InterruptType::ExpireAll => {
                self.expire_node(&target, &effect, expiry(&interrupt.config), true)
            }
        }
    }

    /// Target goes DISCONTINUING, its active subtree ABORTED, then the
    /// target itself ABORTED.
    fn abort_node(
        &self,
        target: &NodeExecution,
        effect: &InterruptEffect,
    ) -> Result<bool, EngineError> {
        let discontinuing = self.nodes.transition(
            target.uuid,
            Status::Discontinuing,
            &|s| s.is_active() && s != Status::Discontinuing,
            &|ne| ne.interrupt_history.push(effect.clone()),
        )?;
        if discontinuing.is_none() {
            return Ok(false);
        }

        let aborted = self.terminate_descendants(target.uuid, Status::Aborted, None, Some(effect))?;
        debug!(
            "Aborted {} descendant(s) of node '{}'",
            aborted, target.identifier
        );

        match self.terminate(target.uuid, Status::Aborted, None, None)? {
            Some(node_execution) => {
                self.conclude(&node_execution)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn abort_plan(
        &self,
        plan_execution_id: &str,
        effect: &InterruptEffect,
    ) -> Result<bool, EngineError> {
        let plan_execution = self.plan_executions.get(plan_execution_id)?;
        if plan_execution.is_final() {
            return Ok(false);
        }
        self.plan_executions
            .update(plan_execution_id, &|pe| pe.discontinuing = true)?;
        let aborted = self.abort_active(plan_execution_id, Some(effect))?;
        info!(
            "Aborting plan execution '{}' ({} active node(s))",
            plan_execution_id, aborted
        );
        self.end_plan(plan_execution_id)?;
        Ok(true)
    }

    fn pause_plan(&self, plan_execution_id: &str) -> Result<bool, EngineError> {
        let paused = self.plan_executions.transition(
            plan_execution_id,
            Status::Paused,
            &|s| s == Status::Running,
            &|_| {},
        )?;
        if paused.is_some() {
            info!(
                "Plan execution '{}' paused, running nodes will finish",
                plan_execution_id
            );
        }
        Ok(paused.is_some())
    }

    fn resume_plan(&self, plan_execution_id: &str) -> Result<bool, EngineError> {
        let resumed = self.plan_executions.transition(
            plan_execution_id,
            Status::Running,
            &|s| s == Status::Paused,
            &|_| {},
        )?;
        if resumed.is_none() {
            return Ok(false);
        }

        let parked: Vec<Uuid> = self
            .nodes
            .find_by_plan_execution(plan_execution_id)
            .into_iter()
            .filter(|ne| ne.status == Status::Paused)
            .map(|ne| ne.uuid)
            .collect();
        for id in &parked {
            self.requeue(*id)?;
        }
        info!(
            "Plan execution '{}' resumed, {} parked node(s) requeued",
            plan_execution_id,
            parked.len()
        );
        Ok(true)
    }

    /// Only a QUEUED node can be parked. A node already running or waiting
    /// is left alone and the interrupt is discarded.
    fn pause_node(
        &self,
        target: &NodeExecution,
        effect: &InterruptEffect,
    ) -> Result<bool, EngineError> {
        let paused = self.nodes.transition(
            target.uuid,
            Status::Paused,
            &|s| s == Status::Queued,
            &|ne| ne.interrupt_history.push(effect.clone()),
        )?;
        Ok(paused.is_some())
    }

    fn resume_node(
        &self,
        target: &NodeExecution,
        effect: &InterruptEffect,
    ) -> Result<bool, EngineError> {
        if target.status != Status::Paused {
            return Ok(false);
        }
        self.nodes
            .update(target.uuid, &|ne| ne.interrupt_history.push(effect.clone()))?;
        self.requeue(target.uuid)
    }

    /// PAUSED -> QUEUED and a fresh start job.
    fn requeue(&self, node_execution_id: Uuid) -> Result<bool, EngineError> {
        let queued = self.nodes.transition(
            node_execution_id,
            Status::Queued,
            &|s| s == Status::Paused,
            &|_| {},
        )?;
        if queued.is_some() {
            self.jobs.send(EngineJob::StartNode { node_execution_id });
        }
        Ok(queued.is_some())
    }

    /// Settles an intervention-waiting node in its advised status and runs
    /// it again.
    fn retry_intervention(
        &self,
        target: &NodeExecution,
        effect: &InterruptEffect,
    ) -> Result<bool, EngineError> {
        if target.status != Status::InterventionWaiting {
            return Ok(false);
        }
        let advised = target
            .advised_status
            .filter(|s| s.is_final())
            .unwrap_or(Status::Failed);
        let settled = self.nodes.transition(
            target.uuid,
            advised,
            &|s| s == Status::InterventionWaiting,
            &|ne| ne.interrupt_history.push(effect.clone()),
        )?;
        let Some(settled) = settled else {
            return Ok(false);
        };
        self.after_settle(&settled);
        let retry_id = self.retry(&settled, std::time::Duration::ZERO)?;
        info!(
            "Node '{}' retried by operator as '{}'",
            settled.identifier, retry_id
        );
        Ok(true)
    }

    fn ignore_intervention(
        &self,
        target: &NodeExecution,
        effect: &InterruptEffect,
    ) -> Result<bool, EngineError> {
        let ignored = self.nodes.transition(
            target.uuid,
            Status::IgnoreFailed,
            &|s| s == Status::InterventionWaiting,
            &|ne| ne.interrupt_history.push(effect.clone()),
        )?;
        let Some(ignored) = ignored else {
            return Ok(false);
        };
        self.after_settle(&ignored);
        self.conclude(&ignored)?;
        Ok(true)
    }

    /// MARK_EXPIRED expires only the target; EXPIRE_ALL takes the active
    /// subtree with it.
    fn expire_node(
        &self,
        target: &NodeExecution,
        effect: &InterruptEffect,
        failure: FailureInfo,
        subtree: bool,
    ) -> Result<bool, EngineError> {
        if subtree {
            let expired =
                self.terminate_descendants(target.uuid, Status::Expired, Some(&failure), Some(effect))?;
            debug!(
                "Expired {} descendant(s) of node '{}'",
                expired, target.identifier
            );
        }

        let expired = self.nodes.transition(
            target.uuid,
            Status::Expired,
            &|s| s.is_active(),
            &|ne| {
                ne.failure_info = Some(failure.clone());
                ne.interrupt_history.push(effect.clone());
            },
        )?;
        let Some(expired) = expired else {
            return Ok(false);
        };
        warn!("Node '{}' expired: {}", expired.identifier, failure.message);
        self.after_settle(&expired);
        self.waiter.cancel_for(expired.uuid);
        self.conclude(&expired)?;
        Ok(true)
    }
}

fn expiry(config: &InterruptConfig) -> FailureInfo {
    match config {
        InterruptConfig::Expire {
            reason: Some(reason),
        } => FailureInfo::new(reason.clone(), FailureType::Timeout),
        _ => FailureInfo::new("Node execution expired", FailureType::Timeout),
    }
}
