//! Forcer trees and barrier evaluation.

use std::collections::HashMap;
use std::fmt;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::proctor::{Proctor, ProctorError, ProctorFailurePolicy};
use super::BarrierError;

/// State of one participant as reported by a proctor.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForcerState {
    /// Still running towards the barrier
    Approaching,
    /// Reached the barrier
    Arrived,
    /// Failed and will never arrive
    Abandoned,
    /// Not part of the topology being evaluated
    Absent,
}

/// Outcome of evaluating a barrier.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BarrierState {
    /// Keep waiting
    Standing,
    /// Every participant arrived; proceed
    Down,
    /// A participant was abandoned; proceed via the failure path
    Endure,
}

impl fmt::Display for BarrierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BarrierState::Standing => "STANDING",
            BarrierState::Down => "DOWN",
            BarrierState::Endure => "ENDURE",
        };
        f.write_str(name)
    }
}

/// One participant in a rendezvous: an id and its ordered sub-participants.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Forcer {
    pub id: String,
    #[serde(default)]
    pub children: Vec<Forcer>,
}

impl Forcer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<Forcer>) -> Self {
        self.children = children;
        self
    }
}

/// A barrier definition: created at fan-out time, read-only afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Barrier {
    pub id: String,
    pub forcer: Forcer,
    /// Passed to the proctor on every lookup
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl Barrier {
    pub fn new(id: impl Into<String>, forcer: Forcer) -> Self {
        Self {
            id: id.into(),
            forcer,
            context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Evaluates the barrier against the proctor's current view.
    ///
    /// The top forcer is queried first. ABSENT and ARRIVED answer without
    /// further lookups. For APPROACHING the direct children are queried in
    /// order, stopping at the first ABANDONED one.
    ///
    /// # Returns
    ///
    /// * `Ok(BarrierState)` - The evaluated state
    /// * `Err` - A lookup failed under [`ProctorFailurePolicy::Propagate`]
    pub fn push_down(
        &self,
        proctor: &dyn Proctor,
        policy: ProctorFailurePolicy,
    ) -> Result<BarrierState, BarrierError> {
        let top = self.query(proctor, &self.forcer.id, policy)?;

        let result = match top {
            ForcerState::Absent => BarrierState::Standing,
            ForcerState::Arrived => BarrierState::Down,
            ForcerState::Abandoned => BarrierState::Endure,
            ForcerState::Approaching => self.push_down_children(proctor, policy)?,
        };

        debug!("Barrier '{}' evaluated to {}", self.id, result);
        Ok(result)
    }

    fn push_down_children(
        &self,
        proctor: &dyn Proctor,
        policy: ProctorFailurePolicy,
    ) -> Result<BarrierState, BarrierError> {
        if self.forcer.children.is_empty() {
            return Ok(BarrierState::Standing);
        }

        let mut all_arrived = true;
        for child in &self.forcer.children {
            match self.query(proctor, &child.id, policy)? {
                ForcerState::Abandoned => return Ok(BarrierState::Endure),
                ForcerState::Arrived => {}
                ForcerState::Approaching | ForcerState::Absent => all_arrived = false,
            }
        }

        Ok(if all_arrived {
            BarrierState::Down
        } else {
            BarrierState::Standing
        })
    }

    fn query(
        &self,
        proctor: &dyn Proctor,
        forcer_id: &str,
        policy: ProctorFailurePolicy,
    ) -> Result<ForcerState, BarrierError> {
        match proctor.get_forcer_state(forcer_id, &self.context) {
            Ok(state) => Ok(state),
            Err(e) => self.on_lookup_failure(forcer_id, e, policy),
        }
    }

    fn on_lookup_failure(
        &self,
        forcer_id: &str,
        error: ProctorError,
        policy: ProctorFailurePolicy,
    ) -> Result<ForcerState, BarrierError> {
        match policy {
            ProctorFailurePolicy::FailClosed => {
                warn!(
                    "Barrier '{}': lookup of '{}' failed ({}), treating as approaching",
                    self.id, forcer_id, error
                );
                Ok(ForcerState::Approaching)
            }
            ProctorFailurePolicy::TreatAsAbandoned => {
                warn!(
                    "Barrier '{}': lookup of '{}' failed ({}), treating as abandoned",
                    self.id, forcer_id, error
                );
                Ok(ForcerState::Abandoned)
            }
            ProctorFailurePolicy::Propagate => Err(BarrierError::Proctor {
                barrier_id: self.id.clone(),
                source: error,
            }),
        }
    }
}
