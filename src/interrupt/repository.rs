//! Registered interrupt storage.
//!
//! Application claims an interrupt with a REGISTERED -> PROCESSING swap, so a
//! redelivered apply job for the same interrupt does nothing.

use dashmap::DashMap;
use uuid::Uuid;

use crate::execution::RepositoryError;

use super::model::{Interrupt, InterruptState};

pub trait InterruptRepository: Send + Sync {
    fn save(&self, interrupt: Interrupt) -> Result<(), RepositoryError>;

    fn get(&self, id: Uuid) -> Option<Interrupt>;

    /// Moves a REGISTERED interrupt to PROCESSING; `None` if it was not
    /// registered anymore.
    fn claim(&self, id: Uuid) -> Option<Interrupt>;

    fn finish(&self, id: Uuid, state: InterruptState);

    fn find_by_plan_execution(&self, plan_execution_id: &str) -> Vec<Interrupt>;
}

#[derive(Default)]
pub struct InMemoryInterruptRepository {
    interrupts: DashMap<Uuid, Interrupt>,
}

impl InMemoryInterruptRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InterruptRepository for InMemoryInterruptRepository {
    fn save(&self, interrupt: Interrupt) -> Result<(), RepositoryError> {
        self.interrupts.insert(interrupt.uuid, interrupt);
        Ok(())
    }

    fn get(&self, id: Uuid) -> Option<Interrupt> {
        self.interrupts.get(&id).map(|i| i.value().clone())
    }

    fn claim(&self, id: Uuid) -> Option<Interrupt> {
        let mut interrupt = self.interrupts.get_mut(&id)?;
        if interrupt.state != InterruptState::Registered {
            return None;
        }
        interrupt.state = InterruptState::Processing;
        Some(interrupt.value().clone())
    }

    fn finish(&self, id: Uuid, state: InterruptState) {
        if let Some(mut interrupt) = self.interrupts.get_mut(&id) {
            interrupt.state = state;
        }
    }

    fn find_by_plan_execution(&self, plan_execution_id: &str) -> Vec<Interrupt> {
        let mut found: Vec<Interrupt> = self
            .interrupts
            .iter()
            .filter(|i| i.plan_execution_id == plan_execution_id)
            .map(|i| i.value().clone())
            .collect();
        found.sort_by_key(|i| i.created_at);
        found
    }
}
