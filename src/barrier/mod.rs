//! Barrier Module
//!
//! A rendezvous point for parallel branches. A [`Barrier`] binds an id to a
//! [`Forcer`] tree; evaluating it asks a [`Proctor`] for the state of each
//! participant and yields one of three answers:
//!
//! - `STANDING`: keep waiting
//! - `DOWN`: everyone arrived
//! - `ENDURE`: someone was abandoned, proceed via compensation
//!
//! Evaluation never blocks and never mutates the barrier definition.

pub mod forcer;
pub mod proctor;

use thiserror::Error;

pub use forcer::{Barrier, BarrierState, Forcer, ForcerState};
pub use proctor::{
    ExecutionProctor, Proctor, ProctorError, ProctorFailurePolicy, PLAN_EXECUTION_ID_KEY,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BarrierError {
    #[error("Barrier '{barrier_id}' could not be evaluated: {source}")]
    Proctor {
        barrier_id: String,
        source: ProctorError,
    },
}
