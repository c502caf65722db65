//! Plan execution record: one per run of a plan.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::Status;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlanExecution {
    pub uuid: String,
    pub plan_id: String,
    pub status: Status,
    pub start_ts: DateTime<Utc>,
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub setup_abstractions: HashMap<String, String>,
    /// Set while a rollback is unwinding an aborted scope
    #[serde(default)]
    pub discontinuing: bool,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl PlanExecution {
    pub fn new(
        uuid: impl Into<String>,
        plan_id: impl Into<String>,
        setup_abstractions: HashMap<String, String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            plan_id: plan_id.into(),
            status: Status::Running,
            start_ts: Utc::now(),
            end_ts: None,
            setup_abstractions,
            discontinuing: false,
            valid_until: None,
            version: 0,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.status == Status::Paused
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }
}
