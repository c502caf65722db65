//! Node Status State Machine
//!
//! ```text
//! QUEUED -> RUNNING -> WAITING(mode) -> RUNNING -> final
//!    |                                    |
//!  PAUSED                        INTERVENTION_WAITING -> final
//! ```
//!
//! Final statuses never change again. Every transition is checked with
//! [`Status::can_transition_to`] inside the repository's conditional update.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a node's work is carried out, as chosen by its facilitator.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Run inline, result available immediately
    Sync,
    /// Step dispatched its own work; wait for its callback ids
    Async,
    /// Engine dispatched a task descriptor through the task dispatcher
    Task,
    /// Delegate to exactly one child node
    Child,
    /// Fan out to several child nodes, join when all report
    Children,
}

impl ExecutionMode {
    /// True for every mode that parks the node in WAITING.
    pub fn suspends(self) -> bool {
        !matches!(self, ExecutionMode::Sync)
    }

    /// True when the node waits on child node executions.
    pub fn spawns_children(self) -> bool {
        matches!(self, ExecutionMode::Child | ExecutionMode::Children)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionMode::Sync => "SYNC",
            ExecutionMode::Async => "ASYNC",
            ExecutionMode::Task => "TASK",
            ExecutionMode::Child => "CHILD",
            ExecutionMode::Children => "CHILDREN",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    /// Suspended until a notification arrives; never carries `Sync`
    Waiting(ExecutionMode),
    Paused,
    InterventionWaiting,
    Discontinuing,
    Succeeded,
    Failed,
    Errored,
    Expired,
    Aborted,
    Skipped,
    IgnoreFailed,
}

impl Status {
    /// The waiting status for a suspending mode; `None` for `Sync`.
    pub fn waiting_for(mode: ExecutionMode) -> Option<Status> {
        mode.suspends().then_some(Status::Waiting(mode))
    }

    pub fn is_final(self) -> bool {
        matches!(
            self,
            Status::Succeeded
                | Status::Failed
                | Status::Errored
                | Status::Expired
                | Status::Aborted
                | Status::Skipped
                | Status::IgnoreFailed
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_final()
    }

    /// Final statuses that let the graph advance as if successful.
    pub fn is_positive(self) -> bool {
        matches!(self, Status::Succeeded | Status::Skipped | Status::IgnoreFailed)
    }

    /// Final statuses that represent a failed node.
    pub fn is_broke(self) -> bool {
        matches!(self, Status::Failed | Status::Errored | Status::Expired)
    }

    pub fn is_waiting(self) -> bool {
        matches!(self, Status::Waiting(_))
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: Status) -> bool {
        if self.is_final() || self == next {
            return false;
        }
        match self {
            Status::Queued => matches!(
                next,
                Status::Running | Status::Paused | Status::Skipped | Status::Discontinuing
            ) || next.is_broke()
                || next == Status::Aborted,
            Status::Paused => matches!(
                next,
                Status::Queued | Status::Running | Status::Discontinuing | Status::Aborted
            ) || next.is_broke(),
            Status::Running => next != Status::Queued && next != Status::Paused,
            Status::Waiting(_) => matches!(
                next,
                Status::Running | Status::Discontinuing | Status::Aborted
            ) || next.is_broke(),
            Status::InterventionWaiting => next.is_final() || next == Status::Discontinuing,
            Status::Discontinuing => matches!(next, Status::Aborted | Status::Expired),
            _ => false,
        }
    }

    /// Worst-wins aggregation used to summarise a set of child statuses.
    pub fn aggregate<I: IntoIterator<Item = Status>>(statuses: I) -> Status {
        statuses
            .into_iter()
            .max_by_key(|s| s.severity())
            .unwrap_or(Status::Succeeded)
    }

    fn severity(self) -> u8 {
        match self {
            Status::Skipped => 0,
            Status::Succeeded => 1,
            Status::IgnoreFailed => 2,
            Status::Expired => 4,
            Status::Failed => 5,
            Status::Errored => 6,
            Status::Aborted => 7,
            _ => 3,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Queued => f.write_str("QUEUED"),
            Status::Running => f.write_str("RUNNING"),
            Status::Waiting(mode) => write!(f, "WAITING({})", mode),
            Status::Paused => f.write_str("PAUSED"),
            Status::InterventionWaiting => f.write_str("INTERVENTION_WAITING"),
            Status::Discontinuing => f.write_str("DISCONTINUING"),
            Status::Succeeded => f.write_str("SUCCEEDED"),
            Status::Failed => f.write_str("FAILED"),
            Status::Errored => f.write_str("ERRORED"),
            Status::Expired => f.write_str("EXPIRED"),
            Status::Aborted => f.write_str("ABORTED"),
            Status::Skipped => f.write_str("SKIPPED"),
            Status::IgnoreFailed => f.write_str("IGNORE_FAILED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FINAL: [Status; 7] = [
        Status::Succeeded,
        Status::Failed,
        Status::Errored,
        Status::Expired,
        Status::Aborted,
        Status::Skipped,
        Status::IgnoreFailed,
    ];

    #[test]
    fn test_final_statuses_never_transition() {
        for from in FINAL {
            for to in [Status::Running, Status::Queued, Status::Aborted, Status::Expired] {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        assert!(Status::Queued.can_transition_to(Status::Running));
        assert!(Status::Running.can_transition_to(Status::Waiting(ExecutionMode::Task)));
        assert!(Status::Waiting(ExecutionMode::Task).can_transition_to(Status::Running));
        assert!(Status::Running.can_transition_to(Status::Succeeded));
        assert!(Status::Running.can_transition_to(Status::InterventionWaiting));
    }

    #[test]
    fn test_waiting_cannot_finish_without_resume() {
        let waiting = Status::Waiting(ExecutionMode::Async);
        assert!(!waiting.can_transition_to(Status::Succeeded));
        assert!(waiting.can_transition_to(Status::Expired));
        assert!(waiting.can_transition_to(Status::Discontinuing));
    }

    #[test]
    fn test_waiting_for_sync_is_none() {
        assert_eq!(Status::waiting_for(ExecutionMode::Sync), None);
        assert_eq!(
            Status::waiting_for(ExecutionMode::Children),
            Some(Status::Waiting(ExecutionMode::Children))
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(Status::IgnoreFailed.is_positive());
        assert!(Status::Expired.is_broke());
        assert!(!Status::Aborted.is_broke());
        assert!(Status::Discontinuing.is_active());
        assert!(Status::InterventionWaiting.is_active());
    }

    #[test]
    fn test_aggregate_worst_wins() {
        assert_eq!(
            Status::aggregate([Status::Succeeded, Status::Failed, Status::Skipped]),
            Status::Failed
        );
        assert_eq!(Status::aggregate([Status::Succeeded, Status::IgnoreFailed]), Status::IgnoreFailed);
        assert_eq!(Status::aggregate(Vec::new()), Status::Succeeded);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&Status::Waiting(ExecutionMode::Child)).unwrap();
        assert_eq!(json, r#"{"WAITING":"CHILD"}"#);
        let back: Status = serde_json::from_str(r#""INTERVENTION_WAITING""#).unwrap();
        assert_eq!(back, Status::InterventionWaiting);
        assert_eq!(Status::Waiting(ExecutionMode::Task).to_string(), "WAITING(TASK)");
    }
}
