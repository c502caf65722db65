//! Notify Registry
//!
//! Tracks waits keyed by correlation id. A wait may span several ids and
//! completes when all of them have been notified (join-when-all).
//!
//! Delivery is assumed at-least-once and unordered:
//!
//! - a notification that arrives before its wait is registered is stashed
//!   and consumed on registration
//! - a repeated notification for an already consumed id is dropped
//! - a notification for an id whose wait was cancelled is dropped
//!
//! Consumed ids and stashed notifications are kept until [`Waiter::prune`]
//! removes those older than the retention it is given.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use log::{debug, trace, warn};
use serde_json::Value;
use tokio::runtime::Handle;
use uuid::Uuid;

use super::executor::{EngineJob, JobSender};
use super::{ErrorResponse, NotifyCallback, ResponseMap};

type Notification = Result<Value, ErrorResponse>;

struct Wait {
    callback: NotifyCallback,
    pending: HashSet<String>,
    responses: ResponseMap,
    error: Option<ErrorResponse>,
}

struct WaiterInner {
    waits: DashMap<Uuid, Wait>,
    by_correlation: DashMap<String, Uuid>,
    early: DashMap<String, (Notification, DateTime<Utc>)>,
    consumed: DashMap<String, DateTime<Utc>>,
    jobs: JobSender,
    handle: Handle,
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Waiter {
    inner: Arc<WaiterInner>,
}

impl Waiter {
    pub fn new(jobs: JobSender, handle: Handle) -> Self {
        Self {
            inner: Arc::new(WaiterInner {
                waits: DashMap::new(),
                by_correlation: DashMap::new(),
                early: DashMap::new(),
                consumed: DashMap::new(),
                jobs,
                handle,
            }),
        }
    }

    /// Registers `callback` to fire once every id in `correlation_ids` is notified.
    ///
    /// An empty id list fires immediately.
    pub fn wait_for_all(&self, callback: NotifyCallback, correlation_ids: Vec<String>) -> Uuid {
        let wait_id = Uuid::new_v4();
        if correlation_ids.is_empty() {
            self.dispatch(callback, ResponseMap::new(), None);
            return wait_id;
        }

        debug!(
            "Waiting on {} correlation id(s) for {:?}",
            correlation_ids.len(),
            callback
        );

        self.inner.waits.insert(
            wait_id,
            Wait {
                callback,
                pending: correlation_ids.iter().cloned().collect(),
                responses: ResponseMap::new(),
                error: None,
            },
        );

        for correlation_id in correlation_ids {
            if let Some(previous) = self
                .inner
                .by_correlation
                .insert(correlation_id.clone(), wait_id)
            {
                warn!(
                    "Correlation id '{}' re-registered, replacing wait '{}'",
                    correlation_id, previous
                );
            }
            self.inner.consumed.remove(&correlation_id);
            if let Some((_, (early, _))) = self.inner.early.remove(&correlation_id) {
                trace!("Consuming early notification for '{}'", correlation_id);
                self.apply(wait_id, &correlation_id, early);
            }
        }
        wait_id
    }

    /// Single entry point for every completion.
    pub fn notify(&self, correlation_id: &str, result: Result<Value, ErrorResponse>) {
        if self.inner.consumed.contains_key(correlation_id) {
            debug!("Dropping duplicate notification for '{}'", correlation_id);
            return;
        }

        if let Some(wait_id) = self.wait_for(correlation_id) {
            self.apply(wait_id, correlation_id, result);
            return;
        }

        // No wait yet: stash, then re-check in case one registered meanwhile.
        self.inner
            .early
            .insert(correlation_id.to_string(), (result, Utc::now()));
        if let Some(wait_id) = self.wait_for(correlation_id) {
            if let Some((_, (stashed, _))) = self.inner.early.remove(correlation_id) {
                self.apply(wait_id, correlation_id, stashed);
            }
        } else {
            trace!("Stashed early notification for '{}'", correlation_id);
        }
    }

    pub fn notify_success(&self, correlation_id: &str, response: Value) {
        self.notify(correlation_id, Ok(response));
    }

    pub fn notify_error(&self, correlation_id: &str, error: ErrorResponse) {
        self.notify(correlation_id, Err(error));
    }

    /// Fires `callback` after `delay` using a private correlation id.
    pub fn schedule(&self, delay: Duration, callback: NotifyCallback) -> String {
        let correlation_id = format!("timer-{}", Uuid::new_v4());
        self.wait_for_all(callback, vec![correlation_id.clone()]);
        self.notify_after(delay, correlation_id.clone(), Value::Null);
        correlation_id
    }

    /// Notifies `correlation_id` with `response` once `delay` has passed.
    pub fn notify_after(&self, delay: Duration, correlation_id: String, response: Value) {
        let waiter = self.clone();
        self.inner.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            waiter.notify(&correlation_id, Ok(response));
        });
    }

    /// Drops every wait whose callback targets `node_execution_id`. Its
    /// pending ids count as consumed, so late notifications are dropped.
    pub fn cancel_for(&self, node_execution_id: Uuid) -> usize {
        let wait_ids: Vec<Uuid> = self
            .inner
            .waits
            .iter()
            .filter(|w| w.callback.node_execution_id() == Some(node_execution_id))
            .map(|w| *w.key())
            .collect();

        for wait_id in &wait_ids {
            if let Some((_, wait)) = self.inner.waits.remove(wait_id) {
                let now = Utc::now();
                for correlation_id in wait.pending {
                    self.inner.by_correlation.remove(&correlation_id);
                    self.inner.consumed.insert(correlation_id, now);
                }
            }
        }
        if !wait_ids.is_empty() {
            debug!(
                "Cancelled {} wait(s) for node execution '{}'",
                wait_ids.len(),
                node_execution_id
            );
        }
        wait_ids.len()
    }

    pub fn pending_waits(&self) -> usize {
        self.inner.waits.len()
    }

    /// Notifications stashed without a wait.
    pub fn stashed_notifications(&self) -> usize {
        self.inner.early.len()
    }

    /// Ids remembered as consumed or cancelled.
    pub fn settled_ids(&self) -> usize {
        self.inner.consumed.len()
    }

    /// Forgets consumed ids and stashed notifications older than
    /// `retention`. Returns how many entries were removed.
    pub fn prune(&self, retention: ChronoDuration) -> usize {
        let cutoff = Utc::now() - retention;
        let before = self.inner.consumed.len() + self.inner.early.len();
        self.inner.consumed.retain(|_, at| *at > cutoff);
        self.inner.early.retain(|_, (_, at)| *at > cutoff);
        let pruned = before.saturating_sub(self.inner.consumed.len() + self.inner.early.len());
        if pruned > 0 {
            debug!("Pruned {} settled correlation id(s)", pruned);
        }
        pruned
    }

    fn wait_for(&self, correlation_id: &str) -> Option<Uuid> {
        self.inner.by_correlation.get(correlation_id).map(|w| *w.value())
    }

    fn apply(&self, wait_id: Uuid, correlation_id: &str, result: Notification) {
        let complete = {
            let Some(mut wait) = self.inner.waits.get_mut(&wait_id) else {
                debug!("Wait for '{}' already completed", correlation_id);
                return;
            };
            if !wait.pending.remove(correlation_id) {
                debug!("Dropping duplicate notification for '{}'", correlation_id);
                return;
            }
            match result {
                Ok(value) => {
                    wait.responses.insert(correlation_id.to_string(), value);
                }
                Err(error) => {
                    if wait.error.is_none() {
                        wait.error = Some(error);
                    }
                }
            }
            wait.pending.is_empty()
        };

        self.inner.by_correlation.remove(correlation_id);
        self.inner
            .consumed
            .insert(correlation_id.to_string(), Utc::now());

        if complete {
            if let Some((_, wait)) = self.inner.waits.remove(&wait_id) {
                self.dispatch(wait.callback, wait.responses, wait.error);
            }
        }
    }

    fn dispatch(
        &self,
        callback: NotifyCallback,
        responses: ResponseMap,
        error: Option<ErrorResponse>,
    ) {
        let job = match callback {
            NotifyCallback::Resume { node_execution_id } => EngineJob::Resume {
                node_execution_id,
                responses,
                async_error: error,
            },
            NotifyCallback::StartNode { node_execution_id } => match error {
                Some(error) => EngineJob::Fail {
                    node_execution_id,
                    error,
                },
                None => EngineJob::StartNode { node_execution_id },
            },
            NotifyCallback::RegisterInterrupt { interrupt } => {
                if let Some(error) = error {
                    warn!(
                        "Wait before {} interrupt failed ({}), registering anyway",
                        interrupt.interrupt_type, error.message
                    );
                }
                EngineJob::RegisterInterrupt(interrupt)
            }
        };
        self.inner.jobs.send(job);
    }
}
