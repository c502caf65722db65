//! Orchestration Engine
//!
//! The driver that ties plans, node executions, facilitators, advisers,
//! interrupts and the waiter together.
//!
//! # Architecture
//!
//! The engine core is synchronous and shared as `Arc<Engine>`. Everything
//! that starts or resumes a node arrives as an [`EngineJob`] on one channel
//! and is run by the [`ResumeExecutor`](crate::waiter::spawn_executor) on
//! tokio's blocking pool:
//!
//! ```text
//! start_plan ─┐                      ┌─► start_node ─► invoke ─► SYNC: handle_step_response
//! notify ─────┼─► EngineJob channel ─┤                          └► ASYNC/TASK/CHILD(REN): WAITING
//! timeouts ───┤                      ├─► resume ─► handle_step_response ─► advisers
//! interrupts ─┘                      └─► apply_interrupt
//! ```
//!
//! No engine call ever blocks on remote work. A node that suspends is
//! persisted as WAITING and the call returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use uuid::Uuid;

use crate::adviser::AdviserRegistry;
use crate::barrier::{Barrier, BarrierError, BarrierState, ExecutionProctor};
use crate::config::EngineConfig;
use crate::facilitator::{FacilitatorRegistry, FacilitatorResponse};
use crate::interrupt::{
    InMemoryInterruptRepository, Interrupt, InterruptError, InterruptManager,
    InterruptRepository, TimeoutTracker,
};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::plan::loader::check_references;
use crate::plan::{
    Ambiance, AmbianceError, InMemoryPlanRepository, Level, Plan, PlanError, PlanNode,
    PlanRepository, SkipType,
};
use crate::steps;
use crate::waiter::{
    job_channel, EngineJob, ErrorResponse, JobSender, NotifyCallback, ResponseMap, Waiter,
};

use super::condition::{ConditionEvaluator, LiteralConditionEvaluator};
use super::node::{ChildReference, ExecutableResponse, FailureInfo, FailureType, NodeExecution};
use super::plan_execution::PlanExecution;
use super::repository::{
    InMemoryNodeExecutionRepository, InMemoryPlanExecutionRepository, NodeExecutionRepository,
    PlanExecutionRepository, RepositoryError,
};
use super::status::{ExecutionMode, Status};
use super::step::{
    ResumePackage, Step, StepContext, StepError, StepRegistry, StepResponse, TaskDispatcher,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Ambiance(#[from] AmbianceError),

    #[error(transparent)]
    Interrupt(#[from] InterruptError),

    #[error(transparent)]
    Barrier(#[from] BarrierError),

    #[error("Snapshot failed: {0}")]
    Snapshot(String),

    #[error("Engine must be built inside a tokio runtime: {0}")]
    NoRuntime(String),

    #[error("Executor is already running for this engine")]
    ExecutorAlreadyRunning,

    #[error("Plan execution '{0}' is not tracked by this engine")]
    UntrackedPlanExecution(String),
}

/// Builds an [`Engine`] with immutable registries.
///
/// # Example
///
/// ```rust,no_run
/// use pipewright::execution::EngineBuilder;
/// use pipewright::EngineConfig;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = EngineBuilder::new(EngineConfig::default()).build()?;
/// let executor = pipewright::waiter::spawn_executor(engine.clone())?;
/// # executor.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    plans: Arc<dyn PlanRepository>,
    nodes: Arc<dyn NodeExecutionRepository>,
    plan_executions: Arc<dyn PlanExecutionRepository>,
    interrupts: Arc<dyn InterruptRepository>,
    steps: StepRegistry,
    facilitators: FacilitatorRegistry,
    advisers: AdviserRegistry,
    conditions: Arc<dyn ConditionEvaluator>,
    task_dispatcher: Option<Arc<dyn TaskDispatcher>>,
}

impl EngineBuilder {
    /// Starts from in-memory repositories and every built-in kind.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            plans: Arc::new(InMemoryPlanRepository::new()),
            nodes: Arc::new(InMemoryNodeExecutionRepository::new()),
            plan_executions: Arc::new(InMemoryPlanExecutionRepository::new()),
            interrupts: Arc::new(InMemoryInterruptRepository::new()),
            steps: steps::builtin_registry(),
            facilitators: FacilitatorRegistry::builtin(),
            advisers: AdviserRegistry::builtin(),
            conditions: Arc::new(LiteralConditionEvaluator),
            task_dispatcher: None,
        }
    }

    pub fn plan_repository(mut self, plans: Arc<dyn PlanRepository>) -> Self {
        self.plans = plans;
        self
    }

    pub fn node_repository(mut self, nodes: Arc<dyn NodeExecutionRepository>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn plan_execution_repository(
        mut self,
        plan_executions: Arc<dyn PlanExecutionRepository>,
    ) -> Self {
        self.plan_executions = plan_executions;
        self
    }

    pub fn interrupt_repository(mut self, interrupts: Arc<dyn InterruptRepository>) -> Self {
        self.interrupts = interrupts;
        self
    }

    pub fn step(mut self, kind: impl Into<String>, step: Arc<dyn Step>) -> Self {
        self.steps = self.steps.with(kind, step);
        self
    }

    pub fn facilitator(
        mut self,
        facilitator_type: impl Into<String>,
        facilitator: Arc<dyn crate::facilitator::Facilitator>,
    ) -> Self {
        self.facilitators = self.facilitators.with(facilitator_type, facilitator);
        self
    }

    pub fn adviser(
        mut self,
        adviser_type: impl Into<String>,
        adviser: Arc<dyn crate::adviser::Adviser>,
    ) -> Self {
        self.advisers = self.advisers.with(adviser_type, adviser);
        self
    }

    pub fn condition_evaluator(mut self, conditions: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn task_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.task_dispatcher = Some(dispatcher);
        self
    }

    /// Builds the engine. Must run inside a tokio runtime.
    pub fn build(self) -> Result<Arc<Engine>, EngineError> {
        let handle = Handle::try_current().map_err(|e| EngineError::NoRuntime(e.to_string()))?;
        let (jobs, receiver) = job_channel();

        let waiter = Waiter::new(jobs.clone(), handle.clone());
        let timeouts = TimeoutTracker::new(jobs.clone(), handle);
        let interrupts = InterruptManager::new(
            self.interrupts,
            Arc::clone(&self.nodes),
            Arc::clone(&self.plan_executions),
            jobs.clone(),
        );

        debug!("Engine built with step kinds {:?}", self.steps.kinds());

        Ok(Arc::new(Engine {
            config: self.config,
            plans: self.plans,
            nodes: self.nodes,
            plan_executions: self.plan_executions,
            steps: self.steps,
            facilitators: self.facilitators,
            advisers: self.advisers,
            conditions: self.conditions,
            task_dispatcher: self.task_dispatcher,
            interrupts,
            timeouts,
            waiter,
            jobs,
            job_receiver: Mutex::new(Some(receiver)),
            completions: DashMap::new(),
            timelines: DashMap::new(),
        }))
    }
}

pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) plans: Arc<dyn PlanRepository>,
    pub(crate) nodes: Arc<dyn NodeExecutionRepository>,
    pub(crate) plan_executions: Arc<dyn PlanExecutionRepository>,
    pub(crate) steps: StepRegistry,
    pub(crate) facilitators: FacilitatorRegistry,
    pub(crate) advisers: AdviserRegistry,
    pub(crate) conditions: Arc<dyn ConditionEvaluator>,
    pub(crate) task_dispatcher: Option<Arc<dyn TaskDispatcher>>,
    pub(crate) interrupts: InterruptManager,
    pub(crate) timeouts: TimeoutTracker,
    pub(crate) waiter: Waiter,
    pub(crate) jobs: JobSender,
    job_receiver: Mutex<Option<UnboundedReceiver<EngineJob>>>,
    pub(crate) completions: DashMap<String, watch::Sender<Status>>,
    pub(crate) timelines: DashMap<String, ExecutionTimeline>,
}

impl Engine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn plans(&self) -> &Arc<dyn PlanRepository> {
        &self.plans
    }

    pub fn node_executions(&self) -> &Arc<dyn NodeExecutionRepository> {
        &self.nodes
    }

    pub fn plan_executions(&self) -> &Arc<dyn PlanExecutionRepository> {
        &self.plan_executions
    }

    pub fn waiter(&self) -> &Waiter {
        &self.waiter
    }

    pub fn interrupts(&self) -> &InterruptManager {
        &self.interrupts
    }

    pub(crate) fn take_job_receiver(&self) -> Option<UnboundedReceiver<EngineJob>> {
        self.job_receiver.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Registers a plan so it can be started.
    ///
    /// Plans whose start, child, next or rollback references do not resolve
    /// are rejected.
    pub fn register_plan(&self, plan: Plan) -> Result<(), EngineError> {
        check_references(&plan)?;
        self.plans.save(plan)?;
        Ok(())
    }

    /// Starts a new execution of `plan_id` and returns its id.
    ///
    /// Only the start node is queued here; the executor runs it.
    pub fn start_plan(
        &self,
        plan_id: &str,
        setup_abstractions: HashMap<String, String>,
    ) -> Result<String, EngineError> {
        let plan = self.plans.get_plan(plan_id)?;
        let start = self.plans.get_node(plan_id, &plan.start_node_id)?;

        let plan_execution_id = Uuid::new_v4().to_string();
        self.plan_executions.save(PlanExecution::new(
            plan_execution_id.clone(),
            plan_id,
            setup_abstractions.clone(),
        ))?;
        self.track(&plan_execution_id, Status::Running);

        info!(
            "Starting plan '{}' as execution '{}'",
            plan_id, plan_execution_id
        );

        let ambiance =
            Ambiance::new(&plan_execution_id, plan_id).with_setup_abstractions(setup_abstractions);
        self.trigger_node(&ambiance, &start, None, None, None, None)?;
        Ok(plan_execution_id)
    }

    pub(crate) fn track(&self, plan_execution_id: &str, status: Status) {
        let (tx, _) = watch::channel(status);
        self.completions.insert(plan_execution_id.to_string(), tx);
        self.timelines
            .entry(plan_execution_id.to_string())
            .or_default();
    }

    /// Waits until a plan execution reaches a final status.
    pub async fn wait_for_plan(&self, plan_execution_id: &str) -> Result<Status, EngineError> {
        let receiver = self
            .completions
            .get(plan_execution_id)
            .map(|tx| tx.subscribe());

        let Some(mut receiver) = receiver else {
            let plan_execution = self.plan_executions.get(plan_execution_id)?;
            if plan_execution.is_final() {
                return Ok(plan_execution.status);
            }
            return Err(EngineError::UntrackedPlanExecution(
                plan_execution_id.to_string(),
            ));
        };

        let status = *receiver
            .wait_for(|s| s.is_final())
            .await
            .map_err(|_| EngineError::UntrackedPlanExecution(plan_execution_id.to_string()))?;
        Ok(status)
    }

    /// Creates a QUEUED node execution below `parent_ambiance` and queues its start.
    ///
    /// # Arguments
    ///
    /// * `preassigned_id` - Id already handed out as a correlation id
    /// * `notify_id` - Correlation id to report under; defaults to the new id
    pub(crate) fn trigger_node(
        &self,
        parent_ambiance: &Ambiance,
        node: &PlanNode,
        parent_id: Option<Uuid>,
        previous_id: Option<Uuid>,
        preassigned_id: Option<Uuid>,
        notify_id: Option<Uuid>,
    ) -> Result<Uuid, EngineError> {
        let id = preassigned_id.unwrap_or_else(Uuid::new_v4);
        let ambiance = parent_ambiance.clone_for_child(Level::for_node(node, id.to_string(), 0));

        let mut node_execution = NodeExecution::new(id, ambiance, node)
            .with_parent(parent_id)
            .with_previous(previous_id);
        if let Some(notify_id) = notify_id {
            node_execution.notify_id = notify_id;
        }
        self.nodes.save(node_execution)?;

        if let Some(previous_id) = previous_id {
            self.nodes.update(previous_id, &|prev| prev.next_id = Some(id))?;
        }

        debug!("Queued node '{}' as '{}'", node.identifier, id);
        self.jobs.send(EngineJob::StartNode {
            node_execution_id: id,
        });
        Ok(id)
    }

    /// Runs a queued node: skip check, lookups, facilitation, invocation.
    pub fn start_node(&self, node_execution_id: Uuid) -> Result<(), EngineError> {
        let node_execution = self.nodes.get(node_execution_id)?;
        if node_execution.status != Status::Queued {
            debug!(
                "Node '{}' is {}, not starting",
                node_execution.identifier, node_execution.status
            );
            return Ok(());
        }

        let plan_execution = self
            .plan_executions
            .get(node_execution.plan_execution_id())?;
        if plan_execution.is_final()
            || (plan_execution.discontinuing && node_execution.parent_id.is_some())
        {
            info!(
                "Plan execution '{}' is ending, aborting queued node '{}'",
                plan_execution.uuid, node_execution.identifier
            );
            let aborted = self.nodes.transition(
                node_execution_id,
                Status::Aborted,
                &|s| s == Status::Queued,
                &|_| {},
            )?;
            if let Some(aborted) = aborted {
                self.after_settle(&aborted);
            }
            return Ok(());
        }
        if plan_execution.is_paused() {
            info!(
                "Plan execution '{}' is paused, parking node '{}'",
                plan_execution.uuid, node_execution.identifier
            );
            self.nodes.transition(
                node_execution_id,
                Status::Paused,
                &|s| s == Status::Queued,
                &|_| {},
            )?;
            return Ok(());
        }

        let node = self
            .plans
            .get_node(node_execution.ambiance.plan_id(), &node_execution.node_id)?;

        if let Some(condition) = node.skip_condition.as_deref() {
            if node.skip_type == SkipType::SkipNode {
                match self.conditions.evaluate(&node_execution.ambiance, condition) {
                    Ok(true) => return self.skip_node(&node_execution),
                    Ok(false) => {}
                    Err(reason) => {
                        return self.fail_configuration(&node_execution, reason);
                    }
                }
            }
        }

        let Some(step) = self.steps.get(&node.step_type.kind) else {
            return self.fail_configuration(
                &node_execution,
                format!("Unknown step type '{}'", node.step_type.kind),
            );
        };

        if let Some(unknown) = node
            .advisers
            .iter()
            .find(|a| !self.advisers.contains(&a.adviser_type))
        {
            return self.fail_configuration(
                &node_execution,
                format!("Unknown adviser type '{}'", unknown.adviser_type),
            );
        }

        let mode = match node_execution.mode {
            Some(mode) => mode,
            None => match self.facilitate(&node_execution.ambiance, &node) {
                Ok(FacilitatorResponse {
                    mode,
                    initial_wait: Some(wait),
                }) => {
                    self.nodes
                        .update(node_execution_id, &|ne| ne.mode = Some(mode))?;
                    info!(
                        "Node '{}' starts in {}s ({})",
                        node.identifier,
                        wait.as_secs(),
                        mode
                    );
                    self.waiter.schedule(
                        wait,
                        NotifyCallback::StartNode { node_execution_id },
                    );
                    return Ok(());
                }
                Ok(response) => response.mode,
                Err(reason) => return self.fail_configuration(&node_execution, reason),
            },
        };

        self.invoke(node_execution_id, &node, step.as_ref(), mode)
    }

    /// First facilitator obtainment that answers wins.
    fn facilitate(
        &self,
        ambiance: &Ambiance,
        node: &PlanNode,
    ) -> Result<FacilitatorResponse, String> {
        for obtainment in &node.facilitators {
            let facilitator = self
                .facilitators
                .get(&obtainment.facilitator_type)
                .ok_or_else(|| {
                    format!("Unknown facilitator type '{}'", obtainment.facilitator_type)
                })?;
            if let Some(response) = facilitator
                .facilitate(ambiance, &obtainment.parameters)
                .map_err(|e| e.to_string())?
            {
                return Ok(response);
            }
        }
        Err(format!(
            "No facilitator accepted node '{}'",
            node.identifier
        ))
    }

    fn invoke(
        &self,
        node_execution_id: Uuid,
        node: &PlanNode,
        step: &dyn Step,
        mode: ExecutionMode,
    ) -> Result<(), EngineError> {
        let started = self.nodes.transition(
            node_execution_id,
            Status::Running,
            &|s| s == Status::Queued,
            &|ne| {
                ne.mode = Some(mode);
                ne.start_ts = Some(Utc::now());
            },
        )?;
        let Some(node_execution) = started else {
            debug!("Node '{}' left QUEUED before it could run", node.identifier);
            return Ok(());
        };

        if let Some(timeout) = node.timeout() {
            self.timeouts.arm(node_execution_id, timeout);
        }
        self.record(&node_execution, EventType::Started);
        info!("Node '{}' started ({})", node.identifier, mode);

        let ctx = StepContext {
            node_execution_id,
            ambiance: &node_execution.ambiance,
            node,
            waiter: &self.waiter,
        };

        match mode {
            ExecutionMode::Sync => {
                let response = step.execute_sync(&ctx).unwrap_or_else(step_error_response);
                self.handle_step_response(node_execution_id, response)
            }
            ExecutionMode::Async => match step.execute_async(&ctx) {
                Ok(callback_ids) => self.suspend(
                    &node_execution,
                    mode,
                    ExecutableResponse::Async {
                        callback_ids: callback_ids.clone(),
                    },
                    callback_ids,
                )
                .map(|_| ()),
                Err(e) => self.handle_step_response(node_execution_id, step_error_response(e)),
            },
            ExecutionMode::Task => {
                let Some(dispatcher) = self.task_dispatcher.as_ref() else {
                    return self.handle_step_response(
                        node_execution_id,
                        StepResponse::failed(FailureInfo::configuration(
                            "TASK mode requires a task dispatcher",
                        )),
                    );
                };
                let queued = step.obtain_task(&ctx).and_then(|task| {
                    dispatcher
                        .queue_task(&node_execution.ambiance, &task)
                        .map(|task_id| (task, task_id))
                });
                match queued {
                    Ok((task, task_id)) => self.suspend(
                        &node_execution,
                        mode,
                        ExecutableResponse::Task {
                            task_id: task_id.clone(),
                            task_type: task.task_type,
                        },
                        vec![task_id],
                    )
                    .map(|_| ()),
                    Err(e) => self.handle_step_response(node_execution_id, step_error_response(e)),
                }
            }
            ExecutionMode::Child => {
                let child_node_id = match step.obtain_child(&ctx) {
                    Ok(id) => id,
                    Err(e) => {
                        return self.handle_step_response(node_execution_id, step_error_response(e))
                    }
                };
                self.spawn_children(&node_execution, mode, vec![child_node_id])
            }
            ExecutionMode::Children => {
                let child_node_ids = match step.obtain_children(&ctx) {
                    Ok(ids) => ids,
                    Err(e) => {
                        return self.handle_step_response(node_execution_id, step_error_response(e))
                    }
                };
                self.spawn_children(&node_execution, mode, child_node_ids)
            }
        }
    }

    /// Suspends `parent` on pre-assigned child ids, then queues the children.
    fn spawn_children(
        &self,
        parent: &NodeExecution,
        mode: ExecutionMode,
        child_node_ids: Vec<String>,
    ) -> Result<(), EngineError> {
        let plan_id = parent.ambiance.plan_id();
        let mut children = Vec::with_capacity(child_node_ids.len());
        for child_node_id in &child_node_ids {
            match self.plans.get_node(plan_id, child_node_id) {
                Ok(child) => children.push((child, Uuid::new_v4())),
                Err(e) => {
                    return self.handle_step_response(
                        parent.uuid,
                        StepResponse::failed(FailureInfo::configuration(e.to_string())),
                    )
                }
            }
        }

        let references: Vec<ChildReference> = children
            .iter()
            .map(|(node, id)| ChildReference {
                node_id: node.uuid.clone(),
                execution_id: *id,
            })
            .collect();
        let executable = match (mode, references.as_slice()) {
            (ExecutionMode::Child, [only]) => ExecutableResponse::Child {
                child_node_id: only.node_id.clone(),
                child_execution_id: only.execution_id,
            },
            _ => ExecutableResponse::Children {
                children: references.clone(),
            },
        };
        let correlation_ids = references
            .iter()
            .map(|r| r.execution_id.to_string())
            .collect();

        if !self.suspend(parent, mode, executable, correlation_ids)? {
            return Ok(());
        }

        for (child, id) in children {
            self.trigger_node(&parent.ambiance, &child, Some(parent.uuid), None, Some(id), None)?;
        }
        Ok(())
    }

    /// RUNNING -> WAITING(mode), then registers the wait.
    ///
    /// Returns false if the node was changed concurrently (e.g. aborted).
    fn suspend(
        &self,
        node_execution: &NodeExecution,
        mode: ExecutionMode,
        executable: ExecutableResponse,
        correlation_ids: Vec<String>,
    ) -> Result<bool, EngineError> {
        let Some(waiting) = Status::waiting_for(mode) else {
            return Ok(false);
        };
        let suspended = self.nodes.transition(
            node_execution.uuid,
            waiting,
            &|s| s == Status::Running,
            &|ne| ne.executable_responses.push(executable.clone()),
        )?;
        let Some(suspended) = suspended else {
            info!(
                "Node '{}' changed while dispatching, not waiting",
                node_execution.identifier
            );
            return Ok(false);
        };

        self.record(&suspended, EventType::Suspended);
        debug!(
            "Node '{}' waiting on {} correlation id(s)",
            suspended.identifier,
            correlation_ids.len()
        );
        self.waiter.wait_for_all(
            NotifyCallback::Resume {
                node_execution_id: suspended.uuid,
            },
            correlation_ids,
        );
        Ok(true)
    }

    /// Resumes a WAITING node with the responses it waited for.
    ///
    /// A node that is already final, or no longer waiting, is left alone.
    /// With `async_error` set the step is not consulted; the node errors
    /// with the error's classification.
    pub fn resume(
        &self,
        node_execution_id: Uuid,
        responses: ResponseMap,
        async_error: Option<ErrorResponse>,
    ) -> Result<(), EngineError> {
        let current = self.nodes.get(node_execution_id)?;
        if current.is_final() {
            info!(
                "Node '{}' is already {}, ignoring resume",
                current.identifier, current.status
            );
            return Ok(());
        }

        let resumed = self.nodes.transition(
            node_execution_id,
            Status::Running,
            &|s| s.is_waiting(),
            &|_| {},
        )?;
        let Some(node_execution) = resumed else {
            debug!(
                "Node '{}' is {}, not waiting; resume dropped",
                current.identifier, current.status
            );
            return Ok(());
        };
        self.record(&node_execution, EventType::Resumed);

        if let Some(error) = async_error {
            warn!(
                "Node '{}' received an error response: {}",
                node_execution.identifier, error.message
            );
            return self.handle_step_response(
                node_execution_id,
                StepResponse::errored(error.to_failure_info()),
            );
        }

        let node = self
            .plans
            .get_node(node_execution.ambiance.plan_id(), &node_execution.node_id)?;
        let Some(step) = self.steps.get(&node.step_type.kind) else {
            return self.handle_step_response(
                node_execution_id,
                StepResponse::failed(FailureInfo::configuration(format!(
                    "Unknown step type '{}'",
                    node.step_type.kind
                ))),
            );
        };

        let mode = node_execution.mode.unwrap_or(ExecutionMode::Async);
        let children = if mode.spawns_children() {
            self.latest_children(node_execution_id)
        } else {
            Vec::new()
        };
        let package = ResumePackage {
            node_execution_id,
            ambiance: &node_execution.ambiance,
            node: &node,
            mode,
            responses: &responses,
            children: &children,
        };

        let response = step
            .handle_resume(&package)
            .unwrap_or_else(step_error_response);
        self.handle_step_response(node_execution_id, response)
    }

    /// Children of a node, excluding superseded retry attempts.
    pub fn latest_children(&self, parent_id: Uuid) -> Vec<NodeExecution> {
        self.nodes
            .find_children(parent_id)
            .into_iter()
            .filter(|c| !c.old_retry)
            .collect()
    }

    /// Converts an unexpected failure for the node at the top of `ambiance`
    /// into an ERRORED node. Never propagates.
    pub fn handle_error(&self, ambiance: &Ambiance, message: &str) {
        let runtime_id = ambiance
            .obtain_current_runtime_id()
            .and_then(|id| Uuid::parse_str(id).ok());
        match runtime_id {
            Some(id) => self.handle_error_for(id, message),
            None => error!(
                "Unhandled error in plan execution '{}' outside any node: {}",
                ambiance.plan_execution_id(),
                message
            ),
        }
    }

    /// Same as [`Engine::handle_error`], addressed by node execution id.
    pub fn handle_error_for(&self, node_execution_id: Uuid, message: &str) {
        let failure = FailureInfo::new(message, FailureType::Unknown);
        if let Err(e) = self.fail_node(node_execution_id, Status::Errored, failure) {
            error!(
                "Could not record error for node execution '{}': {}",
                node_execution_id, e
            );
        }
    }

    /// Moves any active node to `status` with `failure` and concludes it.
    pub(crate) fn fail_node(
        &self,
        node_execution_id: Uuid,
        status: Status,
        failure: FailureInfo,
    ) -> Result<(), EngineError> {
        let failed = self.nodes.transition(
            node_execution_id,
            status,
            &|s| s.is_active(),
            &|ne| ne.failure_info = Some(failure.clone()),
        )?;
        match failed {
            Some(node_execution) => {
                error!(
                    "Node '{}' {}: {}",
                    node_execution.identifier, status, failure.message
                );
                self.after_settle(&node_execution);
                self.waiter.cancel_for(node_execution_id);
                self.conclude(&node_execution)
            }
            None => {
                debug!(
                    "Node execution '{}' could not move to {}, error dropped",
                    node_execution_id, status
                );
                Ok(())
            }
        }
    }

    fn skip_node(&self, node_execution: &NodeExecution) -> Result<(), EngineError> {
        let skipped = self.nodes.transition(
            node_execution.uuid,
            Status::Skipped,
            &|s| s == Status::Queued,
            &|_| {},
        )?;
        if let Some(skipped) = skipped {
            info!("Node '{}' skipped", skipped.identifier);
            self.after_settle(&skipped);
            self.conclude(&skipped)?;
        }
        Ok(())
    }

    /// Fails a node that cannot run because of its configuration.
    ///
    /// No adviser is consulted, so the failure is never retried.
    fn fail_configuration(
        &self,
        node_execution: &NodeExecution,
        reason: String,
    ) -> Result<(), EngineError> {
        let failure = FailureInfo::configuration(reason);
        let failed = self.nodes.transition(
            node_execution.uuid,
            Status::Failed,
            &|s| s == Status::Queued,
            &|ne| ne.failure_info = Some(failure.clone()),
        )?;
        if let Some(failed) = failed {
            error!(
                "Node '{}' failed: {}",
                failed.identifier, failure.message
            );
            self.after_settle(&failed);
            self.end_scope(&failed)?;
        }
        Ok(())
    }

    /// Status bookkeeping shared by every settle: timers and timeline.
    pub(crate) fn after_settle(&self, node_execution: &NodeExecution) {
        let status = node_execution.status;
        if status.is_final() || status == Status::InterventionWaiting {
            self.timeouts.cancel(node_execution.uuid);
        }
        let event = match status {
            s if s.is_positive() => EventType::Completed,
            s if s.is_broke() => EventType::Failed,
            Status::Aborted => EventType::Interrupted,
            Status::InterventionWaiting => EventType::Suspended,
            _ => return,
        };
        self.record(node_execution, event);
    }

    pub(crate) fn record(&self, node_execution: &NodeExecution, event: EventType) {
        if let Some(mut timeline) = self.timelines.get_mut(node_execution.plan_execution_id()) {
            timeline.add_event(timeline_label(node_execution), event);
        }
    }

    /// Timeline of a plan execution tracked by this engine.
    pub fn timeline(&self, plan_execution_id: &str) -> Option<ExecutionTimeline> {
        self.timelines
            .get(plan_execution_id)
            .map(|t| t.value().clone())
    }

    /// Registers an interrupt; see [`InterruptManager::register`].
    pub fn register_interrupt(&self, interrupt: Interrupt) -> Result<Uuid, EngineError> {
        Ok(self.interrupts.register(interrupt)?)
    }

    /// Evaluates a barrier against this engine's node executions.
    pub fn evaluate_barrier(&self, barrier: &Barrier) -> Result<BarrierState, EngineError> {
        let proctor = ExecutionProctor::new(Arc::clone(&self.nodes));
        Ok(barrier.push_down(&proctor, self.config.proctor_failure_policy)?)
    }

    /// Deletes node executions whose retention has passed, and forgets
    /// correlation ids settled before it.
    pub fn purge_expired(&self) -> usize {
        self.waiter.prune(self.retention());
        self.nodes.purge_expired(Utc::now())
    }

    pub(crate) fn retention(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.config.node_ttl()).unwrap_or_else(|_| ChronoDuration::days(7))
    }

    /// Runs one executor job.
    pub fn run_job(&self, job: EngineJob) -> Result<(), EngineError> {
        match job {
            EngineJob::StartNode { node_execution_id } => self.start_node(node_execution_id),
            EngineJob::Resume {
                node_execution_id,
                responses,
                async_error,
            } => self.resume(node_execution_id, responses, async_error),
            EngineJob::Fail {
                node_execution_id,
                error,
            } => self.fail_node(node_execution_id, Status::Errored, error.to_failure_info()),
            EngineJob::RegisterInterrupt(interrupt) => {
                self.interrupts.register(*interrupt)?;
                Ok(())
            }
            EngineJob::ApplyInterrupt(interrupt_id) => self.apply_interrupt(interrupt_id),
            EngineJob::Timeout(node_execution_id) => {
                self.interrupts.on_timeout(node_execution_id)?;
                Ok(())
            }
        }
    }
}

fn step_error_response(error: StepError) -> StepResponse {
    let failure = error.to_failure_info();
    if failure.is_configuration_error() {
        StepResponse::failed(failure)
    } else {
        StepResponse::errored(failure)
    }
}

fn timeline_label(node_execution: &NodeExecution) -> String {
    if node_execution.retry_index == 0 {
        node_execution.identifier.clone()
    } else {
        format!(
            "{}#{}",
            node_execution.identifier, node_execution.retry_index
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use serde_json::{json, Value};

    use crate::adviser::{Adviser, AdviserError, AdviserResponse, AdvisingEvent};
    use crate::barrier::{Forcer, PLAN_EXECUTION_ID_KEY};
    use crate::execution::step::TaskDescriptor;
    use crate::interrupt::InterruptType;
    use crate::plan::StepType;
    use crate::waiter::{spawn_executor, ExecutorHandle};

    /// Fails with an application error until `failures` attempts have failed.
    struct FlakyStep {
        failures: AtomicU32,
    }

    impl FlakyStep {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(failures),
            })
        }
    }

    impl Step for FlakyStep {
        fn execute_sync(&self, _ctx: &StepContext<'_>) -> Result<StepResponse, StepError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining == 0 {
                return Ok(StepResponse::succeeded().with_outcome("attempt", json!("ok")));
            }
            self.failures.store(remaining - 1, Ordering::SeqCst);
            Ok(StepResponse::failed(FailureInfo::new(
                "flaky failure",
                FailureType::Application,
            )))
        }
    }

    /// Waits on the `callback_id` step parameter.
    struct CallbackStep;

    impl Step for CallbackStep {
        fn execute_async(&self, ctx: &StepContext<'_>) -> Result<Vec<String>, StepError> {
            let id = ctx.node.step_parameters["callback_id"]
                .as_str()
                .ok_or_else(|| StepError::InvalidParameters("callback_id".to_string()))?;
            Ok(vec![id.to_string()])
        }
    }

    struct PanicStep;

    impl Step for PanicStep {
        fn execute_sync(&self, _ctx: &StepContext<'_>) -> Result<StepResponse, StepError> {
            panic!("step blew up");
        }
    }

    struct ShellTaskStep;

    impl Step for ShellTaskStep {
        fn obtain_task(&self, ctx: &StepContext<'_>) -> Result<TaskDescriptor, StepError> {
            Ok(TaskDescriptor {
                task_type: "shell".to_string(),
                payload: ctx.node.step_parameters.clone(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        tasks: Mutex<Vec<TaskDescriptor>>,
    }

    impl TaskDispatcher for RecordingDispatcher {
        fn queue_task(&self, _ambiance: &Ambiance, task: &TaskDescriptor) -> Result<String, StepError> {
            let mut tasks = self
                .tasks
                .lock()
                .map_err(|e| StepError::Dispatch(e.to_string()))?;
            tasks.push(task.clone());
            Ok(format!("task-{}", tasks.len()))
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            workers: 4,
            state_dir: None,
            ..EngineConfig::default()
        }
    }

    fn sync_node(id: &str, kind: &str) -> PlanNode {
        PlanNode::new(id, id, StepType::step(kind)).with_facilitator("SYNC")
    }

    fn callback_node(id: &str, callback_id: &str) -> PlanNode {
        PlanNode::new(id, id, StepType::step("CALLBACK"))
            .with_facilitator("ASYNC")
            .with_step_parameters(json!({ "callback_id": callback_id }))
    }

    fn next(node_id: &str) -> Value {
        json!({ "next_node_id": node_id })
    }

    fn builder() -> EngineBuilder {
        EngineBuilder::new(test_config()).step("CALLBACK", Arc::new(CallbackStep))
    }

    fn start(builder: EngineBuilder, plan: Plan) -> (Arc<Engine>, ExecutorHandle, String) {
        let plan_id = plan.id.clone();
        let engine = builder.build().unwrap();
        let executor = spawn_executor(Arc::clone(&engine)).unwrap();
        engine.register_plan(plan).unwrap();
        let execution_id = engine.start_plan(&plan_id, HashMap::new()).unwrap();
        (engine, executor, execution_id)
    }

    async fn finish(engine: &Engine, execution_id: &str) -> Status {
        tokio::time::timeout(Duration::from_secs(10), engine.wait_for_plan(execution_id))
            .await
            .expect("plan did not finish in time")
            .unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn attempts(engine: &Engine, execution_id: &str, identifier: &str) -> Vec<NodeExecution> {
        let mut nodes: Vec<NodeExecution> = engine
            .node_executions()
            .find_by_plan_execution(execution_id)
            .into_iter()
            .filter(|ne| ne.identifier == identifier)
            .collect();
        nodes.sort_by_key(|ne| (ne.retry_index, ne.created_at));
        nodes
    }

    fn latest(engine: &Engine, execution_id: &str, identifier: &str) -> Option<NodeExecution> {
        attempts(engine, execution_id, identifier).pop()
    }

    fn status_of(engine: &Engine, execution_id: &str, identifier: &str) -> Option<Status> {
        latest(engine, execution_id, identifier).map(|ne| ne.status)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sequential_plan_succeeds() {
        let plan = Plan::new("seq", "a")
            .with_node(sync_node("a", "NOOP").with_adviser("ON_SUCCESS", next("b")))
            .with_node(sync_node("b", "NOOP"));
        let (engine, executor, id) = start(builder(), plan);

        assert_eq!(finish(&engine, &id).await, Status::Succeeded);

        let a = latest(&engine, &id, "a").unwrap();
        let b = latest(&engine, &id, "b").unwrap();
        assert_eq!(a.status, Status::Succeeded);
        assert_eq!(a.next_id, Some(b.uuid));
        assert_eq!(b.previous_id, Some(a.uuid));
        assert_eq!(b.ambiance.levels().len(), 1);
        assert!(a.valid_until.is_some());

        let timeline = engine.timeline(&id).unwrap();
        assert!(timeline.durations().contains_key("a"));
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_section_and_fork_join() {
        let plan = Plan::new("fan", "section")
            .with_node(
                PlanNode::new("section", "section", StepType::step("SECTION"))
                    .with_facilitator("CHILD")
                    .with_children(vec!["fork".to_string()]),
            )
            .with_node(
                PlanNode::new("fork", "fork", StepType::step("FORK"))
                    .with_facilitator("CHILDREN")
                    .with_children(vec!["x".to_string(), "y".to_string(), "z".to_string()]),
            )
            .with_node(sync_node("x", "NOOP"))
            .with_node(sync_node("y", "NOOP"))
            .with_node(sync_node("z", "NOOP"));
        let (engine, executor, id) = start(builder(), plan);

        assert_eq!(finish(&engine, &id).await, Status::Succeeded);

        let section = latest(&engine, &id, "section").unwrap();
        let fork = latest(&engine, &id, "fork").unwrap();
        assert_eq!(fork.parent_id, Some(section.uuid));
        assert_eq!(fork.status, Status::Succeeded);

        let children = engine.latest_children(fork.uuid);
        assert_eq!(children.len(), 3);
        assert!(children.iter().all(|c| c.status == Status::Succeeded));
        assert!(children.iter().all(|c| c.ambiance.levels().len() == 3));
        assert!(matches!(
            fork.executable_responses.last(),
            Some(ExecutableResponse::Children { children }) if children.len() == 3
        ));
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_branch_fails_fork() {
        let plan = Plan::new("fan", "fork")
            .with_node(
                PlanNode::new("fork", "fork", StepType::step("FORK"))
                    .with_facilitator("CHILDREN")
                    .with_children(vec!["ok".to_string(), "bad".to_string()]),
            )
            .with_node(sync_node("ok", "NOOP"))
            .with_node(sync_node("bad", "FLAKY"));
        let (engine, executor, id) = start(builder().step("FLAKY", FlakyStep::new(u32::MAX)), plan);

        assert_eq!(finish(&engine, &id).await, Status::Failed);
        let fork = latest(&engine, &id, "fork").unwrap();
        assert_eq!(fork.status, Status::Failed);
        assert_eq!(fork.failure_info.unwrap().message, "flaky failure");
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_retry_until_success() {
        let plan = Plan::new("retry", "deploy").with_node(
            sync_node("deploy", "FLAKY")
                .with_adviser("RETRY", json!({ "retry_count": 3, "wait_secs": [0] })),
        );
        let (engine, executor, id) = start(builder().step("FLAKY", FlakyStep::new(2)), plan);

        assert_eq!(finish(&engine, &id).await, Status::Succeeded);

        let runs = attempts(&engine, &id, "deploy");
        assert_eq!(runs.len(), 3);
        assert!(runs[0].old_retry && runs[1].old_retry && !runs[2].old_retry);
        assert_eq!(runs[0].status, Status::Failed);
        assert_eq!(runs[2].retry_index, 2);
        assert_eq!(runs[2].retry_ids, vec![runs[0].uuid, runs[1].uuid]);
        assert_eq!(runs[2].notify_id, runs[0].notify_id);
        assert_eq!(runs[2].ambiance.current_level().unwrap().retry_index, 2);
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_retry_exhausted_marks_failed() {
        let plan = Plan::new("retry", "deploy").with_node(
            sync_node("deploy", "FLAKY")
                .with_adviser("RETRY", json!({ "retry_count": 1, "wait_secs": [0] })),
        );
        let (engine, executor, id) = start(builder().step("FLAKY", FlakyStep::new(u32::MAX)), plan);

        assert_eq!(finish(&engine, &id).await, Status::Failed);
        assert_eq!(attempts(&engine, &id, "deploy").len(), 2);
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unknown_step_fails_without_retry() {
        let plan = Plan::new("bogus", "a").with_node(
            sync_node("a", "BOGUS").with_adviser("RETRY", json!({ "retry_count": 5 })),
        );
        let (engine, executor, id) = start(builder(), plan);

        assert_eq!(finish(&engine, &id).await, Status::Failed);
        let runs = attempts(&engine, &id, "a");
        assert_eq!(runs.len(), 1);
        assert!(runs[0].failure_info.as_ref().unwrap().is_configuration_error());
        executor.shutdown().await;
    }

    /// Claims every outcome and panics while advising.
    struct PanicAdviser;

    impl Adviser for PanicAdviser {
        fn can_advise(&self, _event: &AdvisingEvent<'_>) -> bool {
            true
        }

        fn on_advise(&self, _event: &AdvisingEvent<'_>) -> Result<AdviserResponse, AdviserError> {
            panic!("adviser blew up");
        }
    }

    /// Serves node `b` once, then reports it missing.
    #[derive(Default)]
    struct VanishingPlans {
        plans: InMemoryPlanRepository,
        lookups: AtomicU32,
    }

    impl PlanRepository for VanishingPlans {
        fn save(&self, plan: Plan) -> Result<(), PlanError> {
            self.plans.save(plan)
        }

        fn get_plan(&self, plan_id: &str) -> Result<Arc<Plan>, PlanError> {
            self.plans.get_plan(plan_id)
        }

        fn get_node(&self, plan_id: &str, node_id: &str) -> Result<Arc<PlanNode>, PlanError> {
            if node_id == "b" && self.lookups.fetch_add(1, Ordering::SeqCst) >= 1 {
                return Err(PlanError::NodeNotFound {
                    plan_id: plan_id.to_string(),
                    node_id: node_id.to_string(),
                });
            }
            self.plans.get_node(plan_id, node_id)
        }
    }

    #[tokio::test]
    async fn test_register_plan_rejects_dangling_next() {
        let engine = builder().build().unwrap();
        let plan = Plan::new("ghosted", "a")
            .with_node(sync_node("a", "NOOP").with_adviser("ON_SUCCESS", next("ghost")));
        assert!(matches!(
            engine.register_plan(plan),
            Err(EngineError::Plan(PlanError::DanglingReference { ref to, .. })) if to == "ghost"
        ));
        assert!(engine.plans().get_plan("ghosted").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dangling_next_fails_plan() {
        let plans = Arc::new(InMemoryPlanRepository::new());
        plans
            .save(
                Plan::new("ghosted", "a")
                    .with_node(sync_node("a", "NOOP").with_adviser("ON_SUCCESS", next("ghost"))),
            )
            .unwrap();
        let engine = builder().plan_repository(plans).build().unwrap();
        let executor = spawn_executor(Arc::clone(&engine)).unwrap();
        let id = engine.start_plan("ghosted", HashMap::new()).unwrap();

        assert_eq!(finish(&engine, &id).await, Status::Failed);
        let a = latest(&engine, &id, "a").unwrap();
        assert_eq!(a.status, Status::Failed);
        let failure = a.failure_info.unwrap();
        assert!(failure.is_configuration_error());
        assert!(failure.message.contains("ghost"));
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panicking_adviser_fails_plan() {
        let plan = Plan::new("explode", "a")
            .with_node(sync_node("a", "NOOP").with_adviser("EXPLODE", Value::Null));
        let builder = builder().adviser("EXPLODE", Arc::new(PanicAdviser));
        let (engine, executor, id) = start(builder, plan);

        assert_eq!(finish(&engine, &id).await, Status::Failed);
        let failure = latest(&engine, &id, "a").unwrap().failure_info.unwrap();
        assert!(failure.is_configuration_error());
        assert!(failure.message.contains("panicked"));
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_advance_errors_plan() {
        let plan = Plan::new("vanish", "a")
            .with_node(sync_node("a", "NOOP").with_adviser("ON_SUCCESS", next("b")))
            .with_node(sync_node("b", "NOOP"));
        let builder = builder().plan_repository(Arc::new(VanishingPlans::default()));
        let (engine, executor, id) = start(builder, plan);

        assert_eq!(finish(&engine, &id).await, Status::Errored);
        let a = latest(&engine, &id, "a").unwrap();
        assert_eq!(a.status, Status::Succeeded);
        assert!(a.failure_info.unwrap().message.contains("Could not advance"));
        assert!(latest(&engine, &id, "b").is_none());
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_skip_condition() {
        let plan = Plan::new("skip", "a")
            .with_node(
                sync_node("a", "FLAKY")
                    .with_skip("true", SkipType::SkipNode)
                    .with_adviser("ON_SUCCESS", next("b")),
            )
            .with_node(sync_node("b", "NOOP"));
        let (engine, executor, id) = start(builder().step("FLAKY", FlakyStep::new(u32::MAX)), plan);

        assert_eq!(finish(&engine, &id).await, Status::Succeeded);
        assert_eq!(status_of(&engine, &id, "a"), Some(Status::Skipped));
        assert_eq!(status_of(&engine, &id, "b"), Some(Status::Succeeded));
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_async_resume_and_idempotence() {
        let plan = Plan::new("async", "a").with_node(callback_node("a", "cb-a"));
        let (engine, executor, id) = start(builder(), plan);

        eventually(|| status_of(&engine, &id, "a") == Some(Status::Waiting(ExecutionMode::Async))).await;
        engine
            .waiter()
            .notify_success("cb-a", json!({ "artifact": "app.tar" }));

        assert_eq!(finish(&engine, &id).await, Status::Succeeded);
        let a = latest(&engine, &id, "a").unwrap();
        assert_eq!(a.outcomes.len(), 1);
        assert_eq!(a.outcomes[0].name, "cb-a");

        // Late and duplicate resumes leave a final node untouched.
        engine.resume(a.uuid, ResponseMap::new(), None).unwrap();
        engine
            .resume(a.uuid, ResponseMap::new(), Some(ErrorResponse::new("late", Vec::new())))
            .unwrap();
        engine.waiter().notify_success("cb-a", json!({}));
        let after = engine.node_executions().get(a.uuid).unwrap();
        assert_eq!(after.status, Status::Succeeded);
        assert_eq!(after.outcomes.len(), 1);
        assert_eq!(after.version, a.version);
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_async_error_classified() {
        let plan = Plan::new("async", "a").with_node(callback_node("a", "cb-e"));
        let (engine, executor, id) = start(builder(), plan);

        eventually(|| status_of(&engine, &id, "a").map(Status::is_waiting).unwrap_or(false)).await;
        engine.waiter().notify_error(
            "cb-e",
            ErrorResponse::new("delegate lost", vec![FailureType::Connectivity]),
        );

        assert_eq!(finish(&engine, &id).await, Status::Errored);
        let failure = latest(&engine, &id, "a").unwrap().failure_info.unwrap();
        assert!(failure.has_type(FailureType::Connectivity));
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_abort_then_late_error_is_ignored() {
        let plan = Plan::new("abort", "a").with_node(callback_node("a", "cb-late"));
        let (engine, executor, id) = start(builder(), plan);

        eventually(|| status_of(&engine, &id, "a").map(Status::is_waiting).unwrap_or(false)).await;
        let a = latest(&engine, &id, "a").unwrap();
        engine
            .register_interrupt(Interrupt::for_node(InterruptType::Abort, &id, a.uuid, "ops"))
            .unwrap();

        assert_eq!(finish(&engine, &id).await, Status::Aborted);

        engine
            .waiter()
            .notify_error("cb-late", ErrorResponse::new("too late", Vec::new()));
        assert_eq!(engine.waiter().stashed_notifications(), 0);
        engine
            .resume(a.uuid, ResponseMap::new(), Some(ErrorResponse::new("too late", Vec::new())))
            .unwrap();

        let aborted = engine.node_executions().get(a.uuid).unwrap();
        assert_eq!(aborted.status, Status::Aborted);
        assert_eq!(aborted.interrupt_history.len(), 1);
        assert_eq!(aborted.interrupt_history[0].interrupt_type, InterruptType::Abort);
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_on_abort_runs_rollback() {
        let plan = Plan::new("rollback", "a")
            .with_node(
                callback_node("a", "cb-rb")
                    .with_adviser("ON_ABORT", json!({ "rollback_node_id": "cleanup" })),
            )
            .with_node(sync_node("cleanup", "NOOP"));
        let (engine, executor, id) = start(builder(), plan);

        eventually(|| status_of(&engine, &id, "a").map(Status::is_waiting).unwrap_or(false)).await;
        let a = latest(&engine, &id, "a").unwrap();
        engine
            .register_interrupt(Interrupt::for_node(InterruptType::Abort, &id, a.uuid, "ops"))
            .unwrap();

        assert_eq!(finish(&engine, &id).await, Status::Aborted);
        assert_eq!(status_of(&engine, &id, "cleanup"), Some(Status::Succeeded));
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_abort_all_aborts_children() {
        let plan = Plan::new("fan", "fork")
            .with_node(
                PlanNode::new("fork", "fork", StepType::step("FORK"))
                    .with_facilitator("CHILDREN")
                    .with_children(vec!["l".to_string(), "r".to_string()]),
            )
            .with_node(callback_node("l", "cb-l"))
            .with_node(callback_node("r", "cb-r"));
        let (engine, executor, id) = start(builder(), plan);

        eventually(|| {
            status_of(&engine, &id, "l").map(Status::is_waiting).unwrap_or(false)
                && status_of(&engine, &id, "r").map(Status::is_waiting).unwrap_or(false)
        })
        .await;
        engine
            .register_interrupt(Interrupt::for_plan(InterruptType::AbortAll, &id, "ops"))
            .unwrap();

        assert_eq!(finish(&engine, &id).await, Status::Aborted);
        for identifier in ["fork", "l", "r"] {
            assert_eq!(status_of(&engine, &id, identifier), Some(Status::Aborted));
        }
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pause_and_resume_plan() {
        let plan = Plan::new("pause", "a")
            .with_node(
                PlanNode::new("a", "a", StepType::step("WAIT"))
                    .with_facilitator("ASYNC")
                    .with_step_parameters(json!({ "wait_ms": 300 }))
                    .with_adviser("ON_SUCCESS", next("b")),
            )
            .with_node(sync_node("b", "NOOP"));
        let (engine, executor, id) = start(builder(), plan);

        eventually(|| status_of(&engine, &id, "a").map(Status::is_waiting).unwrap_or(false)).await;
        engine
            .register_interrupt(Interrupt::for_plan(InterruptType::Pause, &id, "ops"))
            .unwrap();
        eventually(|| status_of(&engine, &id, "b") == Some(Status::Paused)).await;
        assert_eq!(status_of(&engine, &id, "a"), Some(Status::Succeeded));
        assert!(engine.plan_executions().get(&id).unwrap().is_paused());

        engine
            .register_interrupt(Interrupt::for_plan(InterruptType::Resume, &id, "ops"))
            .unwrap();
        assert_eq!(finish(&engine, &id).await, Status::Succeeded);
        assert_eq!(status_of(&engine, &id, "b"), Some(Status::Succeeded));
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_node_pause_on_waiting_node_is_discarded() {
        let plan = Plan::new("busy", "a").with_node(callback_node("a", "cb-busy"));
        let (engine, executor, id) = start(builder(), plan);

        eventually(|| status_of(&engine, &id, "a").map(Status::is_waiting).unwrap_or(false)).await;
        let a = latest(&engine, &id, "a").unwrap();
        let interrupt_id = engine
            .register_interrupt(Interrupt::for_node(InterruptType::Pause, &id, a.uuid, "ops"))
            .unwrap();

        let interrupts = engine.interrupts().repository().clone();
        eventually(|| {
            interrupts
                .get(interrupt_id)
                .map(|i| i.state == crate::interrupt::InterruptState::Discarded)
                .unwrap_or(false)
        })
        .await;
        assert!(status_of(&engine, &id, "a").map(Status::is_waiting).unwrap_or(false));

        engine.waiter().notify_success("cb-busy", json!({}));
        assert_eq!(finish(&engine, &id).await, Status::Succeeded);
        assert!(latest(&engine, &id, "a").unwrap().interrupt_history.is_empty());
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_manual_intervention_retry() {
        let plan = Plan::new("manual", "deploy")
            .with_node(sync_node("deploy", "FLAKY").with_adviser("MANUAL_INTERVENTION", Value::Null));
        let (engine, executor, id) = start(builder().step("FLAKY", FlakyStep::new(1)), plan);

        eventually(|| status_of(&engine, &id, "deploy") == Some(Status::InterventionWaiting)).await;
        let parked = latest(&engine, &id, "deploy").unwrap();
        assert_eq!(parked.advised_status, Some(Status::Failed));

        engine
            .register_interrupt(Interrupt::for_node(InterruptType::Retry, &id, parked.uuid, "ops"))
            .unwrap();

        assert_eq!(finish(&engine, &id).await, Status::Succeeded);
        let runs = attempts(&engine, &id, "deploy");
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, Status::Failed);
        assert!(runs[0].old_retry);
        assert_eq!(runs[1].status, Status::Succeeded);
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_manual_intervention_ignore() {
        let plan = Plan::new("manual", "deploy")
            .with_node(
                sync_node("deploy", "FLAKY")
                    .with_adviser("MANUAL_INTERVENTION", Value::Null)
                    .with_adviser("ON_SUCCESS", next("notify")),
            )
            .with_node(sync_node("notify", "NOOP"));
        let (engine, executor, id) = start(builder().step("FLAKY", FlakyStep::new(u32::MAX)), plan);

        eventually(|| status_of(&engine, &id, "deploy") == Some(Status::InterventionWaiting)).await;
        let parked = latest(&engine, &id, "deploy").unwrap();
        engine
            .register_interrupt(Interrupt::for_node(InterruptType::Ignore, &id, parked.uuid, "ops"))
            .unwrap();

        assert_eq!(finish(&engine, &id).await, Status::Succeeded);
        assert_eq!(status_of(&engine, &id, "deploy"), Some(Status::IgnoreFailed));
        assert_eq!(status_of(&engine, &id, "notify"), Some(Status::Succeeded));
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interrupt_on_final_node_is_discarded() {
        let plan = Plan::new("done", "a").with_node(sync_node("a", "NOOP"));
        let (engine, executor, id) = start(builder(), plan);
        assert_eq!(finish(&engine, &id).await, Status::Succeeded);

        let a = latest(&engine, &id, "a").unwrap();
        let interrupt_id = engine
            .register_interrupt(Interrupt::for_node(InterruptType::Abort, &id, a.uuid, "ops"))
            .unwrap();

        let interrupts = engine.interrupts().repository().clone();
        eventually(|| {
            interrupts
                .get(interrupt_id)
                .map(|i| i.state == crate::interrupt::InterruptState::Discarded)
                .unwrap_or(false)
        })
        .await;
        assert_eq!(status_of(&engine, &id, "a"), Some(Status::Succeeded));
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_timeout_expires_waiting_node() {
        let plan = Plan::new("slow", "a").with_node(
            PlanNode::new("a", "a", StepType::step("WAIT"))
                .with_facilitator("ASYNC")
                .with_step_parameters(json!({ "wait_secs": 30 }))
                .with_timeout_secs(1),
        );
        let (engine, executor, id) = start(builder(), plan);

        assert_eq!(finish(&engine, &id).await, Status::Expired);
        let a = latest(&engine, &id, "a").unwrap();
        assert_eq!(a.status, Status::Expired);
        assert!(a.failure_info.unwrap().has_type(FailureType::Timeout));
        assert_eq!(a.interrupt_history[0].interrupt_type, InterruptType::MarkExpired);
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_timeout_expires_child_subtree() {
        let plan = Plan::new("slow", "section")
            .with_node(
                PlanNode::new("section", "section", StepType::step("SECTION"))
                    .with_facilitator("CHILD")
                    .with_children(vec!["sleep".to_string()])
                    .with_timeout_secs(1),
            )
            .with_node(
                PlanNode::new("sleep", "sleep", StepType::step("WAIT"))
                    .with_facilitator("ASYNC")
                    .with_step_parameters(json!({ "wait_secs": 30 })),
            );
        let (engine, executor, id) = start(builder(), plan);

        assert_eq!(finish(&engine, &id).await, Status::Expired);
        assert_eq!(status_of(&engine, &id, "section"), Some(Status::Expired));
        assert_eq!(status_of(&engine, &id, "sleep"), Some(Status::Expired));
        let section = latest(&engine, &id, "section").unwrap();
        assert_eq!(section.interrupt_history[0].interrupt_type, InterruptType::ExpireAll);
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_task_mode_dispatch() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let plan = Plan::new("task", "build").with_node(
            PlanNode::new("build", "build", StepType::step("SHELL"))
                .with_facilitator("TASK")
                .with_step_parameters(json!({ "script": "make" })),
        );
        let builder = builder()
            .step("SHELL", Arc::new(ShellTaskStep))
            .task_dispatcher(dispatcher.clone());
        let (engine, executor, id) = start(builder, plan);

        eventually(|| status_of(&engine, &id, "build") == Some(Status::Waiting(ExecutionMode::Task))).await;
        assert_eq!(dispatcher.tasks.lock().unwrap()[0].payload["script"], "make");
        engine
            .waiter()
            .notify_success("task-1", json!({ "exit_code": 0 }));

        assert_eq!(finish(&engine, &id).await, Status::Succeeded);
        let build = latest(&engine, &id, "build").unwrap();
        assert_eq!(build.outcomes[0].name, "task-1");
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_task_mode_without_dispatcher() {
        let plan = Plan::new("task", "build").with_node(
            PlanNode::new("build", "build", StepType::step("SHELL")).with_facilitator("TASK"),
        );
        let (engine, executor, id) = start(builder().step("SHELL", Arc::new(ShellTaskStep)), plan);

        assert_eq!(finish(&engine, &id).await, Status::Failed);
        let build = latest(&engine, &id, "build").unwrap();
        assert!(build.failure_info.unwrap().is_configuration_error());
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panicking_step_errors_node() {
        let plan = Plan::new("panic", "a").with_node(sync_node("a", "PANIC"));
        let (engine, executor, id) = start(builder().step("PANIC", Arc::new(PanicStep)), plan);

        assert_eq!(finish(&engine, &id).await, Status::Errored);
        assert_eq!(status_of(&engine, &id, "a"), Some(Status::Errored));
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_barrier_over_node_executions() {
        let plan = Plan::new("barrier", "a").with_node(sync_node("a", "NOOP"));
        let (engine, executor, id) = start(builder(), plan);
        assert_eq!(finish(&engine, &id).await, Status::Succeeded);

        let arrived = Barrier::new("gate", Forcer::new("a")).with_context(PLAN_EXECUTION_ID_KEY, &id);
        assert_eq!(engine.evaluate_barrier(&arrived).unwrap(), BarrierState::Down);

        let absent = Barrier::new("gate", Forcer::new("never")).with_context(PLAN_EXECUTION_ID_KEY, &id);
        assert_eq!(engine.evaluate_barrier(&absent).unwrap(), BarrierState::Standing);
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_snapshot_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            state_dir: Some(dir.path().to_path_buf()),
            ..test_config()
        };
        let plan = || Plan::new("recover", "a").with_node(callback_node("a", "cb-restart"));

        let first = EngineBuilder::new(config.clone())
            .step("CALLBACK", Arc::new(CallbackStep))
            .build()
            .unwrap();
        let first_executor = spawn_executor(Arc::clone(&first)).unwrap();
        first.register_plan(plan()).unwrap();
        let id = first.start_plan("recover", HashMap::new()).unwrap();
        eventually(|| status_of(&first, &id, "a").map(Status::is_waiting).unwrap_or(false)).await;
        let snapshot = first.snapshot(&id).unwrap();
        first_executor.shutdown().await;

        let second = EngineBuilder::new(config)
            .step("CALLBACK", Arc::new(CallbackStep))
            .build()
            .unwrap();
        let second_executor = spawn_executor(Arc::clone(&second)).unwrap();
        second.register_plan(plan()).unwrap();
        assert_eq!(second.recover(snapshot).unwrap(), 1);

        second
            .waiter()
            .notify_success("cb-restart", json!({ "resumed": true }));
        assert_eq!(finish(&second, &id).await, Status::Succeeded);
        assert!(dir.path().join(format!("{}.state", id)).exists());
        second_executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_recover_rearms_node_timeout() {
        let plan = || {
            Plan::new("slow", "a").with_node(
                PlanNode::new("a", "a", StepType::step("WAIT"))
                    .with_facilitator("ASYNC")
                    .with_step_parameters(json!({ "wait_secs": 60 }))
                    .with_timeout_secs(1),
            )
        };
        let (first, first_executor, id) = start(builder(), plan());
        eventually(|| status_of(&first, &id, "a").map(Status::is_waiting).unwrap_or(false)).await;
        let snapshot = first.snapshot(&id).unwrap();
        first_executor.shutdown().await;

        let second = builder().build().unwrap();
        let second_executor = spawn_executor(Arc::clone(&second)).unwrap();
        second.register_plan(plan()).unwrap();
        assert_eq!(second.recover(snapshot).unwrap(), 1);

        assert_eq!(finish(&second, &id).await, Status::Expired);
        let a = latest(&second, &id, "a").unwrap();
        assert!(a.failure_info.unwrap().has_type(FailureType::Timeout));
        second_executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_recover_applies_registered_interrupt() {
        let plan = || Plan::new("held", "a").with_node(callback_node("a", "cb-held"));

        // No executor: the start job and the interrupt stay unprocessed.
        let first = builder().build().unwrap();
        first.register_plan(plan()).unwrap();
        let id = first.start_plan("held", HashMap::new()).unwrap();
        let interrupt_id = first
            .register_interrupt(Interrupt::for_plan(InterruptType::AbortAll, &id, "ops"))
            .unwrap();
        let snapshot = first.snapshot(&id).unwrap();
        assert_eq!(snapshot.interrupts[0].state, crate::interrupt::InterruptState::Registered);

        let second = builder().build().unwrap();
        let second_executor = spawn_executor(Arc::clone(&second)).unwrap();
        second.register_plan(plan()).unwrap();
        assert_eq!(second.recover(snapshot).unwrap(), 1);

        assert_eq!(finish(&second, &id).await, Status::Aborted);
        let interrupts = second.interrupts().repository().clone();
        eventually(|| {
            interrupts
                .get(interrupt_id)
                .map(|i| i.state == crate::interrupt::InterruptState::Processed)
                .unwrap_or(false)
        })
        .await;
        second_executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_recover_reschedules_intervention_timeout() {
        let plan = || {
            Plan::new("parked", "deploy").with_node(
                sync_node("deploy", "FLAKY")
                    .with_adviser("MANUAL_INTERVENTION", json!({ "timeout_secs": 1 })),
            )
        };
        let (first, first_executor, id) =
            start(builder().step("FLAKY", FlakyStep::new(5)), plan());
        eventually(|| status_of(&first, &id, "deploy") == Some(Status::InterventionWaiting)).await;
        let snapshot = first.snapshot(&id).unwrap();
        first_executor.shutdown().await;

        let second = builder().step("FLAKY", FlakyStep::new(5)).build().unwrap();
        let second_executor = spawn_executor(Arc::clone(&second)).unwrap();
        second.register_plan(plan()).unwrap();
        assert_eq!(second.recover(snapshot).unwrap(), 1);

        assert_eq!(finish(&second, &id).await, Status::Expired);
        let deploy = latest(&second, &id, "deploy").unwrap();
        assert_eq!(deploy.interrupt_history[0].interrupt_type, InterruptType::MarkExpired);
        second_executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_purge_after_retention() {
        let config = EngineConfig {
            node_ttl_secs: 0,
            ..test_config()
        };
        let plan = Plan::new("short", "a")
            .with_node(sync_node("a", "NOOP").with_adviser("ON_SUCCESS", next("b")))
            .with_node(sync_node("b", "NOOP"));
        let (engine, executor, id) = start(EngineBuilder::new(config), plan);

        assert_eq!(finish(&engine, &id).await, Status::Succeeded);
        assert!(engine.plan_executions().get(&id).unwrap().valid_until.is_some());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(engine.purge_expired(), 2);
        assert!(engine.node_executions().find_by_plan_execution(&id).is_empty());
        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_second_executor_rejected() {
        let engine = builder().build().unwrap();
        let executor = spawn_executor(Arc::clone(&engine)).unwrap();
        assert!(matches!(
            spawn_executor(Arc::clone(&engine)),
            Err(EngineError::ExecutorAlreadyRunning)
        ));
        executor.shutdown().await;
    }

    #[test]
    fn test_build_requires_runtime() {
        assert!(matches!(
            EngineBuilder::new(test_config()).build(),
            Err(EngineError::NoRuntime(_))
        ));
    }
}
