//! Resume Executor
//!
//! Drains the engine job channel and runs each job on tokio's blocking pool,
//! bounded by a semaphore of `workers` permits.
//!
//! A job that returns an error or panics is routed to
//! [`Engine::handle_error`](crate::execution::Engine::handle_error) for the
//! node it targeted; the worker loop itself never dies with a job.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::execution::{Engine, EngineError};
use crate::interrupt::Interrupt;

use super::{ErrorResponse, ResponseMap};

/// Unit of work for the executor.
#[derive(Debug)]
pub enum EngineJob {
    StartNode {
        node_execution_id: Uuid,
    },
    Resume {
        node_execution_id: Uuid,
        responses: ResponseMap,
        async_error: Option<ErrorResponse>,
    },
    /// Fail a node that never got to run
    Fail {
        node_execution_id: Uuid,
        error: ErrorResponse,
    },
    RegisterInterrupt(Box<Interrupt>),
    ApplyInterrupt(Uuid),
    Timeout(Uuid),
}

impl EngineJob {
    /// Node whose execution should absorb a failure of this job.
    pub fn target_node(&self) -> Option<Uuid> {
        match self {
            EngineJob::StartNode { node_execution_id }
            | EngineJob::Resume {
                node_execution_id, ..
            }
            | EngineJob::Fail {
                node_execution_id, ..
            } => Some(*node_execution_id),
            EngineJob::RegisterInterrupt(_)
            | EngineJob::ApplyInterrupt(_)
            | EngineJob::Timeout(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EngineJob::StartNode { .. } => "start",
            EngineJob::Resume { .. } => "resume",
            EngineJob::Fail { .. } => "fail",
            EngineJob::RegisterInterrupt(_) => "register-interrupt",
            EngineJob::ApplyInterrupt(_) => "apply-interrupt",
            EngineJob::Timeout(_) => "timeout",
        }
    }
}

/// Sending half of the engine job channel.
#[derive(Clone, Debug)]
pub struct JobSender {
    tx: UnboundedSender<EngineJob>,
}

impl JobSender {
    /// Queues a job. Returns false once the executor has shut down.
    pub fn send(&self, job: EngineJob) -> bool {
        let name = job.name();
        match self.tx.send(job) {
            Ok(()) => true,
            Err(_) => {
                warn!("Executor is shut down, dropping '{}' job", name);
                false
            }
        }
    }
}

pub fn job_channel() -> (JobSender, UnboundedReceiver<EngineJob>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (JobSender { tx }, rx)
}

/// Handle to a running executor.
pub struct ExecutorHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ExecutorHandle {
    /// Stops accepting jobs and waits for in-flight ones to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!("Executor task ended abnormally: {}", e);
        }
    }
}

/// Starts the worker loop for `engine`.
///
/// Must be called from within a tokio runtime, once per engine.
pub fn spawn_executor(engine: Arc<Engine>) -> Result<ExecutorHandle, EngineError> {
    let receiver = engine
        .take_job_receiver()
        .ok_or(EngineError::ExecutorAlreadyRunning)?;
    let workers = engine.config().workers.max(1);
    let shutdown = CancellationToken::new();

    info!("Starting executor with {} worker(s)", workers);
    let task = tokio::spawn(run_loop(engine, receiver, workers, shutdown.clone()));

    Ok(ExecutorHandle { shutdown, task })
}

async fn run_loop(
    engine: Arc<Engine>,
    mut receiver: UnboundedReceiver<EngineJob>,
    workers: usize,
    shutdown: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(workers));

    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let _permit = permit;
            run_job(engine, job).await;
        });
    }

    // Drain in-flight jobs before reporting shutdown.
    let permits = u32::try_from(workers).unwrap_or(u32::MAX);
    if semaphore.acquire_many(permits).await.is_ok() {
        debug!("All in-flight jobs finished");
    }
    info!("Executor stopped");
}

async fn run_job(engine: Arc<Engine>, job: EngineJob) {
    let name = job.name();
    let target = job.target_node();

    let worker = Arc::clone(&engine);
    let outcome = tokio::task::spawn_blocking(move || worker.run_job(job)).await;

    let message = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => format!("{} job failed: {}", name, e),
        Err(join_error) if join_error.is_panic() => format!("{} job panicked", name),
        Err(join_error) => format!("{} job cancelled: {}", name, join_error),
    };
    error!("{}", message);

    let Some(node_execution_id) = target else {
        return;
    };
    let recovered =
        tokio::task::spawn_blocking(move || engine.handle_error_for(node_execution_id, &message))
            .await;
    if recovered.is_err() {
        error!(
            "Error handling for node execution '{}' panicked",
            node_execution_id
        );
    }
}
