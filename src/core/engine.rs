//! Asynchronous execution of instance workflows.
//!
//! Lifecycle handlers submit a [`Task`] and return immediately. The engine
//! loads the instance, resolves its workflow from the owning module, runs the
//! steps in order and records the terminal status.
//!
//! Shutdown never leaves an instance in an in-progress status: tasks cut
//! off between steps, and tasks still queued, are recorded as failed so a
//! later deprovision is accepted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::FatalSignal;
use crate::domain::{Instance, InstanceStatus};
use crate::service::{ModuleError, Workflow, WorkflowKind};
use crate::storage::Store;

const EVENT_CAPACITY: usize = 256;

/// Errors from submitting to or running the engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task queue is full, rejected task for instance {0}")]
    QueueFull(String),

    #[error("engine is not accepting tasks")]
    Stopped,

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine task panicked: {0}")]
    Panicked(String),
}

/// A unit of asynchronous work against one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub instance_id: String,
    pub kind: WorkflowKind,
    /// Step to resume from; the first step when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_step: Option<String>,
}

impl Task {
    pub fn new(instance_id: impl Into<String>, kind: WorkflowKind) -> Self {
        Self {
            instance_id: instance_id.into(),
            kind,
            start_step: None,
        }
    }

    pub fn provision(instance_id: impl Into<String>) -> Self {
        Self::new(instance_id, WorkflowKind::Provision)
    }

    pub fn update(instance_id: impl Into<String>) -> Self {
        Self::new(instance_id, WorkflowKind::Update)
    }

    pub fn deprovision(instance_id: impl Into<String>) -> Self {
        Self::new(instance_id, WorkflowKind::Deprovision)
    }

    pub fn starting_at(mut self, step: impl Into<String>) -> Self {
        self.start_step = Some(step.into());
        self
    }
}

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    /// A failure status was recorded with this reason
    Failed { reason: String },
    /// Stopped by shutdown before `step`, or before starting when unset.
    /// A failure status was recorded and the details gathered so far kept.
    Interrupted { step: Option<String> },
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
            Self::Interrupted { step: Some(step) } => write!(f, "interrupted before {}", step),
            Self::Interrupted { step: None } => write!(f, "interrupted before starting"),
        }
    }
}

/// Broadcast when a task finishes, one way or another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub task: Task,
    pub outcome: TaskOutcome,
}

/// Narrow interface to the workflow engine
#[async_trait]
pub trait AsyncEngine: Send + Sync {
    /// Queue a task without waiting for it to run
    fn submit(&self, task: Task) -> Result<(), EngineError>;

    /// Observe task completions
    fn subscribe(&self) -> broadcast::Receiver<TaskEvent>;

    /// Process tasks until `cancel` fires, then drain in-flight work
    async fn run(&self, cancel: CancellationToken) -> Result<(), EngineError>;
}

/// Runs tasks inside the current process
pub struct LocalEngine {
    worker: Arc<Worker>,
    sender: mpsc::Sender<Task>,
    receiver: Mutex<Option<mpsc::Receiver<Task>>>,
    drain_timeout: Duration,
}

impl LocalEngine {
    pub fn new(
        store: Arc<dyn Store>,
        fatal: FatalSignal,
        queue_capacity: usize,
        drain_timeout: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            worker: Arc::new(Worker {
                store,
                fatal,
                events,
            }),
            sender,
            receiver: Mutex::new(Some(receiver)),
            drain_timeout,
        }
    }
}

#[async_trait]
impl AsyncEngine for LocalEngine {
    fn submit(&self, task: Task) -> Result<(), EngineError> {
        debug!(instance_id = %task.instance_id, kind = %task.kind, "Submitting task");
        self.sender.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(task) => EngineError::QueueFull(task.instance_id),
            mpsc::error::TrySendError::Closed(_) => EngineError::Stopped,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.worker.events.subscribe()
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), EngineError> {
        let mut receiver = self
            .receiver
            .lock()
            .take()
            .ok_or(EngineError::AlreadyRunning)?;
        let mut in_flight = JoinSet::new();

        info!("Async engine started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(task) => {
                        let worker = self.worker.clone();
                        in_flight.spawn(worker.execute(task, cancel.child_token()));
                    }
                    None => break,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Task panicked or was aborted");
                    }
                }
            }
        }

        receiver.close();
        let mut abandoned = 0usize;
        while let Ok(task) = receiver.try_recv() {
            abandoned += 1;
            in_flight.spawn(self.worker.clone().abandon(task));
        }
        info!(
            in_flight = in_flight.len(),
            abandoned, "Async engine stopping, draining tasks"
        );

        let drain = async {
            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Task panicked or was aborted");
                }
            }
        };
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            warn!(
                remaining = in_flight.len(),
                "Drain window elapsed, aborting remaining tasks"
            );
            in_flight.abort_all();
        }

        info!("Async engine stopped");
        Ok(())
    }
}

struct Worker {
    store: Arc<dyn Store>,
    fatal: FatalSignal,
    events: broadcast::Sender<TaskEvent>,
}

impl Worker {
    #[instrument(skip(self, cancel), fields(instance_id = %task.instance_id, kind = %task.kind))]
    async fn execute(self: Arc<Self>, task: Task, cancel: CancellationToken) {
        let outcome = self.run_task(&task, cancel).await;
        match &outcome {
            TaskOutcome::Succeeded => info!("Task succeeded"),
            TaskOutcome::Failed { reason } => warn!(reason = %reason, "Task failed"),
            TaskOutcome::Interrupted { step } => info!(step = ?step, "Task interrupted"),
        }
        // No subscribers is fine
        let _ = self.events.send(TaskEvent { task, outcome });
    }

    /// Settle a task that was still queued at shutdown
    #[instrument(skip(self), fields(instance_id = %task.instance_id, kind = %task.kind))]
    async fn abandon(self: Arc<Self>, task: Task) {
        match self.store.get_instance(&task.instance_id).await {
            Ok(Some(instance)) if instance.status.is_in_progress() => {
                let reason = format!("{} was not started before shutdown", task.kind);
                self.record_failure(&task, instance, reason).await;
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Cannot load instance of abandoned task"),
        }
        info!("Queued task abandoned at shutdown");
        let _ = self.events.send(TaskEvent {
            task,
            outcome: TaskOutcome::Interrupted { step: None },
        });
    }

    async fn run_task(&self, task: &Task, cancel: CancellationToken) -> TaskOutcome {
        let mut instance = match self.store.get_instance(&task.instance_id).await {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                return TaskOutcome::Failed {
                    reason: "instance no longer exists".to_string(),
                }
            }
            Err(e) => {
                error!(error = %e, "Cannot load instance for task");
                return TaskOutcome::Failed {
                    reason: format!("cannot load instance: {}", e),
                };
            }
        };

        let workflow = match workflow_for(task.kind, &instance) {
            Ok(workflow) => workflow,
            Err(e) => return self.record_failure(task, instance, e.to_string()).await,
        };
        let steps = match workflow.steps_from(task.start_step.as_deref()) {
            Ok(steps) => steps,
            Err(e) => return self.record_failure(task, instance, e.to_string()).await,
        };

        for step in steps {
            if cancel.is_cancelled() {
                let reason = format!("interrupted by shutdown before step {}", step.name());
                self.record_failure(task, instance, reason).await;
                return TaskOutcome::Interrupted {
                    step: Some(step.name().to_string()),
                };
            }

            debug!(step = step.name(), "Running step");
            match step.execute(cancel.clone(), instance.clone()).await {
                Ok(details) => {
                    instance.details = details;
                    if let Err(e) = self.store.write_instance(&instance).await {
                        self.fatal.trip(format!(
                            "cannot persist details of instance {} after step {}: {}",
                            instance.instance_id,
                            step.name(),
                            e
                        ));
                        return TaskOutcome::Failed {
                            reason: e.to_string(),
                        };
                    }
                }
                Err(e) => {
                    let reason = format!("{}: {:#}", step.name(), e);
                    return self.record_failure(task, instance, reason).await;
                }
            }
        }

        self.record_success(task, instance).await
    }

    async fn record_success(&self, task: &Task, mut instance: Instance) -> TaskOutcome {
        let persisted = match task.kind {
            WorkflowKind::Deprovision => self
                .store
                .delete_instance(&instance.instance_id)
                .await
                .map(|_| ()),
            WorkflowKind::Provision | WorkflowKind::Update => {
                instance.status = InstanceStatus::Provisioned;
                instance.status_reason.clear();
                self.store.write_instance(&instance).await
            }
        };

        match persisted {
            Ok(()) => TaskOutcome::Succeeded,
            Err(e) => {
                self.fatal.trip(format!(
                    "cannot record completed {} of instance {}: {}",
                    task.kind, instance.instance_id, e
                ));
                TaskOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn record_failure(&self, task: &Task, mut instance: Instance, reason: String) -> TaskOutcome {
        instance.status = failed_status(task.kind);
        instance.status_reason = reason.clone();

        if let Err(e) = self.store.write_instance(&instance).await {
            self.fatal.trip(format!(
                "cannot record failed {} of instance {} ({}): {}",
                task.kind, instance.instance_id, reason, e
            ));
        }
        TaskOutcome::Failed { reason }
    }
}

fn workflow_for(kind: WorkflowKind, instance: &Instance) -> Result<Workflow, ModuleError> {
    let (service, plan) = match (&instance.service, &instance.plan) {
        (Some(service), Some(plan)) => (service, plan),
        _ => {
            return Err(ModuleError::Failed(
                "instance is not resolved against the catalog".to_string(),
            ))
        }
    };
    let manager = service.service_manager();
    match kind {
        WorkflowKind::Provision => manager.get_provisioner(plan),
        WorkflowKind::Update => manager.get_updater(plan),
        WorkflowKind::Deprovision => manager.get_deprovisioner(plan),
    }
}

/// Status recorded when a workflow of `kind` fails
pub fn failed_status(kind: WorkflowKind) -> InstanceStatus {
    match kind {
        WorkflowKind::Provision => InstanceStatus::ProvisioningFailed,
        WorkflowKind::Update => InstanceStatus::UpdatingFailed,
        WorkflowKind::Deprovision => InstanceStatus::DeprovisioningFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_builders() {
        let task = Task::update("i-1").starting_at("resize");
        assert_eq!(task.kind, WorkflowKind::Update);
        assert_eq!(task.start_step.as_deref(), Some("resize"));
        assert_eq!(failed_status(task.kind), InstanceStatus::UpdatingFailed);
    }

    #[test]
    fn test_submit_before_run_queues_until_full() {
        let store: Arc<dyn Store> = Arc::new(crate::storage::MemoryStore::new(
            crate::storage::RecordCodec::new(
                Arc::new(crate::crypto::NoopCodec::new()),
                Arc::new(crate::service::Catalog::empty()),
            ),
        ));
        let engine = LocalEngine::new(store, FatalSignal::new(), 1, Duration::from_secs(1));

        engine.submit(Task::provision("a")).unwrap();
        let err = engine.submit(Task::provision("b")).unwrap_err();
        assert!(matches!(err, EngineError::QueueFull(id) if id == "b"));
    }
}
