//! Step-based workflows for asynchronous instance operations.
//!
//! A workflow is an ordered list of uniquely named steps. Provisioners,
//! updaters and deprovisioners are all workflows; they differ only in the
//! operation they drive. The async engine runs the steps strictly in order;
//! a failing step halts the sequence and names itself so a retry can resume
//! from it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::Instance;

/// Errors from building or resuming a workflow
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("workflow must have at least one step")]
    Empty,

    #[error("step '{0}' is declared more than once")]
    DuplicateStep(String),

    #[error("step at position {0} has an empty name")]
    EmptyStepName(usize),

    #[error("workflow has no step named '{0}'")]
    UnknownStep(String),
}

/// Which operation a workflow drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Provision,
    Update,
    Deprovision,
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provision => write!(f, "provision"),
            Self::Update => write!(f, "update"),
            Self::Deprovision => write!(f, "deprovision"),
        }
    }
}

type StepFn =
    Arc<dyn Fn(CancellationToken, Instance) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// A single named unit of work.
///
/// Receives the current instance and returns its updated details. Steps must
/// be safe to run again after a restart.
#[derive(Clone)]
pub struct Step {
    name: String,
    run: StepFn,
}

impl Step {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CancellationToken, Instance) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move |cancel, instance| Box::pin(f(cancel, instance))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the step against an instance
    pub async fn execute(
        &self,
        cancel: CancellationToken,
        instance: Instance,
    ) -> anyhow::Result<Value> {
        (self.run)(cancel, instance).await
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish()
    }
}

/// An ordered sequence of steps
#[derive(Debug, Clone)]
pub struct Workflow {
    kind: WorkflowKind,
    steps: Vec<Step>,
}

/// Workflow that provisions an instance
pub type Provisioner = Workflow;
/// Workflow that updates an instance
pub type Updater = Workflow;
/// Workflow that deprovisions an instance
pub type Deprovisioner = Workflow;

impl Workflow {
    /// Build a workflow, rejecting empty or duplicate step names
    pub fn new(kind: WorkflowKind, steps: Vec<Step>) -> Result<Self, WorkflowError> {
        if steps.is_empty() {
            return Err(WorkflowError::Empty);
        }
        for (i, step) in steps.iter().enumerate() {
            if step.name.is_empty() {
                return Err(WorkflowError::EmptyStepName(i));
            }
            if steps[..i].iter().any(|s| s.name == step.name) {
                return Err(WorkflowError::DuplicateStep(step.name.clone()));
            }
        }
        Ok(Self { kind, steps })
    }

    pub fn provisioner(steps: Vec<Step>) -> Result<Provisioner, WorkflowError> {
        Self::new(WorkflowKind::Provision, steps)
    }

    pub fn updater(steps: Vec<Step>) -> Result<Updater, WorkflowError> {
        Self::new(WorkflowKind::Update, steps)
    }

    pub fn deprovisioner(steps: Vec<Step>) -> Result<Deprovisioner, WorkflowError> {
        Self::new(WorkflowKind::Deprovision, steps)
    }

    pub fn kind(&self) -> WorkflowKind {
        self.kind
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Steps from `start` (inclusive) to the end; all steps when `start` is `None`
    pub fn steps_from(&self, start: Option<&str>) -> Result<&[Step], WorkflowError> {
        match start {
            None => Ok(&self.steps),
            Some(name) => {
                let idx = self
                    .step_index(name)
                    .ok_or_else(|| WorkflowError::UnknownStep(name.to_string()))?;
                Ok(&self.steps[idx..])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recording_step(name: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Step {
        Step::new(name, move |_cancel, instance: Instance| {
            let log = log.clone();
            async move {
                log.lock().push(name);
                let mut details = instance.details.clone();
                details[name] = json!(true);
                Ok(details)
            }
        })
    }

    #[test]
    fn test_rejects_empty_and_duplicates() {
        assert_eq!(Workflow::provisioner(vec![]).unwrap_err(), WorkflowError::Empty);

        let log = Arc::new(Mutex::new(Vec::new()));
        let err = Workflow::provisioner(vec![
            recording_step("a", log.clone()),
            recording_step("a", log),
        ])
        .unwrap_err();
        assert_eq!(err, WorkflowError::DuplicateStep("a".to_string()));
    }

    #[test]
    fn test_step_navigation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let wf = Workflow::updater(vec![
            recording_step("first", log.clone()),
            recording_step("second", log),
        ])
        .unwrap();

        assert_eq!(wf.kind(), WorkflowKind::Update);
        assert_eq!(wf.step_names(), vec!["first", "second"]);
        assert_eq!(wf.step_index("second"), Some(1));
        assert_eq!(wf.step_index("third"), None);
    }

    #[test]
    fn test_steps_from_named_step() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let wf = Workflow::deprovisioner(vec![
            recording_step("one", log.clone()),
            recording_step("two", log),
        ])
        .unwrap();

        assert_eq!(wf.steps_from(None).unwrap().len(), 2);
        let rest = wf.steps_from(Some("two")).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name(), "two");

        assert_eq!(
            wf.steps_from(Some("nope")).unwrap_err(),
            WorkflowError::UnknownStep("nope".to_string())
        );
    }

    #[tokio::test]
    async fn test_step_receives_instance_and_returns_details() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let step = recording_step("one", log.clone());

        let instance = Instance::new("i", "s", "p").with_details(json!({ "kept": 1 }));
        let details = step.execute(CancellationToken::new(), instance).await.unwrap();

        assert_eq!(*log.lock(), vec!["one"]);
        assert_eq!(details, json!({ "kept": 1, "one": true }));
    }

    #[tokio::test]
    async fn test_failing_step_reports_error() {
        let step = Step::new("boom", |_c, _i| async {
            Err::<Value, _>(anyhow::anyhow!("quota exceeded"))
        });
        let err = step
            .execute(CancellationToken::new(), Instance::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");
    }
}
