//! Instance and binding lifecycle handlers.
//!
//! Each handler resolves the target through the store, checks the request
//! against what is recorded, and only then calls into the owning module.
//! Replays of a completed request return the prior result; any other reuse
//! of an id is a conflict. Asynchronous operations persist an in-progress
//! status, hand a task to the engine and return immediately.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, error, info};

use super::engine::{AsyncEngine, EngineError, Task};
use super::FatalSignal;
use crate::domain::{
    Binding, BindingStatus, Instance, InstanceStatus, Parameters, ValidationError,
};
use crate::service::{Catalog, ModuleError, Plan, Service, Workflow};
use crate::storage::{Store, StoreError};

/// Reserved provisioning parameter naming the instance alias
pub const ALIAS_PARAMETER: &str = "alias";

/// Reserved provisioning parameter naming the parent instance alias
pub const PARENT_ALIAS_PARAMETER: &str = "parentAlias";

/// Errors returned by lifecycle handlers
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("instance {0} does not exist")]
    InstanceNotFound(String),

    #[error("unprocessable: {0}")]
    UnprocessableState(String),

    #[error("this request requires asynchronous processing")]
    AsyncRequired,

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("module error: {0}")]
    Module(#[from] ModuleError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("fatal: {0}")]
    Fatal(String),
}

/// Successful handler result
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Synchronous success or idempotent replay
    Ok(Value),
    /// A new resource was created
    Created(Value),
    /// Work was handed to the engine
    Accepted(Value),
    /// The resource does not exist
    Gone,
}

/// Body of a provisioning request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvisioningRequest {
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
}

/// Body of an update request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatingRequest {
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
}

/// Body of a binding request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BindingRequest {
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
}

/// Service and plan ids declared in a query string
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeclaredIds {
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
}

impl DeclaredIds {
    fn conflicts_with(&self, service_id: &str, plan_id: &str) -> bool {
        let differs = |declared: &Option<String>, actual: &str| {
            declared
                .as_deref()
                .is_some_and(|d| !d.is_empty() && d != actual)
        };
        differs(&self.service_id, service_id) || differs(&self.plan_id, plan_id)
    }
}

fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, LifecycleError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| LifecycleError::MalformedRequest(e.to_string()))
}

fn empty() -> Value {
    Value::Object(Map::new())
}

fn resolved(instance: &Instance) -> Result<(Arc<Service>, Arc<Plan>), LifecycleError> {
    match (&instance.service, &instance.plan) {
        (Some(service), Some(plan)) => Ok((service.clone(), plan.clone())),
        _ => Err(LifecycleError::Persistence(StoreError::Integrity(format!(
            "instance {} is not resolved against the catalog",
            instance.instance_id
        )))),
    }
}

fn first_step(workflow: &Workflow) -> Option<String> {
    workflow.step_names().first().map(|s| s.to_string())
}

/// Protocol handlers over a store, catalog and engine
#[derive(Clone)]
pub struct Lifecycle {
    catalog: Arc<Catalog>,
    store: Arc<dyn Store>,
    engine: Arc<dyn AsyncEngine>,
    fatal: FatalSignal,
}

impl Lifecycle {
    pub fn new(
        catalog: Arc<Catalog>,
        store: Arc<dyn Store>,
        engine: Arc<dyn AsyncEngine>,
        fatal: FatalSignal,
    ) -> Self {
        Self {
            catalog,
            store,
            engine,
            fatal,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// The rendered catalog
    pub fn get_catalog(&self) -> Outcome {
        Outcome::Ok(self.catalog.to_api())
    }

    /// Provision a new instance
    pub async fn provision(
        &self,
        instance_id: &str,
        accepts_incomplete: bool,
        body: &[u8],
    ) -> Result<Outcome, LifecycleError> {
        if !accepts_incomplete {
            return Err(LifecycleError::AsyncRequired);
        }
        let request: ProvisioningRequest = parse_body(body)?;

        let service = self.catalog.get_service(&request.service_id).ok_or_else(|| {
            LifecycleError::BadRequest(format!("unknown service {}", request.service_id))
        })?;
        let plan = service.get_plan(&request.plan_id).ok_or_else(|| {
            LifecycleError::BadRequest(format!(
                "unknown plan {} for service {}",
                request.plan_id, request.service_id
            ))
        })?;

        let schema = plan.schemas().provisioning.clone();
        let data = request.parameters.unwrap_or_default();
        schema.validate(&data)?;
        let params = Parameters::new(Some(schema.clone()), data);

        if let Some(existing) = self.store.get_instance(instance_id).await? {
            let same_inputs = existing.service_id == request.service_id
                && existing.plan_id == request.plan_id
                && existing.provisioning_parameters == params;
            if same_inputs && existing.status == InstanceStatus::Provisioned {
                debug!(instance_id, "Provisioning replay of a provisioned instance");
                return Ok(Outcome::Ok(empty()));
            }
            return Err(LifecycleError::Conflict(format!(
                "instance {} already exists with status {}",
                instance_id, existing.status
            )));
        }

        let mut instance = Instance::new(instance_id, service.id(), plan.id.as_str())
            .with_provisioning_parameters(params.clone())
            .with_details(service.service_manager().get_empty_instance_details());
        if schema.declares(ALIAS_PARAMETER) {
            instance.alias = params.get_string(ALIAS_PARAMETER).filter(|a| !a.is_empty());
        }
        if schema.declares(PARENT_ALIAS_PARAMETER) {
            instance.parent_alias = params
                .get_string(PARENT_ALIAS_PARAMETER)
                .filter(|a| !a.is_empty());
        }

        if let Some(alias) = &instance.alias {
            if let Some(holder) = self.store.get_instance_by_alias(alias).await? {
                if holder.instance_id != instance_id {
                    return Err(LifecycleError::Conflict(format!(
                        "alias {} is held by instance {}",
                        alias, holder.instance_id
                    )));
                }
            }
        }

        instance.service = Some(service.clone());
        instance.plan = Some(plan.clone());
        self.store.write_instance(&instance).await?;

        let submitted = service
            .service_manager()
            .get_provisioner(&plan)
            .map_err(LifecycleError::from)
            .and_then(|workflow| self.submit(Task::provision(instance_id), &workflow));
        if let Err(e) = submitted {
            return Err(self
                .record_instance_failure(instance, InstanceStatus::ProvisioningFailed, e)
                .await);
        }

        info!(instance_id, service_id = service.id(), plan_id = %plan.id, "Provisioning accepted");
        Ok(Outcome::Accepted(json!({ "operation": "provisioning" })))
    }

    /// Update an existing instance
    pub async fn update(
        &self,
        instance_id: &str,
        accepts_incomplete: bool,
        body: &[u8],
    ) -> Result<Outcome, LifecycleError> {
        if !accepts_incomplete {
            return Err(LifecycleError::AsyncRequired);
        }
        let request: UpdatingRequest = parse_body(body)?;

        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| LifecycleError::InstanceNotFound(instance_id.to_string()))?;
        let (service, current_plan) = resolved(&instance)?;

        if !request.service_id.is_empty() && request.service_id != instance.service_id {
            return Err(LifecycleError::Conflict(format!(
                "instance {} belongs to service {}",
                instance_id, instance.service_id
            )));
        }
        if instance.status != InstanceStatus::Provisioned {
            return Err(LifecycleError::UnprocessableState(format!(
                "instance {} is {}",
                instance_id, instance.status
            )));
        }

        let plan = if request.plan_id.is_empty() || request.plan_id == instance.plan_id {
            current_plan
        } else if !service.is_plan_updatable() {
            return Err(LifecycleError::BadRequest(format!(
                "service {} does not support plan changes",
                service.id()
            )));
        } else {
            service.get_plan(&request.plan_id).ok_or_else(|| {
                LifecycleError::BadRequest(format!(
                    "unknown plan {} for service {}",
                    request.plan_id,
                    service.id()
                ))
            })?
        };

        let schema = plan.schemas().updating.clone();
        let data = request.parameters.unwrap_or_default();
        schema.validate(&data)?;
        let params = Parameters::new(Some(schema), data);

        if plan.id == instance.plan_id && params == instance.updating_parameters {
            debug!(instance_id, "Update replay with unchanged plan and parameters");
            return Ok(Outcome::Ok(empty()));
        }

        let mut updated = instance.clone();
        updated.plan_id = plan.id.clone();
        updated.plan = Some(plan.clone());
        updated.updating_parameters = params;
        service
            .service_manager()
            .validate_updating_parameters(&updated)?;

        updated.status = InstanceStatus::Updating;
        updated.status_reason.clear();
        self.store.write_instance(&updated).await?;

        let submitted = service
            .service_manager()
            .get_updater(&plan)
            .map_err(LifecycleError::from)
            .and_then(|workflow| self.submit(Task::update(instance_id), &workflow));
        if let Err(e) = submitted {
            return Err(self
                .record_instance_failure(updated, InstanceStatus::UpdatingFailed, e)
                .await);
        }

        info!(instance_id, plan_id = %plan.id, "Update accepted");
        Ok(Outcome::Accepted(json!({ "operation": "updating" })))
    }

    /// Deprovision an instance
    pub async fn deprovision(
        &self,
        instance_id: &str,
        declared: &DeclaredIds,
        accepts_incomplete: bool,
    ) -> Result<Outcome, LifecycleError> {
        if !accepts_incomplete {
            return Err(LifecycleError::AsyncRequired);
        }

        let mut instance = match self.store.get_instance(instance_id).await? {
            Some(instance) => instance,
            None => return Ok(Outcome::Gone),
        };
        if declared.conflicts_with(&instance.service_id, &instance.plan_id) {
            return Err(LifecycleError::Conflict(format!(
                "declared service or plan does not match instance {}",
                instance_id
            )));
        }
        if let Some(alias) = &instance.alias {
            let children = self.store.get_instance_child_count_by_alias(alias).await?;
            if children > 0 {
                return Err(LifecycleError::Conflict(format!(
                    "instance {} still has {} dependent instances",
                    instance_id, children
                )));
            }
        }

        match instance.status {
            InstanceStatus::Deprovisioning => {
                return Ok(Outcome::Accepted(json!({ "operation": "deprovisioning" })))
            }
            InstanceStatus::Provisioning | InstanceStatus::Updating => {
                return Err(LifecycleError::UnprocessableState(format!(
                    "instance {} is {}",
                    instance_id, instance.status
                )))
            }
            _ => {}
        }

        let (service, plan) = resolved(&instance)?;
        instance.status = InstanceStatus::Deprovisioning;
        instance.status_reason.clear();
        self.store.write_instance(&instance).await?;

        let submitted = service
            .service_manager()
            .get_deprovisioner(&plan)
            .map_err(LifecycleError::from)
            .and_then(|workflow| self.submit(Task::deprovision(instance_id), &workflow));
        if let Err(e) = submitted {
            return Err(self
                .record_instance_failure(instance, InstanceStatus::DeprovisioningFailed, e)
                .await);
        }

        info!(instance_id, "Deprovisioning accepted");
        Ok(Outcome::Accepted(json!({ "operation": "deprovisioning" })))
    }

    /// Bind to an instance and return credentials
    pub async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        body: &[u8],
    ) -> Result<Outcome, LifecycleError> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| LifecycleError::InstanceNotFound(instance_id.to_string()))?;
        if instance.status != InstanceStatus::Provisioned {
            return Err(LifecycleError::UnprocessableState(format!(
                "instance {} is {}",
                instance_id, instance.status
            )));
        }

        let request: BindingRequest = parse_body(body)?;
        if (!request.service_id.is_empty() && request.service_id != instance.service_id)
            || (!request.plan_id.is_empty() && request.plan_id != instance.plan_id)
        {
            return Err(LifecycleError::Conflict(format!(
                "declared service or plan does not match instance {}",
                instance_id
            )));
        }

        let (service, plan) = resolved(&instance)?;
        let schema = plan.schemas().binding.clone();
        let data = request.parameters.unwrap_or_default();
        schema.validate(&data)?;
        let params = Parameters::new(Some(schema), data);
        let manager = service.service_manager();

        if let Some(existing) = self.store.get_binding(binding_id).await? {
            if existing.instance_id != instance_id {
                return Err(LifecycleError::Conflict(format!(
                    "binding {} belongs to instance {}",
                    binding_id, existing.instance_id
                )));
            }
            if existing.binding_parameters != params {
                return Err(LifecycleError::Conflict(format!(
                    "binding {} exists with different parameters",
                    binding_id
                )));
            }
            if existing.status != BindingStatus::Bound {
                return Err(LifecycleError::Conflict(format!(
                    "binding {} exists with status {}",
                    binding_id, existing.status
                )));
            }
            debug!(instance_id, binding_id, "Binding replay");
            let credentials = manager.get_credentials(&instance, &existing)?;
            return Ok(Outcome::Ok(json!({ "credentials": credentials })));
        }

        let mut binding = Binding::new(binding_id, instance_id, instance.service_id.as_str())
            .with_parameters(params.clone());

        let details = match manager.bind(&instance, &params).await {
            Ok(details) => details,
            Err(e) => {
                let reason = format!("binding error: module failed to bind: {}", e);
                return Err(self
                    .record_binding_failure(binding, BindingStatus::BindingFailed, reason, e.into())
                    .await);
            }
        };

        binding.details = details;
        binding.status = BindingStatus::Bound;
        if let Err(e) = self.store.write_binding(&binding).await {
            let reason = format!("binding error: cannot persist binding: {}", e);
            return Err(self
                .record_binding_failure(binding, BindingStatus::BindingFailed, reason, e.into())
                .await);
        }

        let credentials = manager.get_credentials(&instance, &binding).map_err(|e| {
            error!(instance_id, binding_id, error = %e, "Cannot extract credentials from binding");
            LifecycleError::Module(e)
        })?;

        info!(instance_id, binding_id, "Binding created");
        Ok(Outcome::Created(json!({ "credentials": credentials })))
    }

    /// Remove a binding
    pub async fn unbind(
        &self,
        instance_id: &str,
        binding_id: &str,
        declared: &DeclaredIds,
    ) -> Result<Outcome, LifecycleError> {
        let instance = match self.store.get_instance(instance_id).await? {
            Some(instance) => instance,
            None => return Ok(Outcome::Gone),
        };
        let binding = match self.store.get_binding(binding_id).await? {
            Some(binding) => binding,
            None => return Ok(Outcome::Gone),
        };
        if binding.instance_id != instance_id {
            return Err(LifecycleError::Conflict(format!(
                "binding {} belongs to instance {}",
                binding_id, binding.instance_id
            )));
        }
        if declared.conflicts_with(&instance.service_id, &instance.plan_id) {
            return Err(LifecycleError::Conflict(format!(
                "declared service or plan does not match instance {}",
                instance_id
            )));
        }

        let (service, _) = resolved(&instance)?;
        if let Err(e) = service.service_manager().unbind(&instance, &binding).await {
            let reason = format!("unbinding error: module failed to unbind: {}", e);
            return Err(self
                .record_binding_failure(binding, BindingStatus::UnbindingFailed, reason, e.into())
                .await);
        }

        if let Err(e) = self.store.delete_binding(binding_id).await {
            let reason = format!("unbinding error: cannot delete binding: {}", e);
            return Err(self
                .record_binding_failure(binding, BindingStatus::UnbindingFailed, reason, e.into())
                .await);
        }

        info!(instance_id, binding_id, "Binding removed");
        Ok(Outcome::Ok(empty()))
    }

    /// Report the state of the last asynchronous operation
    pub async fn last_operation(&self, instance_id: &str) -> Result<Outcome, LifecycleError> {
        let instance = match self.store.get_instance(instance_id).await? {
            Some(instance) => instance,
            None => return Ok(Outcome::Gone),
        };
        let state = if instance.status.is_in_progress() {
            "in progress"
        } else if instance.status.is_failed() {
            "failed"
        } else {
            "succeeded"
        };
        Ok(Outcome::Ok(json!({
            "state": state,
            "description": instance.status_reason,
        })))
    }

    fn submit(&self, task: Task, workflow: &Workflow) -> Result<(), LifecycleError> {
        let task = match first_step(workflow) {
            Some(step) => task.starting_at(step),
            None => task,
        };
        Ok(self.engine.submit(task)?)
    }

    /// Record a failed status after module logic or task submission failed.
    /// Escalates to fatal when the status itself cannot be written.
    async fn record_instance_failure(
        &self,
        mut instance: Instance,
        status: InstanceStatus,
        cause: LifecycleError,
    ) -> LifecycleError {
        instance.status = status;
        instance.status_reason = cause.to_string();

        if let Err(e) = self.store.write_instance(&instance).await {
            return self.escalate(format!(
                "cannot record status {} of instance {} ({}): {}",
                status, instance.instance_id, instance.status_reason, e
            ));
        }
        error!(
            instance_id = %instance.instance_id,
            %status,
            error = %cause,
            "Instance operation failed"
        );
        cause
    }

    async fn record_binding_failure(
        &self,
        mut binding: Binding,
        status: BindingStatus,
        reason: String,
        cause: LifecycleError,
    ) -> LifecycleError {
        binding.status = status;
        binding.status_reason = reason;

        if let Err(e) = self.store.write_binding(&binding).await {
            return self.escalate(format!(
                "cannot record status {} of binding {} ({}): {}",
                status, binding.binding_id, binding.status_reason, e
            ));
        }
        error!(
            instance_id = %binding.instance_id,
            binding_id = %binding.binding_id,
            %status,
            reason = %binding.status_reason,
            "Binding operation failed"
        );
        cause
    }

    fn escalate(&self, reason: String) -> LifecycleError {
        self.fatal.trip(reason.clone());
        LifecycleError::Fatal(reason)
    }
}
