//! The seam between the broker and service-specific modules.
//!
//! A module contributes services to the catalog. Each service carries the
//! [`ServiceManager`] that implements its provisioning and binding logic;
//! the broker only ever talks to modules through these traits.

pub mod catalog;
pub mod workflow;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{Binding, Instance, Parameters, ValidationError};

pub use catalog::{
    Catalog, CatalogError, Plan, PlanMetadata, PlanSchemas, Service, ServiceMetadata,
};
pub use workflow::{
    Deprovisioner, Provisioner, Step, Updater, Workflow, WorkflowError, WorkflowKind,
};

/// Credentials handed to a consumer; the shape is owned by the module
pub type Credentials = Value;

/// Failure inside service-specific logic
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Service-specific lifecycle logic
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Steps to provision an instance of `plan`
    fn get_provisioner(&self, plan: &Plan) -> Result<Provisioner, ModuleError>;

    /// Steps to update an instance of `plan`
    fn get_updater(&self, plan: &Plan) -> Result<Updater, ModuleError>;

    /// Steps to deprovision an instance of `plan`
    fn get_deprovisioner(&self, plan: &Plan) -> Result<Deprovisioner, ModuleError>;

    /// Service-specific checks on `instance.updating_parameters`, run after
    /// schema validation passed
    fn validate_updating_parameters(&self, instance: &Instance) -> Result<(), ValidationError>;

    /// Bind synchronously, returning binding details
    async fn bind(&self, instance: &Instance, params: &Parameters) -> Result<Value, ModuleError>;

    /// Unbind synchronously
    async fn unbind(&self, instance: &Instance, binding: &Binding) -> Result<(), ModuleError>;

    /// Credentials derived from instance and binding details
    fn get_credentials(
        &self,
        instance: &Instance,
        binding: &Binding,
    ) -> Result<Credentials, ModuleError>;

    /// Template used when decoding persisted instance details
    fn get_empty_instance_details(&self) -> Value {
        Value::Object(Default::default())
    }

    /// Template used when decoding persisted binding details
    fn get_empty_binding_details(&self) -> Value {
        Value::Object(Default::default())
    }
}

/// A pluggable module contributing services to the catalog
pub trait Module: Send + Sync {
    /// Short name, used in logs and configuration
    fn name(&self) -> &str;

    /// Services (with plans) offered by this module
    fn services(&self) -> Result<Vec<Service>, CatalogError>;
}

/// Collect the services of every module into a catalog
pub fn catalog_from_modules(modules: &[Arc<dyn Module>]) -> Result<Catalog, CatalogError> {
    let mut services = Vec::new();
    for module in modules {
        let offered = module.services()?;
        tracing::debug!(module = module.name(), services = offered.len(), "Loaded module");
        services.extend(offered);
    }
    Catalog::new(services)
}
