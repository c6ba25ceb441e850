//! Immutable registry of offered services and plans.
//!
//! Built once at startup from every enabled module, then shared read-only
//! across request handlers and the async engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use super::ServiceManager;
use crate::domain::InputParametersSchema;

/// Errors raised while assembling the catalog
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("duplicate service id: {0}")]
    DuplicateService(String),

    #[error("duplicate plan id {plan_id} in service {service_id}")]
    DuplicatePlan { service_id: String, plan_id: String },

    #[error("service {0} must offer at least one plan")]
    NoPlans(String),
}

/// Display metadata for a service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetadata {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub long_description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub documentation_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub support_url: String,
}

/// Display metadata for a plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bullets: Vec<String>,
}

/// Parameter schemas for each operation on a plan
#[derive(Debug, Clone, Default)]
pub struct PlanSchemas {
    pub provisioning: Arc<InputParametersSchema>,
    pub updating: Arc<InputParametersSchema>,
    pub binding: Arc<InputParametersSchema>,
}

impl PlanSchemas {
    pub fn new(
        provisioning: InputParametersSchema,
        updating: InputParametersSchema,
        binding: InputParametersSchema,
    ) -> Self {
        Self {
            provisioning: Arc::new(provisioning),
            updating: Arc::new(updating),
            binding: Arc::new(binding),
        }
    }
}

/// A variant of a service
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub free: bool,
    pub metadata: PlanMetadata,
    pub schemas: PlanSchemas,
}

impl Plan {
    pub fn schemas(&self) -> &PlanSchemas {
        &self.schemas
    }

    fn to_api(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "free": self.free,
            "metadata": self.metadata,
            "schemas": {
                "service_instance": {
                    "create": { "parameters": self.schemas.provisioning.to_json_schema() },
                    "update": { "parameters": self.schemas.updating.to_json_schema() },
                },
                "service_binding": {
                    "create": { "parameters": self.schemas.binding.to_json_schema() },
                },
            },
        })
    }
}

// Plans are identified by id; schemas are not comparable.
impl PartialEq for Plan {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Descriptive properties of a service
#[derive(Debug, Clone, Default)]
pub struct ServiceProperties {
    pub id: String,
    pub name: String,
    pub description: String,
    pub metadata: ServiceMetadata,
    pub bindable: bool,
    pub plan_updatable: bool,
    pub tags: Vec<String>,
}

/// An offered service, its plans, and the manager that implements it
#[derive(Clone)]
pub struct Service {
    pub properties: ServiceProperties,
    manager: Arc<dyn ServiceManager>,
    plans: Vec<Arc<Plan>>,
    plan_index: HashMap<String, Arc<Plan>>,
}

impl Service {
    pub fn new(
        properties: ServiceProperties,
        manager: Arc<dyn ServiceManager>,
        plans: Vec<Plan>,
    ) -> Result<Self, CatalogError> {
        if plans.is_empty() {
            return Err(CatalogError::NoPlans(properties.id.clone()));
        }

        let mut plan_index = HashMap::with_capacity(plans.len());
        let mut ordered = Vec::with_capacity(plans.len());
        for plan in plans {
            let plan = Arc::new(plan);
            if plan_index.insert(plan.id.clone(), plan.clone()).is_some() {
                return Err(CatalogError::DuplicatePlan {
                    service_id: properties.id.clone(),
                    plan_id: plan.id.clone(),
                });
            }
            ordered.push(plan);
        }

        Ok(Self {
            properties,
            manager,
            plans: ordered,
            plan_index,
        })
    }

    pub fn id(&self) -> &str {
        &self.properties.id
    }

    pub fn name(&self) -> &str {
        &self.properties.name
    }

    pub fn is_bindable(&self) -> bool {
        self.properties.bindable
    }

    pub fn is_plan_updatable(&self) -> bool {
        self.properties.plan_updatable
    }

    pub fn get_plan(&self, plan_id: &str) -> Option<Arc<Plan>> {
        self.plan_index.get(plan_id).cloned()
    }

    pub fn plans(&self) -> &[Arc<Plan>] {
        &self.plans
    }

    pub fn service_manager(&self) -> &Arc<dyn ServiceManager> {
        &self.manager
    }

    fn to_api(&self) -> Value {
        let plans: Vec<Value> = self.plans.iter().map(|p| p.to_api()).collect();
        json!({
            "id": self.properties.id,
            "name": self.properties.name,
            "description": self.properties.description,
            "bindable": self.properties.bindable,
            "plan_updateable": self.properties.plan_updatable,
            "tags": self.properties.tags,
            "metadata": self.properties.metadata,
            "plans": plans,
        })
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.properties.id)
            .field("name", &self.properties.name)
            .field("plans", &self.plans.len())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.properties.id == other.properties.id
    }
}

/// Immutable set of services, indexed by id
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    services: Vec<Arc<Service>>,
    index: HashMap<String, Arc<Service>>,
}

impl Catalog {
    /// Build a catalog, rejecting duplicate service ids
    pub fn new(services: Vec<Service>) -> Result<Self, CatalogError> {
        let mut index = HashMap::with_capacity(services.len());
        let mut ordered = Vec::with_capacity(services.len());
        for service in services {
            let service = Arc::new(service);
            if index
                .insert(service.id().to_string(), service.clone())
                .is_some()
            {
                return Err(CatalogError::DuplicateService(service.id().to_string()));
            }
            ordered.push(service);
        }
        Ok(Self {
            services: ordered,
            index,
        })
    }

    /// An empty catalog
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get_service(&self, service_id: &str) -> Option<Arc<Service>> {
        self.index.get(service_id).cloned()
    }

    /// Resolve a service and one of its plans in one go
    pub fn resolve(&self, service_id: &str, plan_id: &str) -> Option<(Arc<Service>, Arc<Plan>)> {
        let service = self.get_service(service_id)?;
        let plan = service.get_plan(plan_id)?;
        Some((service, plan))
    }

    pub fn services(&self) -> &[Arc<Service>] {
        &self.services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Render the `GET /v2/catalog` response body
    pub fn to_api(&self) -> Value {
        let services: Vec<Value> = self.services.iter().map(|s| s.to_api()).collect();
        json!({ "services": services })
    }
}
