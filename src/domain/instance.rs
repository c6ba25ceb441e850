//! Service instances and their lifecycle status.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::parameters::Parameters;
use crate::service::{Plan, Service};

/// Lifecycle status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    #[default]
    Provisioning,
    Provisioned,
    ProvisioningFailed,
    Updating,
    UpdatingFailed,
    Deprovisioning,
    DeprovisioningFailed,
}

impl InstanceStatus {
    /// An asynchronous operation is still running against the instance
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::Provisioning | Self::Updating | Self::Deprovisioning
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            Self::ProvisioningFailed | Self::UpdatingFailed | Self::DeprovisioningFailed
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provisioning => "PROVISIONING",
            Self::Provisioned => "PROVISIONED",
            Self::ProvisioningFailed => "PROVISIONING_FAILED",
            Self::Updating => "UPDATING",
            Self::UpdatingFailed => "UPDATING_FAILED",
            Self::Deprovisioning => "DEPROVISIONING",
            Self::DeprovisioningFailed => "DEPROVISIONING_FAILED",
        };
        f.write_str(s)
    }
}

/// A provisioned occurrence of a service plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Primary key, immutable once created
    pub instance_id: String,

    pub service_id: String,

    pub plan_id: String,

    /// Optional unique secondary key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Alias of another instance this one depends on (lookup only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_alias: Option<String>,

    pub status: InstanceStatus,

    #[serde(default)]
    pub status_reason: String,

    #[serde(default)]
    pub provisioning_parameters: Parameters,

    /// Parameters of the last accepted update
    #[serde(default)]
    pub updating_parameters: Parameters,

    /// Module-owned state; the shape is opaque to the broker
    #[serde(default)]
    pub details: Value,

    #[serde(default)]
    pub created: DateTime<Utc>,

    /// Resolved from the catalog at read time
    #[serde(skip)]
    pub service: Option<Arc<Service>>,

    /// Resolved from the catalog at read time
    #[serde(skip)]
    pub plan: Option<Arc<Plan>>,
}

impl Instance {
    /// Create a new instance record in the PROVISIONING state
    pub fn new(
        instance_id: impl Into<String>,
        service_id: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            service_id: service_id.into(),
            plan_id: plan_id.into(),
            details: Value::Object(Default::default()),
            created: Utc::now(),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_parent_alias(mut self, parent_alias: impl Into<String>) -> Self {
        self.parent_alias = Some(parent_alias.into());
        self
    }

    pub fn with_provisioning_parameters(mut self, params: Parameters) -> Self {
        self.provisioning_parameters = params;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Drop the fields derived from the catalog, leaving only what is persisted
    pub fn without_derived(mut self) -> Self {
        self.service = None;
        self.plan = None;
        self.provisioning_parameters.schema = None;
        self.updating_parameters.schema = None;
        self
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Merge stored module details over the module's empty template.
///
/// Object fields missing from the stored value keep the template's value.
pub fn merge_details(template: Value, stored: Value) -> Value {
    match (template, stored) {
        (template, Value::Null) => template,
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                base.insert(key, value);
            }
            Value::Object(base)
        }
        (_, stored) => stored,
    }
}
