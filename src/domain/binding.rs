//! Bindings between an instance and a consumer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::parameters::Parameters;

/// Status of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingStatus {
    #[default]
    Bound,
    BindingFailed,
    Unbound,
    UnbindingFailed,
}

impl fmt::Display for BindingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bound => "BOUND",
            Self::BindingFailed => "BINDING_FAILED",
            Self::Unbound => "UNBOUND",
            Self::UnbindingFailed => "UNBINDING_FAILED",
        };
        f.write_str(s)
    }
}

/// A credential-granting link to an instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    pub binding_id: String,

    /// Owning instance
    pub instance_id: String,

    /// Copied from the instance so the module can be found even if the
    /// instance record is lost
    pub service_id: String,

    #[serde(default)]
    pub binding_parameters: Parameters,

    /// Module-owned state
    #[serde(default)]
    pub details: Value,

    pub status: BindingStatus,

    #[serde(default)]
    pub status_reason: String,

    #[serde(default)]
    pub created: DateTime<Utc>,
}

impl Binding {
    pub fn new(
        binding_id: impl Into<String>,
        instance_id: impl Into<String>,
        service_id: impl Into<String>,
    ) -> Self {
        Self {
            binding_id: binding_id.into(),
            instance_id: instance_id.into(),
            service_id: service_id.into(),
            details: Value::Object(Default::default()),
            created: Utc::now(),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: BindingStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_parameters(mut self, params: Parameters) -> Self {
        self.binding_parameters = params;
        self
    }

    /// Drop the schema attached at read time
    pub fn without_derived(mut self) -> Self {
        self.binding_parameters.schema = None;
        self
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
