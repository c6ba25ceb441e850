//! Encoding and two-phase decoding of persisted records.
//!
//! Records are serialized to JSON and then encrypted. Reads decrypt, peek at
//! the header to learn the owning service and plan, resolve both through the
//! catalog, and only then materialize parameters and details.

use std::sync::Arc;

use serde::Deserialize;

use super::StoreError;
use crate::crypto::Codec;
use crate::domain::{merge_details, Binding, Instance};
use crate::service::Catalog;

/// Identifying fields of an instance record, readable without the catalog
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceHeader {
    pub instance_id: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub parent_alias: Option<String>,
}

/// Identifying fields of a binding record
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingHeader {
    pub binding_id: String,
    #[serde(default)]
    pub instance_id: String,
}

/// Serializes, encrypts and decodes records against a catalog
#[derive(Debug, Clone)]
pub struct RecordCodec {
    codec: Arc<dyn Codec>,
    catalog: Arc<Catalog>,
}

impl RecordCodec {
    pub fn new(codec: Arc<dyn Codec>, catalog: Arc<Catalog>) -> Self {
        Self { codec, catalog }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn encode_instance(&self, instance: &Instance) -> Result<Vec<u8>, StoreError> {
        let json = instance.to_json()?;
        Ok(self.codec.encrypt(&json)?)
    }

    pub fn encode_binding(&self, binding: &Binding) -> Result<Vec<u8>, StoreError> {
        let json = binding.to_json()?;
        Ok(self.codec.encrypt(&json)?)
    }

    /// Decrypt a record and read only its identifying fields
    pub fn decode_instance_header(&self, raw: &[u8]) -> Result<InstanceHeader, StoreError> {
        let json = self.codec.decrypt(raw)?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Decrypt a binding record and read only its identifying fields
    pub fn decode_binding_header(&self, raw: &[u8]) -> Result<BindingHeader, StoreError> {
        let json = self.codec.decrypt(raw)?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Full two-phase decode of an instance record
    pub fn decode_instance(&self, raw: &[u8]) -> Result<Instance, StoreError> {
        let json = self.codec.decrypt(raw)?;
        let header: InstanceHeader = serde_json::from_slice(&json)?;

        let service = self.catalog.get_service(&header.service_id).ok_or_else(|| {
            StoreError::Integrity(format!(
                "service {} of instance {} is not in the catalog",
                header.service_id, header.instance_id
            ))
        })?;
        let plan = service.get_plan(&header.plan_id).ok_or_else(|| {
            StoreError::Integrity(format!(
                "plan {} of service {} is not in the catalog",
                header.plan_id, header.service_id
            ))
        })?;

        let mut instance: Instance = serde_json::from_slice(&json)?;
        let schemas = plan.schemas();
        instance.provisioning_parameters.schema = Some(schemas.provisioning.clone());
        instance.updating_parameters.schema = Some(schemas.updating.clone());
        instance.details = merge_details(
            service.service_manager().get_empty_instance_details(),
            std::mem::take(&mut instance.details),
        );
        instance.service = Some(service);
        instance.plan = Some(plan);
        Ok(instance)
    }

    /// Decode a binding record.
    ///
    /// With the owning instance the binding schema and details template come
    /// from its plan. Without it the binding's own service id picks the
    /// template and parameters stay untyped.
    pub fn decode_binding(
        &self,
        raw: &[u8],
        instance: Option<&Instance>,
    ) -> Result<Binding, StoreError> {
        let json = self.codec.decrypt(raw)?;
        let mut binding: Binding = serde_json::from_slice(&json)?;

        let template = match instance.and_then(|i| Some((i.service.as_ref()?, i.plan.as_ref()?))) {
            Some((service, plan)) => {
                binding.binding_parameters.schema = Some(plan.schemas().binding.clone());
                service.service_manager().get_empty_binding_details()
            }
            None => {
                let service = self.catalog.get_service(&binding.service_id).ok_or_else(|| {
                    StoreError::Integrity(format!(
                        "service {} of binding {} is not in the catalog",
                        binding.service_id, binding.binding_id
                    ))
                })?;
                service.service_manager().get_empty_binding_details()
            }
        };
        binding.details = merge_details(template, std::mem::take(&mut binding.details));
        Ok(binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Aes256Codec, CryptoError, NoopCodec};
    use crate::service::{catalog_from_modules, Module};
    use crate::services::fake::{FakeModule, SERVICE_ID, STANDARD_PLAN_ID};
    use serde_json::json;

    fn records(codec: Arc<dyn Codec>) -> RecordCodec {
        let modules: Vec<Arc<dyn Module>> = vec![Arc::new(FakeModule::new())];
        RecordCodec::new(codec, Arc::new(catalog_from_modules(&modules).unwrap()))
    }

    #[test]
    fn test_instance_decode_attaches_catalog() {
        let records = records(Arc::new(NoopCodec::new()));
        let instance = Instance::new("i-1", SERVICE_ID, STANDARD_PLAN_ID);

        let raw = records.encode_instance(&instance).unwrap();
        let decoded = records.decode_instance(&raw).unwrap();

        assert_eq!(decoded.service.as_ref().unwrap().id(), SERVICE_ID);
        assert_eq!(decoded.plan.as_ref().unwrap().id, STANDARD_PLAN_ID);
        assert!(decoded.provisioning_parameters.schema.is_some());
        assert_eq!(decoded.without_derived(), instance);
    }

    #[test]
    fn test_unknown_service_is_integrity_error() {
        let records = records(Arc::new(NoopCodec::new()));
        let raw = records
            .encode_instance(&Instance::new("i-1", "unknown", STANDARD_PLAN_ID))
            .unwrap();

        let err = records.decode_instance(&raw).unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));

        // The header is still readable for index cleanup
        let header = records.decode_instance_header(&raw).unwrap();
        assert_eq!(header.instance_id, "i-1");
    }

    #[test]
    fn test_binding_without_instance_uses_own_service() {
        let records = records(Arc::new(NoopCodec::new()));
        let binding = Binding::new("b-1", "gone", SERVICE_ID).with_status(Default::default());

        let raw = records.encode_binding(&binding).unwrap();
        let decoded = records.decode_binding(&raw, None).unwrap();
        assert!(decoded.binding_parameters.schema.is_none());
        assert_eq!(decoded, binding);
    }

    #[test]
    fn test_failures_stay_distinct() {
        let records = records(Arc::new(NoopCodec::new()));
        let err = records.decode_instance(b"not json").unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));

        let aes = records_with_key("AES256Key-32Characters1234567890");
        let other = records_with_key("AnotherKey-32Characters123456789");
        let raw = aes
            .encode_instance(&Instance::new("i-1", SERVICE_ID, STANDARD_PLAN_ID))
            .unwrap();
        let err = other.decode_instance(&raw).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Decryption(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_details_merge_over_template() {
        let records = records(Arc::new(NoopCodec::new()));
        let instance = Instance::new("i-1", SERVICE_ID, STANDARD_PLAN_ID)
            .with_details(json!({ "server": "db-1" }));
        let raw = records.encode_instance(&instance).unwrap();
        let decoded = records.decode_instance(&raw).unwrap();
        assert_eq!(decoded.details, json!({ "server": "db-1" }));
    }

    fn records_with_key(key: &str) -> RecordCodec {
        records(Arc::new(Aes256Codec::new(key).unwrap()))
    }
}
