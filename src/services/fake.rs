//! A fake service used for smoke testing and as a template for real modules.
//!
//! Every hook the broker calls can be swapped out, so tests can inject
//! failures and count invocations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::domain::{
    Binding, InputParametersSchema, Instance, Parameters, PropertySchema, ValidationError,
};
use crate::service::catalog::ServiceProperties;
use crate::service::{
    CatalogError, Credentials, Deprovisioner, Module, ModuleError, Plan, PlanMetadata,
    PlanSchemas, Provisioner, Service, ServiceManager, ServiceMetadata, Step, Updater, Workflow,
};

/// Service id of the fake service
pub const SERVICE_ID: &str = "cdd1fb7a-d1e9-49e0-b195-e0bab747798a";

/// Plan id of the standard (and only) fake plan
pub const STANDARD_PLAN_ID: &str = "bd15e6f3-4ff5-477c-bb57-26313a368e74";

pub type BindFn = Arc<dyn Fn(&Instance, &Parameters) -> Result<Value, ModuleError> + Send + Sync>;
pub type UnbindFn = Arc<dyn Fn(&Instance, &Binding) -> Result<(), ModuleError> + Send + Sync>;
pub type ValidateUpdateFn = Arc<dyn Fn(&Instance) -> Result<(), ValidationError> + Send + Sync>;
pub type StepFn = Arc<dyn Fn(&Instance) -> anyhow::Result<Value> + Send + Sync>;

/// Fake implementation of [`ServiceManager`] with pluggable behavior
pub struct FakeServiceManager {
    bind_behavior: BindFn,
    unbind_behavior: UnbindFn,
    validate_update_behavior: ValidateUpdateFn,
    provision_behavior: StepFn,
    update_behavior: StepFn,
    deprovision_behavior: StepFn,
    bind_calls: AtomicUsize,
    unbind_calls: AtomicUsize,
    credentials_calls: AtomicUsize,
}

impl Default for FakeServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServiceManager {
    pub fn new() -> Self {
        let passthrough: StepFn = Arc::new(|instance: &Instance| Ok(instance.details.clone()));
        Self {
            bind_behavior: Arc::new(|_, params| {
                Ok(json!({
                    "username": format!("user-{}", uuid::Uuid::new_v4().simple()),
                    "someParameter": params.get_string("someParameter"),
                }))
            }),
            unbind_behavior: Arc::new(|_, _| Ok(())),
            validate_update_behavior: Arc::new(|_| Ok(())),
            provision_behavior: passthrough.clone(),
            update_behavior: passthrough.clone(),
            deprovision_behavior: passthrough,
            bind_calls: AtomicUsize::new(0),
            unbind_calls: AtomicUsize::new(0),
            credentials_calls: AtomicUsize::new(0),
        }
    }

    pub fn on_bind<F>(mut self, f: F) -> Self
    where
        F: Fn(&Instance, &Parameters) -> Result<Value, ModuleError> + Send + Sync + 'static,
    {
        self.bind_behavior = Arc::new(f);
        self
    }

    pub fn on_unbind<F>(mut self, f: F) -> Self
    where
        F: Fn(&Instance, &Binding) -> Result<(), ModuleError> + Send + Sync + 'static,
    {
        self.unbind_behavior = Arc::new(f);
        self
    }

    pub fn on_validate_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&Instance) -> Result<(), ValidationError> + Send + Sync + 'static,
    {
        self.validate_update_behavior = Arc::new(f);
        self
    }

    pub fn on_provision<F>(mut self, f: F) -> Self
    where
        F: Fn(&Instance) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.provision_behavior = Arc::new(f);
        self
    }

    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&Instance) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.update_behavior = Arc::new(f);
        self
    }

    pub fn on_deprovision<F>(mut self, f: F) -> Self
    where
        F: Fn(&Instance) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.deprovision_behavior = Arc::new(f);
        self
    }

    /// Number of times `bind` reached this manager
    pub fn bind_calls(&self) -> usize {
        self.bind_calls.load(Ordering::SeqCst)
    }

    /// Number of times `unbind` reached this manager
    pub fn unbind_calls(&self) -> usize {
        self.unbind_calls.load(Ordering::SeqCst)
    }

    /// Number of times credentials were extracted from a binding
    pub fn credentials_calls(&self) -> usize {
        self.credentials_calls.load(Ordering::SeqCst)
    }

    fn single_step(behavior: &StepFn) -> Step {
        let behavior = behavior.clone();
        Step::new("run", move |_cancel, instance: Instance| {
            let result = behavior(&instance);
            async move { result }
        })
    }
}

#[async_trait]
impl ServiceManager for FakeServiceManager {
    fn get_provisioner(&self, _plan: &Plan) -> Result<Provisioner, ModuleError> {
        Ok(Workflow::provisioner(vec![Self::single_step(
            &self.provision_behavior,
        )])?)
    }

    fn get_updater(&self, _plan: &Plan) -> Result<Updater, ModuleError> {
        Ok(Workflow::updater(vec![Self::single_step(
            &self.update_behavior,
        )])?)
    }

    fn get_deprovisioner(&self, _plan: &Plan) -> Result<Deprovisioner, ModuleError> {
        Ok(Workflow::deprovisioner(vec![Self::single_step(
            &self.deprovision_behavior,
        )])?)
    }

    fn validate_updating_parameters(&self, instance: &Instance) -> Result<(), ValidationError> {
        (self.validate_update_behavior)(instance)
    }

    async fn bind(&self, instance: &Instance, params: &Parameters) -> Result<Value, ModuleError> {
        self.bind_calls.fetch_add(1, Ordering::SeqCst);
        (self.bind_behavior)(instance, params)
    }

    async fn unbind(&self, instance: &Instance, binding: &Binding) -> Result<(), ModuleError> {
        self.unbind_calls.fetch_add(1, Ordering::SeqCst);
        (self.unbind_behavior)(instance, binding)
    }

    fn get_credentials(
        &self,
        instance: &Instance,
        binding: &Binding,
    ) -> Result<Credentials, ModuleError> {
        self.credentials_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "instanceId": instance.instance_id,
            "bindingId": binding.binding_id,
            "details": binding.details,
        }))
    }
}

/// Module wrapping a [`FakeServiceManager`]
#[derive(Clone)]
pub struct FakeModule {
    manager: Arc<FakeServiceManager>,
}

impl Default for FakeModule {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeModule {
    pub fn new() -> Self {
        Self::with_manager(FakeServiceManager::new())
    }

    pub fn with_manager(manager: FakeServiceManager) -> Self {
        Self {
            manager: Arc::new(manager),
        }
    }

    /// The manager as the broker sees it
    pub fn manager(&self) -> Arc<dyn ServiceManager> {
        self.manager.clone()
    }

    /// The concrete manager, for inspecting call counts
    pub fn fake_manager(&self) -> &Arc<FakeServiceManager> {
        &self.manager
    }

    fn some_parameter_schema() -> InputParametersSchema {
        InputParametersSchema::new().with_property("someParameter", PropertySchema::string())
    }
}

impl Module for FakeModule {
    fn name(&self) -> &str {
        "fake"
    }

    fn services(&self) -> Result<Vec<Service>, CatalogError> {
        let provisioning = Self::some_parameter_schema()
            .with_property("alias", PropertySchema::string())
            .with_property("parentAlias", PropertySchema::string());

        let plan = Plan {
            id: STANDARD_PLAN_ID.to_string(),
            name: "standard".to_string(),
            description: "The only sort of fake service, one that's fake".to_string(),
            free: false,
            metadata: PlanMetadata {
                display_name: "Fake".to_string(),
                bullets: vec!["Fake 1".to_string(), "Fake 2".to_string()],
            },
            schemas: PlanSchemas::new(
                provisioning,
                Self::some_parameter_schema(),
                Self::some_parameter_schema(),
            ),
        };

        let service = Service::new(
            ServiceProperties {
                id: SERVICE_ID.to_string(),
                name: "fake".to_string(),
                description: "Fake Service".to_string(),
                metadata: ServiceMetadata {
                    display_name: "fake".to_string(),
                    image_url: "fake".to_string(),
                    long_description: "Fake Service".to_string(),
                    documentation_url: "fake".to_string(),
                    support_url: "fake".to_string(),
                },
                bindable: true,
                plan_updatable: false,
                tags: vec!["Fake".to_string()],
            },
            self.manager(),
            vec![plan],
        )?;
        Ok(vec![service])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_default_workflows_pass_details_through() {
        let module = FakeModule::new();
        let services = module.services().unwrap();
        let plan = services[0].get_plan(STANDARD_PLAN_ID).unwrap();
        let manager = module.manager();

        let instance = Instance::new("i", SERVICE_ID, STANDARD_PLAN_ID)
            .with_details(json!({ "kept": 1 }));
        let provisioner = manager.get_provisioner(&plan).unwrap();
        assert_eq!(provisioner.step_names(), vec!["run"]);

        let step = &provisioner.steps_from(None).unwrap()[0];
        let details = step.execute(CancellationToken::new(), instance).await.unwrap();
        assert_eq!(details, json!({ "kept": 1 }));
    }

    #[tokio::test]
    async fn test_behaviors_are_pluggable_and_counted() {
        let module = FakeModule::with_manager(
            FakeServiceManager::new()
                .on_bind(|_, _| Err(ModuleError::Failed("no capacity".into()))),
        );
        let manager = module.manager();

        let err = manager
            .bind(&Instance::default(), &Parameters::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no capacity");
        assert_eq!(module.fake_manager().bind_calls(), 1);
        assert_eq!(module.fake_manager().unbind_calls(), 0);
    }
}
