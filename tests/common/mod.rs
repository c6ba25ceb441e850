//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use osbroker::core::{AsyncEngine, FatalSignal, Lifecycle, LocalEngine};
use osbroker::crypto::NoopCodec;
use osbroker::domain::{Instance, InstanceStatus, Parameters};
use osbroker::service::{catalog_from_modules, Catalog, Module};
use osbroker::services::fake::{FakeModule, FakeServiceManager, SERVICE_ID, STANDARD_PLAN_ID};
use osbroker::storage::{MemoryStore, RecordCodec, Store};

/// A lifecycle over the fake module, an in-memory store and a local engine
pub struct Harness {
    pub module: FakeModule,
    pub catalog: Arc<Catalog>,
    pub store: Arc<MemoryStore>,
    pub engine: Arc<LocalEngine>,
    pub fatal: FatalSignal,
    pub lifecycle: Lifecycle,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_manager(FakeServiceManager::new())
    }

    pub fn with_manager(manager: FakeServiceManager) -> Self {
        let module = FakeModule::with_manager(manager);
        let modules: Vec<Arc<dyn Module>> = vec![Arc::new(module.clone())];
        let catalog = Arc::new(catalog_from_modules(&modules).unwrap());
        let store = Arc::new(MemoryStore::new(RecordCodec::new(
            Arc::new(NoopCodec::new()),
            catalog.clone(),
        )));
        let fatal = FatalSignal::new();
        let engine = Arc::new(LocalEngine::new(
            store.clone(),
            fatal.clone(),
            16,
            Duration::from_secs(5),
        ));
        let lifecycle = Lifecycle::new(
            catalog.clone(),
            store.clone(),
            engine.clone() as Arc<dyn AsyncEngine>,
            fatal.clone(),
        );
        Self {
            module,
            catalog,
            store,
            engine,
            fatal,
            lifecycle,
        }
    }

    /// A fresh engine and lifecycle over the same store, as after a restart
    pub fn restarted(&self) -> Self {
        let fatal = FatalSignal::new();
        let engine = Arc::new(LocalEngine::new(
            self.store.clone(),
            fatal.clone(),
            16,
            Duration::from_secs(5),
        ));
        let lifecycle = Lifecycle::new(
            self.catalog.clone(),
            self.store.clone(),
            engine.clone() as Arc<dyn AsyncEngine>,
            fatal.clone(),
        );
        Self {
            module: self.module.clone(),
            catalog: self.catalog.clone(),
            store: self.store.clone(),
            engine,
            fatal,
            lifecycle,
        }
    }

    pub fn bind_calls(&self) -> usize {
        self.module.fake_manager().bind_calls()
    }

    pub fn unbind_calls(&self) -> usize {
        self.module.fake_manager().unbind_calls()
    }

    pub fn credentials_calls(&self) -> usize {
        self.module.fake_manager().credentials_calls()
    }

    /// Write an instance straight to the store with the given status
    pub async fn seed_instance(&self, instance_id: &str, status: InstanceStatus) -> Instance {
        let instance = Instance::new(instance_id, SERVICE_ID, STANDARD_PLAN_ID)
            .with_status(status)
            .with_provisioning_parameters(Parameters::default());
        self.store.write_instance(&instance).await.unwrap();
        instance
    }
}

pub fn body(value: Value) -> Vec<u8> {
    serde_json::to_vec(&value).unwrap()
}

pub fn provision_body(parameters: Value) -> Vec<u8> {
    body(json!({
        "service_id": SERVICE_ID,
        "plan_id": STANDARD_PLAN_ID,
        "parameters": parameters,
    }))
}

pub fn bind_body(parameters: Value) -> Vec<u8> {
    body(json!({
        "service_id": SERVICE_ID,
        "plan_id": STANDARD_PLAN_ID,
        "parameters": parameters,
    }))
}

/// Start the engine in the background. Cancel the token to stop it.
pub fn start_engine(
    harness: &Harness,
) -> (
    tokio::sync::broadcast::Receiver<osbroker::core::TaskEvent>,
    tokio_util::sync::CancellationToken,
) {
    let events = harness.engine.subscribe();
    let cancel = tokio_util::sync::CancellationToken::new();
    let engine = harness.engine.clone();
    let token = cancel.clone();
    tokio::spawn(async move { engine.run(token).await });
    (events, cancel)
}

/// Wait for the next task event, failing the test if none arrives
pub async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<osbroker::core::TaskEvent>,
) -> osbroker::core::TaskEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no task event within 5s")
        .expect("event channel closed")
}
