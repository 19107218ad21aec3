#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use flowhost::controller::{ControllerOptions, WorkflowController};
use flowhost::backend::RuntimePolicy;
use flowhost::events::{EventBus, MemoryEventBus};
use flowhost::store::{InstanceStore, MemoryStore};
use flowhost::types::RuntimeMode;
use flowhost::workflow::WorkflowInstance;
use flowhost_test_utils::builders::definition;
use flowhost_test_utils::mock_backend::MockBackend;

/// A controller wired to an in-memory store, an in-memory bus and a
/// scripted backend.
pub struct Harness {
    pub memory: Arc<MemoryStore>,
    pub store: Arc<dyn InstanceStore>,
    pub bus: Arc<MemoryEventBus>,
    pub backend: MockBackend,
    pub controller: WorkflowController,
}

impl Harness {
    pub fn new(options: ControllerOptions) -> Self {
        let memory = Arc::new(MemoryStore::new());
        memory.put_definition(definition("echo", "v1"));
        memory.put_definition(definition("fulfil", "v1"));
        let store: Arc<dyn InstanceStore> = memory.clone();

        let bus = Arc::new(MemoryEventBus::new());
        let backend = MockBackend::new(RuntimeMode::Native);
        let controller = WorkflowController::new(
            store.clone(),
            bus.clone() as Arc<dyn EventBus>,
            backend.selector(),
            RuntimePolicy::new(RuntimeMode::Native),
            options,
        );

        Self {
            memory,
            store,
            bus,
            backend,
            controller,
        }
    }

    pub async fn create(&self, instance: WorkflowInstance) {
        self.store
            .create_instance(instance)
            .await
            .expect("create instance");
    }

    pub async fn get(&self, id: &str) -> WorkflowInstance {
        self.store.get_instance(id).await.expect("get instance")
    }

    /// Read-modify-write of a stored instance.
    pub async fn update(&self, id: &str, f: impl FnOnce(&mut WorkflowInstance)) {
        let mut instance = self.get(id).await;
        f(&mut instance);
        self.store
            .update_instance(instance)
            .await
            .expect("update instance");
    }

    /// Wait until the controller owns no process for `id`.
    pub async fn wait_released(&self, id: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.controller.has_live_process(id) {
            assert!(tokio::time::Instant::now() < deadline, "{id} still has a live process");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Give a freshly started mock process time to print its scripted lines.
pub async fn settle_output() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
