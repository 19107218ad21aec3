// src/store/memory.rs

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::debug;

use crate::BoxFuture;
use crate::errors::{FlowhostError, Result};
use crate::store::{InstanceStore, StoreEvent, StoreWatch, WatchFilter};
use crate::workflow::{DefinitionRef, WorkflowDefinition, WorkflowInstance};

/// In-memory [`InstanceStore`].
#[derive(Debug)]
pub struct MemoryStore {
    definitions: RwLock<HashMap<DefinitionRef, WorkflowDefinition>>,
    instances: RwLock<HashMap<String, WorkflowInstance>>,
    changes: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            definitions: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Register (or replace) a definition.
    pub fn put_definition(&self, definition: WorkflowDefinition) {
        let mut defs = self.definitions.write().unwrap_or_else(|p| p.into_inner());
        debug!(definition = %definition.reference(), "definition registered");
        defs.insert(definition.reference(), definition);
    }

    pub fn definition_count(&self) -> usize {
        self.definitions.read().map(|d| d.len()).unwrap_or(0)
    }

    fn notify(&self, event: StoreEvent) {
        let _ = self.changes.send(event);
    }
}

impl InstanceStore for MemoryStore {
    fn get_definition<'a>(
        &'a self,
        reference: &'a DefinitionRef,
    ) -> BoxFuture<'a, Result<WorkflowDefinition>> {
        Box::pin(async move {
            let defs = self.definitions.read().unwrap_or_else(|p| p.into_inner());
            defs.get(reference)
                .cloned()
                .ok_or_else(|| FlowhostError::DefinitionNotFound(reference.to_string()))
        })
    }

    fn get_instance<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<WorkflowInstance>> {
        Box::pin(async move {
            let instances = self.instances.read().unwrap_or_else(|p| p.into_inner());
            instances
                .get(id)
                .cloned()
                .ok_or_else(|| FlowhostError::InstanceNotFound(id.to_string()))
        })
    }

    fn list_instances(&self) -> BoxFuture<'_, Result<Vec<WorkflowInstance>>> {
        Box::pin(async move {
            let instances = self.instances.read().unwrap_or_else(|p| p.into_inner());
            let mut all: Vec<_> = instances.values().cloned().collect();
            all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            Ok(all)
        })
    }

    fn create_instance(&self, instance: WorkflowInstance) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            {
                let mut instances = self.instances.write().unwrap_or_else(|p| p.into_inner());
                if instances.contains_key(&instance.id) {
                    return Err(FlowhostError::InstanceExists(instance.id));
                }
                instances.insert(instance.id.clone(), instance.clone());
                // Notify under the lock so watchers see changes in write order.
                self.notify(StoreEvent::Created(instance));
            }
            Ok(())
        })
    }

    fn update_instance(&self, instance: WorkflowInstance) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut instances = self.instances.write().unwrap_or_else(|p| p.into_inner());
            let Some(slot) = instances.get_mut(&instance.id) else {
                return Err(FlowhostError::InstanceNotFound(instance.id));
            };
            *slot = instance.clone();
            self.notify(StoreEvent::Updated(instance));
            Ok(())
        })
    }

    fn delete_instance<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut instances = self.instances.write().unwrap_or_else(|p| p.into_inner());
            if instances.remove(id).is_none() {
                return Err(FlowhostError::InstanceNotFound(id.to_string()));
            }
            self.notify(StoreEvent::Deleted(id.to_string()));
            Ok(())
        })
    }

    fn watch(&self, filter: WatchFilter) -> StoreWatch {
        StoreWatch::new(self.changes.subscribe(), filter)
    }
}
