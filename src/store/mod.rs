// src/store/mod.rs

//! Instance store interface.
//!
//! The controller reads definitions and instances, writes status back and
//! reacts to the change stream from [`InstanceStore::watch`]. Persistence is
//! someone else's job; [`MemoryStore`] keeps everything in memory for the
//! daemon and tests.

pub mod memory;

use tokio::sync::broadcast;
use tracing::warn;

use crate::BoxFuture;
use crate::errors::Result;
use crate::workflow::{DefinitionRef, WorkflowDefinition, WorkflowInstance};

pub use memory::MemoryStore;

/// One change to the instance collection.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Created(WorkflowInstance),
    Updated(WorkflowInstance),
    Deleted(String),
    /// Changes were missed; consumers should re-list.
    Resync,
}

impl StoreEvent {
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            StoreEvent::Created(i) | StoreEvent::Updated(i) => Some(&i.id),
            StoreEvent::Deleted(id) => Some(id),
            StoreEvent::Resync => None,
        }
    }
}

/// Narrow a watch to instances of one definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchFilter {
    pub definition: Option<DefinitionRef>,
}

impl WatchFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, event: &StoreEvent) -> bool {
        let Some(wanted) = &self.definition else {
            return true;
        };
        match event {
            StoreEvent::Created(i) | StoreEvent::Updated(i) => &i.definition == wanted,
            // Deletions carry no definition; let consumers decide.
            StoreEvent::Deleted(_) | StoreEvent::Resync => true,
        }
    }
}

/// Stream of [`StoreEvent`]s matching a [`WatchFilter`].
#[derive(Debug)]
pub struct StoreWatch {
    rx: broadcast::Receiver<StoreEvent>,
    filter: WatchFilter,
}

impl StoreWatch {
    pub fn new(rx: broadcast::Receiver<StoreEvent>, filter: WatchFilter) -> Self {
        Self { rx, filter }
    }

    /// Next matching change; `None` once the store is gone.
    pub async fn next(&mut self) -> Option<StoreEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "store watch lagged; requesting resync");
                    return Some(StoreEvent::Resync);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Storage for definitions and instances.
pub trait InstanceStore: Send + Sync {
    fn get_definition<'a>(
        &'a self,
        reference: &'a DefinitionRef,
    ) -> BoxFuture<'a, Result<WorkflowDefinition>>;

    fn get_instance<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<WorkflowInstance>>;

    fn list_instances(&self) -> BoxFuture<'_, Result<Vec<WorkflowInstance>>>;

    /// Fails with `InstanceExists` if the id is taken.
    fn create_instance(&self, instance: WorkflowInstance) -> BoxFuture<'_, Result<()>>;

    /// Fails with `InstanceNotFound` if the id is unknown.
    fn update_instance(&self, instance: WorkflowInstance) -> BoxFuture<'_, Result<()>>;

    fn delete_instance<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;

    fn watch(&self, filter: WatchFilter) -> StoreWatch;
}
