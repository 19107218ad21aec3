// src/events/lifecycle.rs

//! Instance lifecycle notifications published by the controller.

use std::fmt;

use serde_json::{Value, json};

use crate::events::Event;
use crate::workflow::WorkflowInstance;

/// Source attribute of every event the controller publishes.
pub const CONTROLLER_SOURCE: &str = "/flowhost/controller";

/// Type of the event published when a correlation context expires.
pub const CORRELATION_EXPIRED_TYPE: &str = "io.flowhost.correlation.expired.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleKind {
    Started,
    Completed,
    Faulted,
    Suspended,
    Resumed,
    Terminated,
}

impl LifecycleKind {
    pub fn event_type(self) -> &'static str {
        match self {
            LifecycleKind::Started => "io.flowhost.instance.started.v1",
            LifecycleKind::Completed => "io.flowhost.instance.completed.v1",
            LifecycleKind::Faulted => "io.flowhost.instance.faulted.v1",
            LifecycleKind::Suspended => "io.flowhost.instance.suspended.v1",
            LifecycleKind::Resumed => "io.flowhost.instance.resumed.v1",
            LifecycleKind::Terminated => "io.flowhost.instance.terminated.v1",
        }
    }

    pub fn from_event_type(event_type: &str) -> Option<Self> {
        [
            LifecycleKind::Started,
            LifecycleKind::Completed,
            LifecycleKind::Faulted,
            LifecycleKind::Suspended,
            LifecycleKind::Resumed,
            LifecycleKind::Terminated,
        ]
        .into_iter()
        .find(|k| k.event_type() == event_type)
    }
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleKind::Started => "started",
            LifecycleKind::Completed => "completed",
            LifecycleKind::Faulted => "faulted",
            LifecycleKind::Suspended => "suspended",
            LifecycleKind::Resumed => "resumed",
            LifecycleKind::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Build the lifecycle event for `instance`.
///
/// The payload always carries the instance id, definition, status and
/// attempt; `detail` (exit code, error, output) is merged on top.
pub fn lifecycle_event(kind: LifecycleKind, instance: &WorkflowInstance, detail: Value) -> Event {
    let mut data = json!({
        "instanceId": instance.id,
        "definition": instance.definition.to_string(),
        "status": instance.status,
        "attempt": instance.attempts,
    });
    if let (Some(base), Value::Object(extra)) = (data.as_object_mut(), detail) {
        base.extend(extra);
    }
    Event::new(kind.event_type(), CONTROLLER_SOURCE)
        .with_subject(instance.id.clone())
        .with_data(data)
}
