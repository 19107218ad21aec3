// src/correlation/listener.rs

//! Connects correlation gates to the event bus and the instance store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CorrelationOptions;
use crate::correlation::context::ContextSnapshot;
use crate::correlation::gate::{CorrelationGate, GateResult};
use crate::errors::Result;
use crate::events::{CONTROLLER_SOURCE, CORRELATION_EXPIRED_TYPE, Event, EventBus};
use crate::store::InstanceStore;
use crate::types::ActivationType;
use crate::workflow::WorkflowInstance;

/// Feeds every bus event to every gate; satisfied correlations become
/// `event-triggered` instances.
pub struct CorrelationListener {
    gates: Vec<Arc<CorrelationGate>>,
    store: Arc<dyn InstanceStore>,
    bus: Arc<dyn EventBus>,
    sweep_interval: Duration,
}

impl CorrelationListener {
    pub fn new(
        options: &CorrelationOptions,
        store: Arc<dyn InstanceStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            gates: options
                .rules
                .iter()
                .cloned()
                .map(|rule| Arc::new(CorrelationGate::new(rule)))
                .collect(),
            store,
            bus,
            sweep_interval: options.sweep_interval,
        }
    }

    pub fn gates(&self) -> &[Arc<CorrelationGate>] {
        &self.gates
    }

    /// Offer `event` to every gate. Returns the ids of instances created.
    pub async fn handle_event(&self, event: &Event) -> Vec<String> {
        let mut created = Vec::new();
        for gate in &self.gates {
            match gate.ingest(event.clone()).await {
                GateResult::Satisfied(snapshot) => {
                    match self.start_instance(gate, snapshot).await {
                        Ok(id) => created.push(id),
                        Err(e) => warn!(rule = %gate.rule().name, error = %e, "failed to create triggered instance"),
                    }
                }
                GateResult::StillCollecting => {
                    debug!(rule = %gate.rule().name, event = %event.id, "event correlated");
                }
                GateResult::Rejected(_) => {}
            }
        }
        created
    }

    async fn start_instance(&self, gate: &CorrelationGate, snapshot: ContextSnapshot) -> Result<String> {
        let rule = gate.rule();
        let id = format!("{}-{}", rule.name, Uuid::new_v4().simple());
        let input = serde_json::to_value(&snapshot)?;
        let instance = WorkflowInstance::new(id.clone(), rule.workflow.clone(), input)
            .with_activation(ActivationType::EventTriggered);
        self.store.create_instance(instance).await?;
        info!(rule = %rule.name, key = %snapshot.key, instance = %id, workflow = %rule.workflow, "correlation started instance");
        Ok(id)
    }

    /// Expire stale contexts and announce each expiry on the bus.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut count = 0;
        for gate in &self.gates {
            for snapshot in gate.sweep_at(now) {
                count += 1;
                info!(rule = %snapshot.rule, key = %snapshot.key, "correlation timed out");
                let event = Event::new(CORRELATION_EXPIRED_TYPE, CONTROLLER_SOURCE)
                    .with_subject(snapshot.key.clone())
                    .with_data(json!({
                        "rule": snapshot.rule,
                        "key": snapshot.key,
                        "createdAt": snapshot.created_at,
                        "expiresAt": snapshot.expires_at,
                        "seen": snapshot.seen,
                    }));
                if let Err(e) = self.bus.publish(event).await {
                    warn!(error = %e, "failed to publish correlation expiry");
                }
            }
        }
        count
    }

    /// Consume the bus until `cancel` fires, sweeping periodically.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        if self.gates.is_empty() {
            debug!("no correlation rules configured; listener idle");
            cancel.cancelled().await;
            return Ok(());
        }

        let mut events = self
            .bus
            .subscribe(Arc::new(|e: &Event| e.source != CONTROLLER_SOURCE));
        let mut sweep = interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(rules = self.gates.len(), "correlation listener started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => {
                    self.sweep(Utc::now()).await;
                }
                event = events.next() => match event {
                    Some(event) => {
                        self.handle_event(&event).await;
                    }
                    None => {
                        info!("event bus closed");
                        break;
                    }
                },
            }
        }
        info!("correlation listener stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::correlation::{CompletionPredicate, CorrelationRule};
    use crate::events::MemoryEventBus;
    use crate::store::MemoryStore;
    use crate::workflow::{DefinitionRef, InstanceStatus};

    fn listener(store: Arc<MemoryStore>, bus: Arc<MemoryEventBus>) -> CorrelationListener {
        let rule = CorrelationRule {
            name: "paid-and-packed".into(),
            workflow: DefinitionRef::new("ship", "1"),
            key: "orderid".into(),
            ttl: Duration::from_millis(50),
            filters: Vec::new(),
            completion: CompletionPredicate::AllOf(BTreeSet::from([
                "paid".to_string(),
                "packed".to_string(),
            ])),
        };
        let options = CorrelationOptions {
            sweep_interval: Duration::from_millis(10),
            rules: vec![rule],
        };
        CorrelationListener::new(&options, store, bus)
    }

    fn event(event_type: &str, order: &str) -> Event {
        Event::new(event_type, "/shop").with_extension("orderid", order)
    }

    #[tokio::test]
    async fn satisfied_correlation_creates_event_triggered_instance() {
        let store = Arc::new(MemoryStore::new());
        let l = listener(store.clone(), Arc::new(MemoryEventBus::new()));

        assert!(l.handle_event(&event("paid", "o-1")).await.is_empty());
        let created = l.handle_event(&event("packed", "o-1")).await;
        assert_eq!(created.len(), 1);

        let instance = store.get_instance(&created[0]).await.unwrap();
        assert_eq!(instance.activation, ActivationType::EventTriggered);
        assert_eq!(instance.status, InstanceStatus::Pending);
        assert_eq!(instance.definition, DefinitionRef::new("ship", "1"));
        assert_eq!(instance.input["key"], "o-1");
        assert_eq!(instance.input["events"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn expiry_is_published() {
        let bus = Arc::new(MemoryEventBus::new());
        let l = listener(Arc::new(MemoryStore::new()), bus.clone());
        let mut expirations = bus.subscribe(Arc::new(|e: &Event| e.event_type == CORRELATION_EXPIRED_TYPE));

        l.handle_event(&event("paid", "o-2")).await;
        assert_eq!(l.sweep(Utc::now() + chrono::Duration::seconds(1)).await, 1);

        let expired = expirations.next().await.unwrap();
        assert_eq!(expired.subject.as_deref(), Some("o-2"));
        assert_eq!(expired.data["rule"], "paid-and-packed");
    }
}
