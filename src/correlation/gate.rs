// src/correlation/gate.rs

//! Per-rule correlation gate.
//!
//! Each key moves `Empty -> Collecting -> Satisfied | Expired`. A satisfied
//! key stays consumed until its original expiry so that stragglers do not
//! start a second instance.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::correlation::context::{ContextSnapshot, ContextState, CorrelationContext};
use crate::correlation::rule::CorrelationRule;
use crate::events::Event;
use crate::keyed_lock::KeyedLocks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Not an event this rule correlates.
    FilterMismatch,
    /// The event lacks the key attribute.
    MissingKey,
    /// The key already completed and has not expired yet.
    ContextConsumed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::FilterMismatch => "filter mismatch",
            RejectReason::MissingKey => "missing correlation key",
            RejectReason::ContextConsumed => "context already consumed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateResult {
    StillCollecting,
    Satisfied(ContextSnapshot),
    Rejected(RejectReason),
}

#[derive(Debug)]
enum Slot {
    Collecting(CorrelationContext),
    Consumed { until: DateTime<Utc> },
}

pub struct CorrelationGate {
    rule: CorrelationRule,
    slots: Mutex<HashMap<String, Slot>>,
    /// Contexts found expired during ingestion, reported by the next sweep.
    expired: Mutex<Vec<ContextSnapshot>>,
    locks: KeyedLocks,
}

impl fmt::Debug for CorrelationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationGate")
            .field("rule", &self.rule.name)
            .field("keys", &self.key_count())
            .finish()
    }
}

impl CorrelationGate {
    pub fn new(rule: CorrelationRule) -> Self {
        Self {
            rule,
            slots: Mutex::new(HashMap::new()),
            expired: Mutex::new(Vec::new()),
            locks: KeyedLocks::new(),
        }
    }

    pub fn rule(&self) -> &CorrelationRule {
        &self.rule
    }

    /// Keys currently collecting or consumed.
    pub fn key_count(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub async fn ingest(&self, event: Event) -> GateResult {
        self.ingest_at(event, Utc::now()).await
    }

    /// Feed one event observed at `now`.
    ///
    /// Events for the same key are applied one at a time under that key's
    /// lock; the slot table is only held to take and put back one slot, so
    /// different keys proceed independently.
    pub async fn ingest_at(&self, event: Event, now: DateTime<Utc>) -> GateResult {
        let accepted = self.rule.accepts(&event);
        let Some(key) = self.rule.key_of(&event) else {
            let reason = if accepted {
                RejectReason::MissingKey
            } else {
                RejectReason::FilterMismatch
            };
            return GateResult::Rejected(reason);
        };

        let _guard = self.locks.lock(&key).await;

        if let Some(until) = self.consumed_until(&key, now) {
            debug!(rule = %self.rule.name, %key, %until, "event for consumed correlation rejected");
            return GateResult::Rejected(RejectReason::ContextConsumed);
        }
        if !accepted {
            return GateResult::Rejected(RejectReason::FilterMismatch);
        }

        let taken = self.slots().remove(&key);
        let mut context = match taken {
            Some(Slot::Collecting(mut ctx)) if ctx.is_expired(now) => {
                ctx.mark(ContextState::Expired);
                self.expired
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(ctx.snapshot());
                CorrelationContext::new(&self.rule.name, &key, now, self.rule.ttl)
            }
            Some(Slot::Collecting(ctx)) => ctx,
            Some(Slot::Consumed { .. }) | None => {
                debug!(rule = %self.rule.name, %key, "opening correlation context");
                CorrelationContext::new(&self.rule.name, &key, now, self.rule.ttl)
            }
        };

        context.record(event);
        if self.rule.completion.is_satisfied(context.seen()) {
            context.mark(ContextState::Satisfied);
            let until = context.expires_at();
            self.slots().insert(key.clone(), Slot::Consumed { until });
            info!(rule = %self.rule.name, %key, "correlation satisfied");
            return GateResult::Satisfied(context.snapshot());
        }

        self.slots().insert(key, Slot::Collecting(context));
        GateResult::StillCollecting
    }

    fn consumed_until(&self, key: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.slots().get(key) {
            Some(Slot::Consumed { until }) if now < *until => Some(*until),
            _ => None,
        }
    }

    /// Drop expired contexts and stale consumed markers. Returns the
    /// contexts that expired before completing.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<ContextSnapshot> {
        let mut expired: Vec<ContextSnapshot> = self
            .expired
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();

        let mut slots = self.slots();
        slots.retain(|key, slot| match slot {
            Slot::Consumed { until } => now < *until,
            Slot::Collecting(ctx) if ctx.is_expired(now) => {
                ctx.mark(ContextState::Expired);
                debug!(rule = %self.rule.name, %key, "correlation context expired");
                expired.push(ctx.snapshot());
                false
            }
            Slot::Collecting(_) => true,
        });
        expired
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::Duration;

    use super::*;
    use crate::correlation::rule::CompletionPredicate;
    use crate::workflow::DefinitionRef;

    fn gate() -> CorrelationGate {
        CorrelationGate::new(CorrelationRule {
            name: "ab".into(),
            workflow: DefinitionRef::new("joined", "1"),
            key: "subject".into(),
            ttl: Duration::from_secs(60),
            filters: Vec::new(),
            completion: CompletionPredicate::AllOf(BTreeSet::from(["A".to_string(), "B".to_string()])),
        })
    }

    fn event(event_type: &str, key: &str) -> Event {
        Event::new(event_type, "/test").with_subject(key)
    }

    #[tokio::test]
    async fn a_then_b_satisfies_once() {
        let g = gate();
        let t0 = Utc::now();

        assert_eq!(g.ingest_at(event("A", "k1"), t0).await, GateResult::StillCollecting);
        let GateResult::Satisfied(snapshot) = g.ingest_at(event("B", "k1"), t0).await else {
            panic!("expected satisfaction");
        };
        assert_eq!(snapshot.key, "k1");
        assert_eq!(snapshot.state, ContextState::Satisfied);
        assert_eq!(snapshot.events.len(), 2);
        assert_eq!(
            snapshot.seen,
            BTreeMap::from([("A".to_string(), 1), ("B".to_string(), 1)])
        );

        assert_eq!(
            g.ingest_at(event("A", "k1"), t0).await,
            GateResult::Rejected(RejectReason::ContextConsumed)
        );
        // Consumption wins over the filter for a known key.
        assert_eq!(
            g.ingest_at(event("C", "k1"), t0).await,
            GateResult::Rejected(RejectReason::ContextConsumed)
        );
        assert_eq!(
            g.ingest_at(event("C", "k2"), t0).await,
            GateResult::Rejected(RejectReason::FilterMismatch)
        );
        assert_eq!(g.key_count(), 1);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let g = gate();
        let t0 = Utc::now();
        g.ingest_at(event("A", "k1"), t0).await;
        assert_eq!(g.ingest_at(event("B", "k2"), t0).await, GateResult::StillCollecting);
        assert_eq!(g.key_count(), 2);
    }

    #[tokio::test]
    async fn irrelevant_or_keyless_events_are_rejected() {
        let g = gate();
        assert_eq!(
            g.ingest(event("C", "k1")).await,
            GateResult::Rejected(RejectReason::FilterMismatch)
        );
        assert_eq!(
            g.ingest(Event::new("A", "/test")).await,
            GateResult::Rejected(RejectReason::MissingKey)
        );
        assert_eq!(g.key_count(), 0);
    }

    #[tokio::test]
    async fn sweep_expires_collecting_and_frees_consumed() {
        let g = gate();
        let t0 = Utc::now();
        g.ingest_at(event("A", "open"), t0).await;
        g.ingest_at(event("A", "done"), t0).await;
        g.ingest_at(event("B", "done"), t0).await;

        assert!(g.sweep_at(t0 + chrono::Duration::seconds(30)).is_empty());

        let later = t0 + chrono::Duration::seconds(61);
        let expired = g.sweep_at(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, "open");
        assert_eq!(expired[0].state, ContextState::Expired);
        assert_eq!(g.key_count(), 0);

        // A fresh context may open for a freed key.
        assert_eq!(g.ingest_at(event("A", "done"), later).await, GateResult::StillCollecting);
    }

    #[tokio::test]
    async fn stale_context_is_replaced_on_ingest() {
        let g = gate();
        let t0 = Utc::now();
        g.ingest_at(event("A", "k"), t0).await;

        let later = t0 + chrono::Duration::seconds(120);
        assert_eq!(g.ingest_at(event("B", "k"), later).await, GateResult::StillCollecting);

        let expired = g.sweep_at(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].seen.get("A"), Some(&1));
    }

    #[tokio::test]
    async fn a_held_key_does_not_block_other_keys() {
        let g = gate();
        let t0 = Utc::now();
        let _held = g.locks.lock("busy").await;

        let other = tokio::time::timeout(Duration::from_secs(1), g.ingest_at(event("A", "free"), t0));
        assert_eq!(other.await, Ok(GateResult::StillCollecting));

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), g.ingest_at(event("A", "busy"), t0));
        assert!(blocked.await.is_err());
    }
}
