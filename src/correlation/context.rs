// src/correlation/context.rs

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Collecting,
    Satisfied,
    Expired,
}

/// Events accumulated for one rule and key.
#[derive(Debug, Clone)]
pub struct CorrelationContext {
    rule: String,
    key: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    events: Vec<Event>,
    seen: BTreeMap<String, u32>,
    state: ContextState,
}

impl CorrelationContext {
    pub fn new(rule: &str, key: &str, now: DateTime<Utc>, ttl: Duration) -> Self {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            rule: rule.to_string(),
            key: key.to_string(),
            created_at: now,
            expires_at,
            events: Vec::new(),
            seen: BTreeMap::new(),
            state: ContextState::Collecting,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn seen(&self) -> &BTreeMap<String, u32> {
        &self.seen
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn record(&mut self, event: Event) {
        *self.seen.entry(event.event_type.clone()).or_insert(0) += 1;
        self.events.push(event);
    }

    pub(super) fn mark(&mut self, state: ContextState) {
        self.state = state;
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            rule: self.rule.clone(),
            key: self.key.clone(),
            state: self.state,
            created_at: self.created_at,
            expires_at: self.expires_at,
            seen: self.seen.clone(),
            events: self.events.clone(),
        }
    }
}

/// Serializable view of a context; the input of the instance a satisfied
/// correlation starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub rule: String,
    pub key: String,
    pub state: ContextState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub seen: BTreeMap<String, u32>,
    pub events: Vec<Event>,
}
