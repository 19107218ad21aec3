// src/correlation/mod.rs

//! Event correlation ahead of instance creation.
//!
//! A [`CorrelationRule`] says which events belong together (filters plus a
//! key attribute) and when enough has been seen (a completion predicate).
//! One [`CorrelationGate`] per rule tracks a context per key; the
//! [`CorrelationListener`] feeds it from the bus and creates an
//! `event-triggered` instance whenever a context is satisfied.

pub mod context;
pub mod gate;
pub mod listener;
pub mod rule;

pub use context::{ContextSnapshot, ContextState, CorrelationContext};
pub use gate::{CorrelationGate, GateResult, RejectReason};
pub use listener::CorrelationListener;
pub use rule::{CompletionPredicate, CorrelationRule, EventFilter, GateError};
