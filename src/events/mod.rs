// src/events/mod.rs

//! Event model and bus.
//!
//! The controller publishes instance lifecycle notifications here and the
//! correlation listener consumes trigger events from it. [`MemoryEventBus`]
//! is the in-process implementation; other transports implement
//! [`EventBus`].

pub mod bus;
pub mod event;
pub mod lifecycle;

pub use bus::{EventBus, EventPredicate, EventSubscription, MemoryEventBus, any_event};
pub use event::Event;
pub use lifecycle::{
    CONTROLLER_SOURCE, CORRELATION_EXPIRED_TYPE, LifecycleKind, lifecycle_event,
};
