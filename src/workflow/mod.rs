// src/workflow/mod.rs

//! Workflow resources: versioned definitions and the instances the controller
//! reconciles.
//!
//! - [`definition`] holds the immutable, versioned [`WorkflowDefinition`] and
//!   its `id@version` reference.
//! - [`instance`] holds [`WorkflowInstance`], its status graph and the fault
//!   summary recorded on failure.

pub mod definition;
pub mod instance;

pub use definition::{DefinitionRef, WorkflowDefinition};
pub use instance::{DesiredState, FaultCause, InstanceError, InstanceStatus, WorkflowInstance};
