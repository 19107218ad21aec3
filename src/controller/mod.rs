// src/controller/mod.rs

//! Workflow instance controller.
//!
//! This module ties together:
//! - the pure decision logic (exit classification, launch failure
//!   classification, reconcile planning) in [`transitions`],
//! - the per-instance live-handle table in [`registry`],
//! - the exit / liveness watcher spawned for each started attempt in
//!   [`supervision`],
//! - the async shell that performs launch, suspend, resume and terminate in
//!   [`runtime`], and the store watch loop in [`reconcile`],
//! - timeouts and retry/backoff settings in [`policy`].

pub mod policy;
pub mod reconcile;
pub mod registry;
pub mod runtime;
pub mod supervision;
pub mod transitions;

pub use policy::{ControllerOptions, RetryPolicy};
pub use registry::{ActiveProcess, ProcessRegistry};
pub use runtime::WorkflowController;
pub use supervision::{SupervisionOutcome, supervise};
pub use transitions::{
    ExitDisposition, LaunchFailure, ReconcileAction, classify_exit, parse_output, plan,
};
