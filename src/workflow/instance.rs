// src/workflow/instance.rs

//! Workflow instance resource and its status graph.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{FlowhostError, Result};
use crate::types::ActivationType;
use crate::workflow::DefinitionRef;

/// Observed lifecycle status of an instance.
///
/// Allowed edges:
///
/// ```text
/// Pending   -> Running | Faulted | Cancelled
/// Running   -> Completed | Faulted | Suspended | Cancelled
/// Suspended -> Running | Faulted | Cancelled
/// ```
///
/// Nothing re-enters `Pending` and terminal states have no outgoing edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Suspended,
    Faulted,
    Completed,
    Cancelled,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 6] = [
        InstanceStatus::Pending,
        InstanceStatus::Running,
        InstanceStatus::Suspended,
        InstanceStatus::Faulted,
        InstanceStatus::Completed,
        InstanceStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Faulted | InstanceStatus::Completed | InstanceStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Faulted | Cancelled)
                | (Running, Completed | Faulted | Suspended | Cancelled)
                | (Suspended, Running | Faulted | Cancelled)
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Suspended => "suspended",
            InstanceStatus::Faulted => "faulted",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What the owner of the resource wants to happen to it.
///
/// The controller compares this with [`InstanceStatus`] on every watch event
/// and issues suspend/resume/terminate as needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Run,
    Suspend,
    Cancel,
}

impl Default for DesiredState {
    fn default() -> Self {
        DesiredState::Run
    }
}

/// Classified reason an instance faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultCause {
    /// Substrate unreachable.
    BackendUnavailable,
    /// Bad definition or instance data.
    InvalidSpec,
    /// Quota or capacity exhausted.
    ResourceExhausted,
    /// Liveness or operation deadline exceeded.
    Timeout,
    /// The workflow process reported failure.
    ProcessExitedNonZero,
    AlreadyStarted,
    InvalidTransition,
    Unknown,
}

impl FaultCause {
    /// Whether another attempt may succeed without changing the inputs.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FaultCause::BackendUnavailable | FaultCause::ResourceExhausted
        )
    }
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultCause::BackendUnavailable => "backend unavailable",
            FaultCause::InvalidSpec => "invalid spec",
            FaultCause::ResourceExhausted => "resource exhausted",
            FaultCause::Timeout => "timeout",
            FaultCause::ProcessExitedNonZero => "process exited non-zero",
            FaultCause::AlreadyStarted => "already started",
            FaultCause::InvalidTransition => "invalid transition",
            FaultCause::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Error summary recorded on a faulted instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceError {
    pub cause: FaultCause,
    pub message: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stderr_tail: Vec<String>,
    pub attempt: u32,
}

impl InstanceError {
    pub fn new(cause: FaultCause, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            cause,
            message: message.into(),
            exit_code: None,
            stderr_tail: Vec::new(),
            attempt,
        }
    }

    /// Human-readable one-line summary.
    pub fn summary(&self) -> String {
        match self.exit_code {
            Some(code) => format!(
                "{} (exit code {code}, attempt {}): {}",
                self.cause, self.attempt, self.message
            ),
            None => format!("{} (attempt {}): {}", self.cause, self.attempt, self.message),
        }
    }
}

impl fmt::Display for InstanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// A single execution of a [`WorkflowDefinition`](crate::workflow::WorkflowDefinition).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub definition: DefinitionRef,
    #[serde(default)]
    pub activation: ActivationType,
    #[serde(default)]
    pub input: Value,
    pub status: InstanceStatus,
    #[serde(default)]
    pub desired: DesiredState,
    /// Number of launch attempts made so far (create + start).
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Output accumulated by the most recent attempt that produced one.
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<InstanceError>,
    /// Backend id of the live process (PID, container id, pod name).
    #[serde(default)]
    pub process_id: Option<String>,
}

impl WorkflowInstance {
    pub fn new(id: impl Into<String>, definition: DefinitionRef, input: Value) -> Self {
        Self {
            id: id.into(),
            definition,
            activation: ActivationType::Manual,
            input,
            status: InstanceStatus::Pending,
            desired: DesiredState::Run,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            output: None,
            error: None,
            process_id: None,
        }
    }

    pub fn with_activation(mut self, activation: ActivationType) -> Self {
        self.activation = activation;
        self
    }

    /// Input handed to the next attempt: prior output when there is one
    /// (resume), otherwise the original input.
    pub fn launch_input(&self) -> Value {
        self.output.clone().unwrap_or_else(|| self.input.clone())
    }

    /// Move to `next`, stamping start/end timestamps.
    ///
    /// Fails with `InvalidTransition` for edges outside the status graph.
    pub fn transition_to(&mut self, next: InstanceStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FlowhostError::InvalidTransition {
                instance: self.id.clone(),
                from: self.status,
                to: next,
            });
        }

        if next == InstanceStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
            self.process_id = None;
        }
        if next == InstanceStatus::Suspended {
            self.process_id = None;
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new("wf-1", DefinitionRef::new("echo", "v1"), json!({"x": 1}))
    }

    #[test]
    fn nothing_re_enters_pending() {
        for status in InstanceStatus::ALL {
            assert!(!status.can_transition_to(InstanceStatus::Pending));
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in InstanceStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in InstanceStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn suspended_only_reachable_from_running() {
        for from in InstanceStatus::ALL {
            let allowed = from.can_transition_to(InstanceStatus::Suspended);
            assert_eq!(allowed, from == InstanceStatus::Running, "{from}");
        }
    }

    #[test]
    fn transition_stamps_timestamps() {
        let mut inst = instance();
        let t0 = Utc::now();
        inst.transition_to(InstanceStatus::Running, t0).unwrap();
        assert_eq!(inst.started_at, Some(t0));
        assert!(inst.ended_at.is_none());

        let t1 = t0 + chrono::Duration::seconds(5);
        inst.transition_to(InstanceStatus::Completed, t1).unwrap();
        assert_eq!(inst.started_at, Some(t0));
        assert_eq!(inst.ended_at, Some(t1));
    }

    #[test]
    fn invalid_transition_is_reported() {
        let mut inst = instance();
        let err = inst
            .transition_to(InstanceStatus::Suspended, Utc::now())
            .unwrap_err();
        match err {
            FlowhostError::InvalidTransition { from, to, .. } => {
                assert_eq!(from, InstanceStatus::Pending);
                assert_eq!(to, InstanceStatus::Suspended);
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
        assert_eq!(inst.status, InstanceStatus::Pending);
    }

    #[test]
    fn launch_input_prefers_prior_output() {
        let mut inst = instance();
        assert_eq!(inst.launch_input(), json!({"x": 1}));
        inst.output = Some(json!({"y": 2}));
        assert_eq!(inst.launch_input(), json!({"y": 2}));
    }

    #[test]
    fn error_summary_mentions_exit_code() {
        let mut err = InstanceError::new(FaultCause::ProcessExitedNonZero, "killed", 1);
        err.exit_code = Some(137);
        assert_eq!(
            err.summary(),
            "process exited non-zero (exit code 137, attempt 1): killed"
        );
    }
}
