// src/controller/transitions.rs

//! Pure decision logic for the controller.
//!
//! Nothing here touches a backend, the store or the clock. The async shell
//! in `controller/runtime.rs` gathers the facts (instance resource, whether a live
//! handle exists, how a process exited) and acts on what these functions
//! return.

use std::time::Duration;

use serde_json::Value;

use crate::backend::CreateError;
use crate::process::{ExitCode, StartError, Transcript};
use crate::types::RuntimeMode;
use crate::workflow::{DesiredState, FaultCause, InstanceError, InstanceStatus, WorkflowInstance};

/// Attempt output: the last non-blank stdout line, parsed as JSON when it is
/// JSON and kept as a string otherwise.
pub fn parse_output(transcript: &Transcript) -> Option<Value> {
    let line = transcript.last_stdout.as_deref()?.trim();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string())))
}

/// What a process exit means for its instance.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitDisposition {
    Completed { output: Option<Value> },
    Faulted(InstanceError),
}

pub fn classify_exit(code: ExitCode, transcript: &Transcript, attempt: u32) -> ExitDisposition {
    if code == 0 {
        return ExitDisposition::Completed {
            output: parse_output(transcript),
        };
    }

    let message = match transcript.stderr_tail.back() {
        Some(last) => format!("process exited with code {code}: {last}"),
        None if code < 0 => format!("process terminated by signal {}", -code),
        None => format!("process exited with code {code}"),
    };
    let mut error = InstanceError::new(FaultCause::ProcessExitedNonZero, message, attempt);
    error.exit_code = Some(code);
    error.stderr_tail = transcript.stderr_tail.iter().cloned().collect();
    ExitDisposition::Faulted(error)
}

/// Why an attempt never reached `Running`.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchFailure {
    Definition(String),
    Unsupported(RuntimeMode),
    Create(CreateError),
    Start(StartError),
    Timeout(Duration),
}

impl LaunchFailure {
    pub fn cause(&self) -> FaultCause {
        match self {
            LaunchFailure::Definition(_) | LaunchFailure::Unsupported(_) => FaultCause::InvalidSpec,
            LaunchFailure::Create(e) => e.fault_cause(),
            LaunchFailure::Start(e) => e.fault_cause(),
            LaunchFailure::Timeout(_) => FaultCause::Timeout,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.cause().is_retryable()
    }

    pub fn message(&self) -> String {
        match self {
            LaunchFailure::Definition(msg) => msg.clone(),
            LaunchFailure::Unsupported(mode) => format!("no runtime backend for mode '{mode}'"),
            LaunchFailure::Create(e) => format!("create failed: {e}"),
            LaunchFailure::Start(e) => format!("start failed: {e}"),
            LaunchFailure::Timeout(limit) => {
                format!("create and start did not finish within {limit:?}")
            }
        }
    }

    pub fn to_instance_error(&self, attempt: u32) -> InstanceError {
        InstanceError::new(self.cause(), self.message(), attempt)
    }
}

/// Next step for one instance, given its resource and the live-handle
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// First attempt of a pending instance.
    Launch,
    Suspend,
    Resume,
    Terminate,
    /// The resource says `Running` but no handle exists: the process was
    /// lost (daemon crash). Fault it.
    FaultLost,
    /// A handle outlived its instance's terminal status.
    Release,
    None,
}

/// Decide what to do about `instance`.
///
/// `live`: a started handle is registered. `launching`: an attempt is
/// scheduled (retry backoff) or in flight.
pub fn plan(instance: &WorkflowInstance, live: bool, launching: bool) -> ReconcileAction {
    use InstanceStatus::*;

    if instance.status.is_terminal() {
        return if live {
            ReconcileAction::Release
        } else {
            ReconcileAction::None
        };
    }
    if instance.desired == DesiredState::Cancel {
        return ReconcileAction::Terminate;
    }

    match (instance.status, instance.desired) {
        (Pending, DesiredState::Run) if !live && !launching => ReconcileAction::Launch,
        (Running, DesiredState::Suspend) if live => ReconcileAction::Suspend,
        (Running, _) if !live && !launching => ReconcileAction::FaultLost,
        (Suspended, DesiredState::Run) if !live && !launching => ReconcileAction::Resume,
        _ => ReconcileAction::None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use serde_json::json;

    use super::*;
    use crate::backend::CreateErrorKind;
    use crate::workflow::DefinitionRef;

    fn transcript(stdout: Option<&str>, stderr: &[&str]) -> Transcript {
        Transcript {
            last_stdout: stdout.map(str::to_string),
            stderr_tail: stderr.iter().map(|s| s.to_string()).collect::<VecDeque<_>>(),
            stdout_lines: u64::from(stdout.is_some()),
            stderr_lines: stderr.len() as u64,
        }
    }

    fn instance(status: InstanceStatus, desired: DesiredState) -> WorkflowInstance {
        let mut inst = WorkflowInstance::new("wf-1", DefinitionRef::new("echo", "v1"), json!({}));
        inst.status = status;
        inst.desired = desired;
        inst
    }

    #[test]
    fn zero_exit_completes_with_json_output() {
        let d = classify_exit(0, &transcript(Some("{\"y\":2}"), &[]), 1);
        assert_eq!(
            d,
            ExitDisposition::Completed {
                output: Some(json!({"y": 2}))
            }
        );
    }

    #[test]
    fn non_json_output_is_kept_as_string() {
        let out = parse_output(&transcript(Some("all done"), &[]));
        assert_eq!(out, Some(json!("all done")));
        assert_eq!(parse_output(&transcript(None, &[])), None);
    }

    #[test]
    fn non_zero_exit_faults_with_code_and_tail() {
        let d = classify_exit(137, &transcript(None, &["oom", "killed"]), 2);
        let ExitDisposition::Faulted(err) = d else {
            panic!("expected fault");
        };
        assert_eq!(err.cause, FaultCause::ProcessExitedNonZero);
        assert_eq!(err.exit_code, Some(137));
        assert_eq!(err.stderr_tail, vec!["oom", "killed"]);
        assert_eq!(err.attempt, 2);
        assert!(err.message.ends_with("killed"));
    }

    #[test]
    fn launch_failures_classify_retryability() {
        let unreachable = LaunchFailure::Create(CreateError::new(
            CreateErrorKind::BackendUnreachable,
            "daemon down",
        ));
        assert!(unreachable.is_retryable());

        let bad = LaunchFailure::Start(StartError::ExecutableNotFound("runner".into()));
        assert!(!bad.is_retryable());
        assert_eq!(bad.cause(), FaultCause::InvalidSpec);

        let err = LaunchFailure::Timeout(Duration::from_secs(1)).to_instance_error(3);
        assert_eq!(err.cause, FaultCause::Timeout);
        assert_eq!(err.attempt, 3);
    }

    #[test]
    fn plan_follows_desired_state() {
        use InstanceStatus::*;

        assert_eq!(plan(&instance(Pending, DesiredState::Run), false, false), ReconcileAction::Launch);
        assert_eq!(plan(&instance(Pending, DesiredState::Run), false, true), ReconcileAction::None);
        assert_eq!(plan(&instance(Running, DesiredState::Run), true, false), ReconcileAction::None);
        assert_eq!(plan(&instance(Running, DesiredState::Suspend), true, false), ReconcileAction::Suspend);
        assert_eq!(plan(&instance(Suspended, DesiredState::Run), false, false), ReconcileAction::Resume);
        assert_eq!(plan(&instance(Suspended, DesiredState::Suspend), false, false), ReconcileAction::None);
        assert_eq!(plan(&instance(Running, DesiredState::Run), false, false), ReconcileAction::FaultLost);
        assert_eq!(plan(&instance(Suspended, DesiredState::Cancel), false, false), ReconcileAction::Terminate);
    }

    #[test]
    fn terminal_instances_only_release_leftovers() {
        for status in [InstanceStatus::Completed, InstanceStatus::Faulted, InstanceStatus::Cancelled] {
            assert_eq!(plan(&instance(status, DesiredState::Cancel), false, false), ReconcileAction::None);
            assert_eq!(plan(&instance(status, DesiredState::Run), true, false), ReconcileAction::Release);
        }
    }
}
