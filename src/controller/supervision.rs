// src/controller/supervision.rs

//! Watches one started attempt until it exits or overstays.

use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::controller::ControllerOptions;
use crate::process::{ExitCode, ExitSignal, FORCED_KILL_EXIT_CODE, deadline_after};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionOutcome {
    Exited(ExitCode),
    /// Still running after `liveness_timeout`.
    LivenessExpired,
    /// Silent for `output_idle_timeout`.
    OutputIdle,
}

/// Wait for the first of: exit, liveness deadline, output-idle deadline.
///
/// Returns `None` when `cancel` fires first, i.e. another operation took
/// ownership of the handle.
pub async fn supervise(
    mut exit: ExitSignal,
    mut activity: watch::Receiver<Instant>,
    options: &ControllerOptions,
    cancel: &CancellationToken,
) -> Option<SupervisionOutcome> {
    let started = Instant::now();
    let run_deadline = deadline_after(started, options.liveness_timeout);
    let mut activity_open = true;

    loop {
        let last_output = (*activity.borrow_and_update()).max(started);
        let idle_deadline = options
            .output_idle_timeout
            .map(|idle| deadline_after(last_output, idle));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            code = exit.wait() => {
                return Some(SupervisionOutcome::Exited(code.unwrap_or(FORCED_KILL_EXIT_CODE)));
            }
            _ = sleep_until(run_deadline) => return Some(SupervisionOutcome::LivenessExpired),
            _ = sleep_until(idle_deadline.unwrap_or(run_deadline)), if idle_deadline.is_some() => {
                return Some(SupervisionOutcome::OutputIdle);
            }
            changed = activity.changed(), if activity_open => {
                if changed.is_err() {
                    activity_open = false;
                }
            }
        }
    }
}
