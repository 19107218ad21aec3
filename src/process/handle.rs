// src/process/handle.rs

//! Uniform handle over one backend process.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::BoxFuture;
use crate::process::error::{StartError, StopError};
use crate::process::io::{
    ExitCode, ExitSignal, FORCED_KILL_EXIT_CODE, LineStream, OutputChannel, ProcessIo, Transcript,
};
use crate::types::RuntimeMode;

/// How long a forced kill (or a release) may take before it is abandoned and
/// the exit recorded synthetically.
pub const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Far enough ahead to never fire in practice.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// `base + after`, saturating to a far-future instant instead of overflowing
/// on absurd configured timeouts.
pub fn deadline_after(base: Instant, after: Duration) -> Instant {
    base.checked_add(after)
        .unwrap_or_else(|| base + FAR_FUTURE)
}

/// Substrate-specific half of a [`ProcessHandle`].
///
/// Drivers report output and exit through the [`ProcessIo`] passed to
/// `start`. They must only report exit after every output line has been
/// forwarded.
pub trait ProcessDriver: Send {
    /// Backend id (PID, container id, pod name) once known.
    fn process_id(&self) -> Option<String>;

    /// Launch the process. Must honour `cancel` while blocked on the backend
    /// and leave nothing running when it returns an error.
    fn start<'a>(
        &'a mut self,
        io: &'a ProcessIo,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), StartError>>;

    /// Ask the process to exit gracefully within `grace`.
    fn terminate(&mut self, grace: Duration) -> BoxFuture<'_, Result<(), StopError>>;

    /// Kill the process immediately.
    fn kill(&mut self) -> BoxFuture<'_, Result<(), StopError>>;

    /// Release every backend resource (pipes, containers, workload objects).
    /// Called exactly once, whether or not `start` succeeded.
    fn release(&mut self) -> BoxFuture<'_, Result<(), StopError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Created,
    Started,
    StartFailed,
}

/// One execution attempt's process, whatever the backend.
///
/// Owned by the controller entry that created it; consumed by
/// [`dispose`](ProcessHandle::dispose).
pub struct ProcessHandle {
    mode: RuntimeMode,
    label: String,
    driver: Box<dyn ProcessDriver>,
    io: ProcessIo,
    state: HandleState,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("mode", &self.mode)
            .field("label", &self.label)
            .field("process_id", &self.driver.process_id())
            .field("state", &self.state)
            .field("exit_code", &self.io.exit_code())
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    pub fn new(mode: RuntimeMode, label: impl Into<String>, driver: Box<dyn ProcessDriver>) -> Self {
        Self {
            mode,
            label: label.into(),
            driver,
            io: ProcessIo::new(),
            state: HandleState::Created,
        }
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn process_id(&self) -> Option<String> {
        self.driver.process_id()
    }

    pub fn is_started(&self) -> bool {
        self.state == HandleState::Started
    }

    pub fn has_exited(&self) -> bool {
        self.io.exit_code().is_some()
    }

    /// `None` until the process exits.
    pub fn exit_code(&self) -> Option<ExitCode> {
        self.io.exit_code()
    }

    pub fn exited(&self) -> ExitSignal {
        self.io.exit_signal()
    }

    pub fn standard_output(&self) -> LineStream {
        self.io.subscribe(OutputChannel::Stdout)
    }

    pub fn standard_error(&self) -> LineStream {
        self.io.subscribe(OutputChannel::Stderr)
    }

    pub fn transcript(&self) -> Transcript {
        self.io.transcript()
    }

    /// Bumped whenever the process prints a line.
    pub fn activity(&self) -> watch::Receiver<Instant> {
        self.io.activity()
    }

    /// Launch the process. A handle can be started at most once.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<(), StartError> {
        if self.state != HandleState::Created {
            return Err(StartError::AlreadyStarted);
        }

        match self.driver.start(&self.io, cancel).await {
            Ok(()) => {
                self.state = HandleState::Started;
                info!(
                    process = %self.label,
                    mode = %self.mode,
                    pid = ?self.driver.process_id(),
                    "process started"
                );
                Ok(())
            }
            Err(e) => {
                self.state = HandleState::StartFailed;
                Err(e)
            }
        }
    }

    /// Stop the process: graceful request, then a forced kill once `grace`
    /// elapses. A zero `grace` kills straight away.
    ///
    /// Every backend call is bounded; the handle is exited when this returns,
    /// whatever the result.
    pub async fn stop(&mut self, grace: Duration) -> Result<(), StopError> {
        if self.state != HandleState::Started || self.has_exited() {
            return Ok(());
        }

        let mut exit = self.io.exit_signal();
        let mut first_error = None;

        if !grace.is_zero() {
            debug!(process = %self.label, ?grace, "requesting graceful stop");
            let deadline = deadline_after(Instant::now(), grace);
            match timeout_at(deadline, self.driver.terminate(grace)).await {
                Ok(Ok(())) => {
                    if timeout_at(deadline, exit.wait()).await.is_ok() {
                        return Ok(());
                    }
                    info!(process = %self.label, ?grace, "grace period elapsed; killing process");
                }
                Ok(Err(e)) => {
                    warn!(process = %self.label, error = %e, "graceful stop failed; killing process");
                    first_error = Some(e);
                }
                Err(_) => {
                    warn!(process = %self.label, ?grace, "graceful stop request hung; killing process");
                    first_error = Some(StopError::Timeout {
                        operation: "terminate",
                        after: grace,
                    });
                }
            }
        }

        let deadline = deadline_after(Instant::now(), KILL_CONFIRM_TIMEOUT);
        match timeout_at(deadline, self.driver.kill()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(process = %self.label, error = %e, "kill request failed");
                first_error.get_or_insert(e);
            }
            Err(_) => {
                warn!(process = %self.label, "kill request hung; recording synthetic exit");
                self.io.emit_exit(FORCED_KILL_EXIT_CODE);
                return Err(StopError::Timeout {
                    operation: "kill",
                    after: KILL_CONFIRM_TIMEOUT,
                });
            }
        }

        match timeout_at(deadline, exit.wait()).await {
            Ok(_) => first_error.map_or(Ok(()), Err),
            Err(_) => {
                warn!(process = %self.label, "kill not confirmed; recording synthetic exit");
                self.io.emit_exit(FORCED_KILL_EXIT_CODE);
                Err(StopError::KillUnconfirmed(KILL_CONFIRM_TIMEOUT))
            }
        }
    }

    /// Release all backend resources. Failures are logged; the handle is
    /// gone either way.
    pub async fn dispose(mut self) {
        match timeout(KILL_CONFIRM_TIMEOUT, self.driver.release()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(process = %self.label, error = %e, "failed to release process resources")
            }
            Err(_) => warn!(
                process = %self.label,
                after = ?KILL_CONFIRM_TIMEOUT,
                "releasing process resources hung; abandoning"
            ),
        }
        if self.state == HandleState::Started && self.io.emit_exit(FORCED_KILL_EXIT_CODE) {
            debug!(process = %self.label, "disposed before exit was reported");
        }
        debug!(process = %self.label, "process handle disposed");
    }
}
