// src/backend/native.rs

//! Native backend: one local runner process per attempt.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::BoxFuture;
use crate::backend::{
    CreateError, LaunchContext, RuntimeBackend, process_label, runner_environment,
};
use crate::config::{ApiSection, NativeSection};
use crate::process::{
    ExitCode, OutputChannel, ProcessDriver, ProcessHandle, ProcessIo, StartError, StopError,
    spawn_line_pump,
};
use crate::types::RuntimeMode;
use crate::workflow::{WorkflowDefinition, WorkflowInstance};

/// How long the monitor waits for output pipes to drain after exit.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Spawns the configured runner executable.
#[derive(Debug, Clone)]
pub struct NativeBackend {
    config: NativeSection,
    api: ApiSection,
}

impl NativeBackend {
    pub fn new(config: NativeSection, api: ApiSection) -> Self {
        Self { config, api }
    }

    fn check_spec(&self) -> Result<(), CreateError> {
        let exe = &self.config.executable;
        // Bare names are resolved through PATH at spawn time.
        if exe.components().count() > 1 && !exe.exists() {
            return Err(CreateError::invalid_spec(format!(
                "runner executable {} does not exist",
                exe.display()
            )));
        }
        if let Some(dir) = &self.config.working_directory {
            if !dir.is_dir() {
                return Err(CreateError::invalid_spec(format!(
                    "working directory {} does not exist",
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}

impl RuntimeBackend for NativeBackend {
    fn mode(&self) -> RuntimeMode {
        RuntimeMode::Native
    }

    fn create_process<'a>(
        &'a self,
        definition: &'a WorkflowDefinition,
        instance: &'a WorkflowInstance,
        ctx: &'a LaunchContext,
    ) -> BoxFuture<'a, Result<ProcessHandle, CreateError>> {
        Box::pin(async move {
            if ctx.cancel.is_cancelled() {
                return Err(CreateError::cancelled());
            }
            self.check_spec()?;

            let mut cmd = Command::new(&self.config.executable);
            cmd.args(&self.config.args);
            if let Some(dir) = &self.config.working_directory {
                cmd.current_dir(dir);
            }
            cmd.envs(&self.config.env);
            cmd.envs(runner_environment(definition, instance, ctx, &self.api));
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let label = process_label(instance, ctx);
            debug!(
                process = %label,
                executable = %self.config.executable.display(),
                "prepared native process"
            );
            let driver = NativeDriver::new(cmd, self.config.executable.clone(), label.clone());
            Ok(ProcessHandle::new(RuntimeMode::Native, label, Box::new(driver)))
        })
    }
}

/// Drives one spawned child.
///
/// A monitor task owns the `Child`; kill requests reach it over a oneshot
/// channel, exactly like a cancelled task run.
pub struct NativeDriver {
    command: Option<Command>,
    executable: PathBuf,
    label: String,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl NativeDriver {
    fn new(command: Command, executable: PathBuf, label: String) -> Self {
        Self {
            command: Some(command),
            executable,
            label,
            pid: None,
            kill_tx: None,
            monitor: None,
        }
    }
}

impl ProcessDriver for NativeDriver {
    fn process_id(&self) -> Option<String> {
        self.pid.map(|p| p.to_string())
    }

    fn start<'a>(
        &'a mut self,
        io: &'a ProcessIo,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), StartError>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(StartError::Cancelled);
            }
            let Some(mut cmd) = self.command.take() else {
                return Err(StartError::AlreadyStarted);
            };

            let mut child = cmd
                .spawn()
                .map_err(|e| spawn_failure(&self.executable, &e))?;
            self.pid = child.id();

            let stdout = child.stdout.take().map(|out| {
                spawn_line_pump(out, io.clone(), OutputChannel::Stdout, self.label.clone())
            });
            let stderr = child.stderr.take().map(|err| {
                spawn_line_pump(err, io.clone(), OutputChannel::Stderr, self.label.clone())
            });

            let (kill_tx, kill_rx) = oneshot::channel();
            self.kill_tx = Some(kill_tx);
            self.monitor = Some(tokio::spawn(monitor_child(
                child,
                kill_rx,
                [stdout, stderr],
                io.clone(),
                self.label.clone(),
            )));
            Ok(())
        })
    }

    fn terminate(&mut self, _grace: Duration) -> BoxFuture<'_, Result<(), StopError>> {
        Box::pin(async move {
            let Some(pid) = self.pid else {
                return Ok(());
            };
            send_sigterm(pid)
        })
    }

    fn kill(&mut self) -> BoxFuture<'_, Result<(), StopError>> {
        Box::pin(async move {
            if let Some(tx) = self.kill_tx.take() {
                // Monitor already gone means the child already exited.
                let _ = tx.send(());
            }
            Ok(())
        })
    }

    fn release(&mut self) -> BoxFuture<'_, Result<(), StopError>> {
        Box::pin(async move {
            self.command = None;
            if let Some(tx) = self.kill_tx.take() {
                let _ = tx.send(());
            }
            if let Some(mut monitor) = self.monitor.take() {
                if timeout(PIPE_DRAIN_TIMEOUT * 2, &mut monitor).await.is_err() {
                    warn!(process = %self.label, "process monitor did not finish; aborting");
                    monitor.abort();
                }
            }
            Ok(())
        })
    }
}

async fn monitor_child(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    pumps: [Option<JoinHandle<()>>; 2],
    io: ProcessIo,
    label: String,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        request = &mut kill_rx => {
            match request {
                Ok(()) => info!(process = %label, "killing process"),
                Err(_) => debug!(process = %label, "driver dropped; killing process"),
            }
            if let Err(e) = child.start_kill() {
                warn!(process = %label, error = %e, "failed to kill process");
            }
            child.wait().await
        }
    };

    for pump in pumps.into_iter().flatten() {
        if timeout(PIPE_DRAIN_TIMEOUT, pump).await.is_err() {
            debug!(process = %label, "output pipe still open after exit");
        }
    }

    let code = match status {
        Ok(status) => exit_code_of(status),
        Err(e) => {
            warn!(process = %label, error = %e, "waiting for process failed");
            crate::process::FORCED_KILL_EXIT_CODE
        }
    };
    info!(process = %label, exit_code = code, "process exited");
    io.emit_exit(code);
}

/// Exit code, or `-signal` when the process was killed by a signal.
fn exit_code_of(status: ExitStatus) -> ExitCode {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

fn spawn_failure(executable: &Path, e: &std::io::Error) -> StartError {
    let what = executable.display().to_string();
    match e.kind() {
        std::io::ErrorKind::NotFound => StartError::ExecutableNotFound(what),
        std::io::ErrorKind::PermissionDenied => StartError::PermissionDenied(what),
        _ if is_resource_exhaustion(e) => StartError::ResourceExhausted(format!("{what}: {e}")),
        _ => StartError::BackendUnavailable(format!("spawning {what}: {e}")),
    }
}

#[cfg(unix)]
fn is_resource_exhaustion(e: &std::io::Error) -> bool {
    use nix::errno::Errno;

    matches!(
        e.raw_os_error().map(Errno::from_raw),
        Some(Errno::EAGAIN | Errno::EMFILE | Errno::ENFILE | Errno::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_e: &std::io::Error) -> bool {
    false
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<(), StopError> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return Err(StopError::Backend(format!("pid {pid} out of range")));
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        // Already gone.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(StopError::Backend(format!("SIGTERM to pid {pid}: {err}"))),
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> Result<(), StopError> {
    // No graceful signal available; the caller escalates to kill after grace.
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::workflow::DefinitionRef;

    fn backend(script: &str) -> NativeBackend {
        NativeBackend::new(
            NativeSection {
                executable: PathBuf::from("sh"),
                args: vec!["-c".into(), script.into()],
                working_directory: None,
                env: BTreeMap::from([("EXTRA".to_string(), "1".to_string())]),
            },
            ApiSection::default(),
        )
    }

    async fn launch(backend: &NativeBackend) -> ProcessHandle {
        let def = WorkflowDefinition::new("echo", "v1", json!({}));
        let inst = WorkflowInstance::new("wf-1", DefinitionRef::new("echo", "v1"), json!({"x": 1}));
        let ctx = LaunchContext::new(1, inst.input.clone());
        let mut handle = backend.create_process(&def, &inst, &ctx).await.unwrap();
        handle.start(&ctx.cancel).await.unwrap();
        handle
    }

    #[tokio::test]
    async fn runner_sees_environment_and_output_is_captured() {
        let b = backend("echo \"$FLOWHOST_INSTANCE_ID $FLOWHOST_INPUT $EXTRA\"; echo oops >&2; exit 3");
        let handle = launch(&b).await;

        let code = handle.exited().wait().await;
        assert_eq!(code, Some(3));
        let t = handle.transcript();
        assert_eq!(t.last_stdout.as_deref(), Some("wf-1 {\"x\":1} 1"));
        assert_eq!(t.stderr_tail.back().map(String::as_str), Some("oops"));
        handle.dispose().await;
    }

    #[tokio::test]
    async fn graceful_stop_delivers_sigterm() {
        let b = backend("trap 'exit 0' TERM; while true; do sleep 0.05; done");
        let mut handle = launch(&b).await;
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        handle.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(handle.exit_code(), Some(0));
        handle.dispose().await;
    }

    #[test]
    fn sigterm_rejects_out_of_range_pid() {
        let err = send_sigterm(u32::MAX).unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }

    #[tokio::test]
    async fn kill_reports_negative_signal() {
        let b = backend("exec sleep 30");
        let mut handle = launch(&b).await;

        handle.stop(Duration::ZERO).await.unwrap();
        assert_eq!(handle.exit_code(), Some(-9));
        handle.dispose().await;
    }

    #[tokio::test]
    async fn missing_executable_fails_start() {
        let b = NativeBackend::new(
            NativeSection {
                executable: PathBuf::from("flowhost-runner-that-does-not-exist"),
                args: vec![],
                working_directory: None,
                env: BTreeMap::new(),
            },
            ApiSection::default(),
        );
        let def = WorkflowDefinition::new("echo", "v1", json!({}));
        let inst = WorkflowInstance::new("wf-1", DefinitionRef::new("echo", "v1"), json!({}));
        let ctx = LaunchContext::new(1, json!({}));
        let mut handle = b.create_process(&def, &inst, &ctx).await.unwrap();

        let err = handle.start(&ctx.cancel).await.unwrap_err();
        assert!(matches!(err, StartError::ExecutableNotFound(_)), "{err:?}");
        handle.dispose().await;
    }

    #[tokio::test]
    async fn missing_absolute_executable_is_invalid_spec() {
        let b = NativeBackend::new(
            NativeSection {
                executable: PathBuf::from("/nonexistent/flowhost-runner"),
                args: vec![],
                working_directory: None,
                env: BTreeMap::new(),
            },
            ApiSection::default(),
        );
        let def = WorkflowDefinition::new("echo", "v1", json!({}));
        let inst = WorkflowInstance::new("wf-1", DefinitionRef::new("echo", "v1"), json!({}));
        let ctx = LaunchContext::new(1, json!({}));

        let err = b.create_process(&def, &inst, &ctx).await.unwrap_err();
        assert_eq!(err.kind, crate::backend::CreateErrorKind::InvalidSpec);
    }
}
