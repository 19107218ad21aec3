use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use flowhost::BoxFuture;
use flowhost::backend::{CreateError, LaunchContext, RuntimeBackend, RuntimeSelector};
use flowhost::process::{ExitCode, ProcessDriver, ProcessHandle, ProcessIo, StartError, StopError};
use flowhost::types::RuntimeMode;
use flowhost::workflow::{WorkflowDefinition, WorkflowInstance};

/// Exit code a mock process reports when it honours a graceful stop.
pub const MOCK_TERMINATED_EXIT_CODE: ExitCode = -15;

/// How one attempt of a mock process behaves.
#[derive(Debug, Clone)]
pub struct Script {
    pub create_error: Option<CreateError>,
    pub start_error: Option<StartError>,
    /// Delay inside `start`; honours the launch cancellation.
    pub start_delay: Option<Duration>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// `None` keeps the process running until it is stopped.
    pub exit_after: Option<Duration>,
    pub exit_code: ExitCode,
    pub honour_terminate: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            create_error: None,
            start_error: None,
            start_delay: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_after: Some(Duration::ZERO),
            exit_code: 0,
            honour_terminate: true,
        }
    }
}

impl Script {
    /// Print `stdout` lines, then exit with `code`.
    pub fn exits(code: ExitCode, stdout: &[&str]) -> Self {
        Self {
            stdout: stdout.iter().map(|s| s.to_string()).collect(),
            exit_code: code,
            ..Self::default()
        }
    }

    /// Print `stdout` lines, then keep running.
    pub fn runs_forever(stdout: &[&str]) -> Self {
        Self {
            stdout: stdout.iter().map(|s| s.to_string()).collect(),
            exit_after: None,
            ..Self::default()
        }
    }

    pub fn fails_create(error: CreateError) -> Self {
        Self {
            create_error: Some(error),
            ..Self::default()
        }
    }

    pub fn fails_start(error: StartError) -> Self {
        Self {
            start_error: Some(error),
            ..Self::default()
        }
    }

    pub fn with_stderr(mut self, lines: &[&str]) -> Self {
        self.stderr = lines.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn exit_after(mut self, delay: Duration) -> Self {
        self.exit_after = Some(delay);
        self
    }

    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    pub fn ignore_terminate(mut self) -> Self {
        self.honour_terminate = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Create,
    Start,
    Terminate,
    Kill,
    Release,
}

/// One recorded backend interaction.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub instance: String,
    pub attempt: u32,
    pub kind: CallKind,
}

#[derive(Debug, Default)]
struct State {
    scripts: HashMap<String, Vec<Script>>,
    calls: Vec<MockCall>,
    inputs: Vec<(String, u32, Value)>,
    live: HashMap<String, u32>,
    max_live_per_instance: u32,
}

/// A `RuntimeBackend` that scripts process behaviour per instance and
/// attempt, and records every call it receives.
///
/// Attempt `n` of an instance plays the `n`-th script registered for it;
/// once the list is exhausted the last script repeats. Instances without a
/// script exit 0 immediately.
#[derive(Debug, Clone)]
pub struct MockBackend {
    mode: RuntimeMode,
    state: Arc<Mutex<State>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(RuntimeMode::Native)
    }
}

impl MockBackend {
    pub fn new(mode: RuntimeMode) -> Self {
        Self {
            mode,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// A selector with this backend registered for its mode.
    pub fn selector(&self) -> RuntimeSelector {
        RuntimeSelector::new().with_backend(Arc::new(self.clone()))
    }

    pub fn script(&self, instance: &str, scripts: Vec<Script>) {
        self.lock().scripts.insert(instance.to_string(), scripts);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Call kinds seen for `instance`, in order.
    pub fn calls_for(&self, instance: &str) -> Vec<CallKind> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.instance == instance)
            .map(|c| c.kind)
            .collect()
    }

    pub fn count(&self, instance: &str, kind: CallKind) -> usize {
        self.calls_for(instance).into_iter().filter(|k| *k == kind).count()
    }

    /// Input handed to each attempt of `instance`, by attempt number.
    pub fn inputs_for(&self, instance: &str) -> Vec<(u32, Value)> {
        self.lock()
            .inputs
            .iter()
            .filter(|(id, _, _)| id == instance)
            .map(|(_, attempt, input)| (*attempt, input.clone()))
            .collect()
    }

    /// Highest number of simultaneously started, unreleased processes any
    /// single instance ever had.
    pub fn max_live_per_instance(&self) -> u32 {
        self.lock().max_live_per_instance
    }

    pub fn live(&self, instance: &str) -> u32 {
        self.lock().live.get(instance).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn script_for(&self, instance: &str, attempt: u32) -> Script {
        let state = self.lock();
        match state.scripts.get(instance) {
            Some(scripts) if !scripts.is_empty() => {
                let idx = (attempt.max(1) as usize - 1).min(scripts.len() - 1);
                scripts[idx].clone()
            }
            _ => Script::default(),
        }
    }

    fn record(&self, instance: &str, attempt: u32, kind: CallKind) {
        let mut state = self.lock();
        state.calls.push(MockCall {
            instance: instance.to_string(),
            attempt,
            kind,
        });
        match kind {
            CallKind::Start => {
                let live = state.live.entry(instance.to_string()).or_insert(0);
                *live += 1;
                let live = *live;
                state.max_live_per_instance = state.max_live_per_instance.max(live);
            }
            CallKind::Release => {
                if let Some(live) = state.live.get_mut(instance) {
                    *live = live.saturating_sub(1);
                }
            }
            _ => {}
        }
    }
}

impl RuntimeBackend for MockBackend {
    fn mode(&self) -> RuntimeMode {
        self.mode
    }

    fn create_process<'a>(
        &'a self,
        _definition: &'a WorkflowDefinition,
        instance: &'a WorkflowInstance,
        ctx: &'a LaunchContext,
    ) -> BoxFuture<'a, Result<ProcessHandle, CreateError>> {
        Box::pin(async move {
            self.record(&instance.id, ctx.attempt, CallKind::Create);
            self.lock()
                .inputs
                .push((instance.id.clone(), ctx.attempt, ctx.input.clone()));

            let script = self.script_for(&instance.id, ctx.attempt);
            if let Some(e) = script.create_error.clone() {
                return Err(e);
            }
            let driver = MockDriver {
                backend: self.clone(),
                instance: instance.id.clone(),
                attempt: ctx.attempt,
                script,
                io: None,
                started: false,
                stop: CancellationToken::new(),
            };
            Ok(ProcessHandle::new(
                self.mode,
                format!("{}#{}", instance.id, ctx.attempt),
                Box::new(driver),
            ))
        })
    }
}

struct MockDriver {
    backend: MockBackend,
    instance: String,
    attempt: u32,
    script: Script,
    io: Option<ProcessIo>,
    started: bool,
    stop: CancellationToken,
}

impl ProcessDriver for MockDriver {
    fn process_id(&self) -> Option<String> {
        Some(format!("mock-{}-{}", self.instance, self.attempt))
    }

    fn start<'a>(
        &'a mut self,
        io: &'a ProcessIo,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), StartError>> {
        Box::pin(async move {
            if let Some(delay) = self.script.start_delay {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(StartError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if let Some(e) = self.script.start_error.clone() {
                return Err(e);
            }
            self.backend.record(&self.instance, self.attempt, CallKind::Start);
            self.started = true;
            self.io = Some(io.clone());

            let io = io.clone();
            let script = self.script.clone();
            let stop = self.stop.clone();
            tokio::spawn(async move {
                for line in &script.stderr {
                    io.emit_stderr(line.clone());
                }
                for line in &script.stdout {
                    io.emit_stdout(line.clone());
                }
                let Some(delay) = script.exit_after else {
                    return;
                };
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        io.emit_exit(script.exit_code);
                    }
                }
            });
            Ok(())
        })
    }

    fn terminate(&mut self, _grace: Duration) -> BoxFuture<'_, Result<(), StopError>> {
        Box::pin(async move {
            self.backend
                .record(&self.instance, self.attempt, CallKind::Terminate);
            if self.script.honour_terminate {
                if let Some(io) = &self.io {
                    io.emit_exit(MOCK_TERMINATED_EXIT_CODE);
                }
            }
            Ok(())
        })
    }

    fn kill(&mut self) -> BoxFuture<'_, Result<(), StopError>> {
        Box::pin(async move {
            self.backend.record(&self.instance, self.attempt, CallKind::Kill);
            if let Some(io) = &self.io {
                io.emit_exit(-9);
            }
            Ok(())
        })
    }

    fn release(&mut self) -> BoxFuture<'_, Result<(), StopError>> {
        Box::pin(async move {
            self.stop.cancel();
            if self.started {
                self.backend
                    .record(&self.instance, self.attempt, CallKind::Release);
            } else {
                // Never started: keep the live count untouched.
                self.backend.lock().calls.push(MockCall {
                    instance: self.instance.clone(),
                    attempt: self.attempt,
                    kind: CallKind::Release,
                });
            }
            Ok(())
        })
    }
}
