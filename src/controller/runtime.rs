// src/controller/runtime.rs

//! The controller's async shell: lifecycle operations on instances.
//!
//! Every operation on an instance runs under that instance's lock from
//! [`KeyedLocks`], reloads the resource from the store, acts on the backend
//! and writes the new status back. Decisions about exits and launch failures
//! come from [`transitions`](super::transitions).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{LaunchContext, RuntimeBackend, RuntimePolicy, RuntimeSelector};
use crate::controller::registry::{ActiveProcess, ProcessRegistry};
use crate::controller::supervision::{SupervisionOutcome, supervise};
use crate::controller::transitions::{
    ExitDisposition, LaunchFailure, classify_exit, parse_output,
};
use crate::controller::ControllerOptions;
use crate::errors::{FlowhostError, Result};
use crate::events::{EventBus, LifecycleKind, lifecycle_event};
use crate::keyed_lock::KeyedLocks;
use crate::process::{KILL_CONFIRM_TIMEOUT, ProcessHandle};
use crate::store::InstanceStore;
use crate::workflow::{
    DesiredState, FaultCause, InstanceError, InstanceStatus, WorkflowDefinition, WorkflowInstance,
};

pub(super) struct Inner {
    pub(super) store: Arc<dyn InstanceStore>,
    pub(super) bus: Arc<dyn EventBus>,
    pub(super) selector: RuntimeSelector,
    pub(super) policy: RuntimePolicy,
    pub(super) options: ControllerOptions,
    pub(super) locks: KeyedLocks,
    pub(super) registry: ProcessRegistry,
    generations: AtomicU64,
    /// Consecutive failed launches of the current launch sequence.
    launch_failures: Mutex<HashMap<String, u32>>,
    /// Instances waiting out a retry backoff.
    retry_pending: Mutex<HashSet<String>>,
    pub(super) shutdown: CancellationToken,
}

/// Reconciles workflow instances against live processes.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WorkflowController {
    pub(super) inner: Arc<Inner>,
}

impl fmt::Debug for WorkflowController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowController")
            .field("mode", &self.inner.policy.mode)
            .field("live", &self.inner.registry.live_ids())
            .field("shutting_down", &self.inner.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl WorkflowController {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        bus: Arc<dyn EventBus>,
        selector: RuntimeSelector,
        policy: RuntimePolicy,
        options: ControllerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                selector,
                policy,
                options,
                locks: KeyedLocks::new(),
                registry: ProcessRegistry::new(),
                generations: AtomicU64::new(0),
                launch_failures: Mutex::new(HashMap::new()),
                retry_pending: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.inner.options
    }

    /// Current status from the store; takes no lock.
    pub async fn status(&self, id: &str) -> Result<InstanceStatus> {
        Ok(self.inner.store.get_instance(id).await?.status)
    }

    pub fn live_process_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn has_live_process(&self, id: &str) -> bool {
        self.inner.registry.contains(id)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Start the first attempt of a `Pending` instance. Idempotent for an
    /// instance that is already running.
    pub async fn launch(&self, id: &str) -> Result<InstanceStatus> {
        let _guard = self.inner.locks.lock(id).await;
        let instance = self.inner.store.get_instance(id).await?;
        match instance.status {
            InstanceStatus::Pending if self.is_retry_pending(id) => Ok(InstanceStatus::Pending),
            InstanceStatus::Pending => self.start_attempt(instance).await,
            InstanceStatus::Running => Ok(InstanceStatus::Running),
            from => Err(FlowhostError::InvalidTransition {
                instance: id.to_string(),
                from,
                to: InstanceStatus::Running,
            }),
        }
    }

    /// Gracefully stop a running instance and park it as `Suspended`.
    pub async fn suspend(&self, id: &str) -> Result<InstanceStatus> {
        let _guard = self.inner.locks.lock(id).await;
        let mut instance = self.inner.store.get_instance(id).await?;
        match instance.status {
            InstanceStatus::Suspended => Ok(InstanceStatus::Suspended),
            InstanceStatus::Running => {
                instance.desired = DesiredState::Suspend;
                self.suspend_locked(instance).await
            }
            from => Err(FlowhostError::InvalidTransition {
                instance: id.to_string(),
                from,
                to: InstanceStatus::Suspended,
            }),
        }
    }

    /// Start a new attempt of a suspended instance, fed with the output the
    /// previous attempt left behind.
    pub async fn resume(&self, id: &str) -> Result<InstanceStatus> {
        let _guard = self.inner.locks.lock(id).await;
        let mut instance = self.inner.store.get_instance(id).await?;
        match instance.status {
            InstanceStatus::Running => Ok(InstanceStatus::Running),
            InstanceStatus::Suspended if self.is_retry_pending(id) => Ok(InstanceStatus::Suspended),
            InstanceStatus::Suspended => {
                instance.desired = DesiredState::Run;
                self.start_attempt(instance).await
            }
            from => Err(FlowhostError::InvalidTransition {
                instance: id.to_string(),
                from,
                to: InstanceStatus::Running,
            }),
        }
    }

    /// Force-stop and cancel. Terminal instances are left alone and the call
    /// succeeds.
    pub async fn terminate(&self, id: &str) -> Result<InstanceStatus> {
        let _guard = self.inner.locks.lock(id).await;
        let instance = self.inner.store.get_instance(id).await?;
        if instance.status.is_terminal() {
            debug!(instance = %id, status = %instance.status, "terminate on terminal instance; nothing to do");
            return Ok(instance.status);
        }
        self.terminate_locked(instance).await
    }

    /// Stop and release whatever runs for `id` without touching the store.
    /// Used when the resource itself was deleted.
    pub async fn forget(&self, id: &str) {
        let _guard = self.inner.locks.lock(id).await;
        self.clear_retry_state(id);
        if let Some(active) = self.inner.registry.take(id) {
            info!(instance = %id, "instance deleted; stopping its process");
            self.force_stop(active).await;
        }
    }

    // ----- operations below expect the instance lock to be held -----

    pub(super) async fn start_attempt(&self, mut instance: WorkflowInstance) -> Result<InstanceStatus> {
        if self.is_shutting_down() {
            return Err(FlowhostError::ShuttingDown);
        }
        let id = instance.id.clone();
        self.take_retry_pending(&id);
        if self.inner.registry.contains(&id) {
            warn!(instance = %id, "launch requested while a process is live; ignoring");
            return Ok(instance.status);
        }

        let resuming = instance.status == InstanceStatus::Suspended;
        instance.attempts += 1;
        let attempt = instance.attempts;
        let mut ctx = LaunchContext::new(attempt, instance.launch_input());
        ctx.cancel = self.inner.shutdown.child_token();

        info!(instance = %id, attempt, resuming, mode = %self.inner.policy.mode, "launching attempt");
        let handle = match self.launch_process(&instance, &ctx).await {
            Ok(handle) => handle,
            Err(failure) => return self.launch_failed(instance, failure).await,
        };

        if let Err(e) = instance.transition_to(InstanceStatus::Running, Utc::now()) {
            self.force_stop(ActiveProcess {
                generation: 0,
                handle,
                supervisor: CancellationToken::new(),
            })
            .await;
            return Err(e);
        }
        instance.process_id = handle.process_id();
        instance.error = None;
        self.reset_launch_failures(&id);

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let supervisor = CancellationToken::new();
        self.spawn_supervision(&id, generation, &handle, supervisor.clone());
        let detail = json!({
            "processId": handle.process_id(),
            "mode": handle.mode(),
        });
        if let Some(displaced) = self.inner.registry.insert(
            &id,
            ActiveProcess {
                generation,
                handle,
                supervisor,
            },
        ) {
            warn!(instance = %id, generation = displaced.generation, "replaced a live process entry; stopping it");
            self.force_stop(displaced).await;
        }

        if let Err(e) = self.inner.store.update_instance(instance.clone()).await {
            warn!(instance = %id, error = %e, "failed to record running status; stopping process");
            if let Some(active) = self.inner.registry.take(&id) {
                self.force_stop(active).await;
            }
            return Err(e);
        }

        let kind = if resuming {
            LifecycleKind::Resumed
        } else {
            LifecycleKind::Started
        };
        self.publish(kind, &instance, detail).await;
        Ok(InstanceStatus::Running)
    }

    async fn launch_process(
        &self,
        instance: &WorkflowInstance,
        ctx: &LaunchContext,
    ) -> std::result::Result<ProcessHandle, LaunchFailure> {
        let definition = self
            .inner
            .store
            .get_definition(&instance.definition)
            .await
            .map_err(|e| LaunchFailure::Definition(e.to_string()))?;
        let backend = self
            .inner
            .selector
            .select(&self.inner.policy)
            .map_err(|_| LaunchFailure::Unsupported(self.inner.policy.mode))?;

        let limit = self.inner.options.operation_timeout;
        let op = create_and_start(backend.as_ref(), &definition, instance, ctx);
        tokio::pin!(op);
        tokio::select! {
            res = &mut op => res,
            _ = sleep(limit) => {
                warn!(instance = %instance.id, ?limit, "launch timed out; cancelling");
                ctx.cancel.cancel();
                // The backend rolls back on cancel; anything it still hands
                // over is stopped here.
                match timeout(KILL_CONFIRM_TIMEOUT, op).await {
                    Ok(Ok(mut handle)) => {
                        if let Err(e) = handle.stop(Duration::ZERO).await {
                            warn!(instance = %instance.id, error = %e, "failed to stop late process");
                        }
                        handle.dispose().await;
                    }
                    Ok(Err(_)) => {}
                    Err(_) => warn!(
                        instance = %instance.id,
                        "backend ignored launch cancellation; abandoning it"
                    ),
                }
                Err(LaunchFailure::Timeout(limit))
            }
        }
    }

    async fn launch_failed(
        &self,
        mut instance: WorkflowInstance,
        failure: LaunchFailure,
    ) -> Result<InstanceStatus> {
        let id = instance.id.clone();
        let attempt = instance.attempts;
        let error = failure.to_instance_error(attempt);

        if self.is_shutting_down() {
            info!(instance = %id, attempt, "launch abandoned during shutdown");
            self.inner.store.update_instance(instance).await?;
            return Err(FlowhostError::ShuttingDown);
        }

        let failures = self.bump_launch_failures(&id);
        if failure.is_retryable() && self.inner.options.retry.allows_another(failures) {
            let delay = self.inner.options.retry.backoff_before(failures + 1);
            warn!(instance = %id, attempt, ?delay, error = %error, "launch failed; retrying");
            instance.error = Some(error);
            let status = instance.status;
            self.inner.store.update_instance(instance).await?;
            self.schedule_retry(&id, delay);
            return Ok(status);
        }

        warn!(instance = %id, attempt, error = %error, "launch failed; faulting instance");
        self.reset_launch_failures(&id);
        self.fault(instance, error).await
    }

    fn schedule_retry(&self, id: &str, delay: Duration) {
        self.retry_pending_set().insert(id.to_string());
        let controller = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = controller.inner.shutdown.cancelled() => {}
                _ = sleep(delay) => controller.retry_launch(&id).await,
            }
        });
    }

    async fn retry_launch(&self, id: &str) {
        let _guard = self.inner.locks.lock(id).await;
        if !self.is_retry_pending(id) {
            debug!(instance = %id, "retry no longer wanted");
            return;
        }
        let instance = match self.inner.store.get_instance(id).await {
            Ok(instance) => instance,
            Err(e) => {
                debug!(instance = %id, error = %e, "retry target vanished");
                self.clear_retry_state(id);
                return;
            }
        };
        let wanted = instance.desired == DesiredState::Run
            && matches!(
                instance.status,
                InstanceStatus::Pending | InstanceStatus::Suspended
            );
        if !wanted {
            self.clear_retry_state(id);
            return;
        }
        if let Err(e) = self.start_attempt(instance).await {
            warn!(instance = %id, error = %e, "retry attempt failed");
        }
    }

    fn spawn_supervision(
        &self,
        id: &str,
        generation: u64,
        handle: &ProcessHandle,
        supervisor: CancellationToken,
    ) {
        let controller = self.clone();
        let id = id.to_string();
        let exit = handle.exited();
        let activity = handle.activity();
        tokio::spawn(async move {
            let outcome = supervise(exit, activity, &controller.inner.options, &supervisor).await;
            if let Some(outcome) = outcome {
                controller.on_supervision_outcome(&id, generation, outcome).await;
            }
        });
    }

    async fn on_supervision_outcome(&self, id: &str, generation: u64, outcome: SupervisionOutcome) {
        let _guard = self.inner.locks.lock(id).await;
        let Some(mut active) = self.inner.registry.take_if_generation(id, generation) else {
            debug!(instance = %id, generation, ?outcome, "outcome for a process no longer owned");
            return;
        };
        let instance = match self.inner.store.get_instance(id).await {
            Ok(instance) => instance,
            Err(e) => {
                warn!(instance = %id, error = %e, "instance gone; releasing its process");
                self.force_stop(active).await;
                return;
            }
        };
        let attempt = instance.attempts;

        let disposition = match outcome {
            SupervisionOutcome::Exited(code) => {
                info!(instance = %id, attempt, exit_code = code, "process exited");
                classify_exit(code, &active.handle.transcript(), attempt)
            }
            SupervisionOutcome::LivenessExpired | SupervisionOutcome::OutputIdle => {
                let message = match outcome {
                    SupervisionOutcome::OutputIdle => format!(
                        "no output for {:?}",
                        self.inner.options.output_idle_timeout.unwrap_or_default()
                    ),
                    _ => format!(
                        "still running after {:?}",
                        self.inner.options.liveness_timeout
                    ),
                };
                warn!(instance = %id, attempt, %message, "liveness check failed; killing process");
                if let Err(e) = active.handle.stop(Duration::ZERO).await {
                    warn!(instance = %id, error = %e, "forced stop reported an error");
                }
                let mut error = InstanceError::new(FaultCause::Timeout, message, attempt);
                error.exit_code = active.handle.exit_code();
                error.stderr_tail = active.handle.transcript().stderr_tail.into_iter().collect();
                ExitDisposition::Faulted(error)
            }
        };
        active.handle.dispose().await;

        if let Err(e) = self.settle(instance, disposition).await {
            warn!(instance = %id, error = %e, "failed to record attempt result");
        }
    }

    /// Record the end of an attempt.
    async fn settle(
        &self,
        mut instance: WorkflowInstance,
        disposition: ExitDisposition,
    ) -> Result<InstanceStatus> {
        match disposition {
            ExitDisposition::Completed { output } => {
                if output.is_some() {
                    instance.output = output;
                }
                instance.error = None;
                instance.transition_to(InstanceStatus::Completed, Utc::now())?;
                self.inner.store.update_instance(instance.clone()).await?;
                info!(instance = %instance.id, attempt = instance.attempts, "instance completed");
                let detail = json!({"exitCode": 0, "output": instance.output});
                self.publish(LifecycleKind::Completed, &instance, detail).await;
                Ok(InstanceStatus::Completed)
            }
            ExitDisposition::Faulted(error) => self.fault(instance, error).await,
        }
    }

    pub(super) async fn fault(
        &self,
        mut instance: WorkflowInstance,
        error: InstanceError,
    ) -> Result<InstanceStatus> {
        self.clear_retry_state(&instance.id);
        instance.transition_to(InstanceStatus::Faulted, Utc::now())?;
        warn!(instance = %instance.id, error = %error, "instance faulted");
        let detail = json!({
            "exitCode": error.exit_code,
            "error": error,
        });
        instance.error = Some(error);
        self.inner.store.update_instance(instance.clone()).await?;
        self.publish(LifecycleKind::Faulted, &instance, detail).await;
        Ok(InstanceStatus::Faulted)
    }

    pub(super) async fn suspend_locked(&self, instance: WorkflowInstance) -> Result<InstanceStatus> {
        let id = instance.id.clone();
        let Some(mut active) = self.inner.registry.take(&id) else {
            debug!(instance = %id, "suspending instance without a live process");
            return self.mark_suspended(instance, None).await;
        };

        // Exited before we got here: that result stands.
        if let Some(code) = active.handle.exit_code() {
            let disposition = classify_exit(code, &active.handle.transcript(), instance.attempts);
            active.handle.dispose().await;
            return self.settle(instance, disposition).await;
        }

        let grace = self.inner.options.graceful_stop_timeout;
        info!(instance = %id, ?grace, "suspending instance");
        if let Err(e) = active.handle.stop(grace).await {
            warn!(instance = %id, error = %e, "stop during suspend reported an error");
        }
        let output = parse_output(&active.handle.transcript());
        active.handle.dispose().await;
        self.mark_suspended(instance, output).await
    }

    async fn mark_suspended(
        &self,
        mut instance: WorkflowInstance,
        output: Option<Value>,
    ) -> Result<InstanceStatus> {
        if output.is_some() {
            instance.output = output;
        }
        instance.transition_to(InstanceStatus::Suspended, Utc::now())?;
        self.inner.store.update_instance(instance.clone()).await?;
        let detail = json!({"output": instance.output});
        self.publish(LifecycleKind::Suspended, &instance, detail).await;
        Ok(InstanceStatus::Suspended)
    }

    pub(super) async fn terminate_locked(&self, mut instance: WorkflowInstance) -> Result<InstanceStatus> {
        let id = instance.id.clone();
        self.clear_retry_state(&id);
        if let Some(active) = self.inner.registry.take(&id) {
            info!(instance = %id, "terminating instance");
            self.force_stop(active).await;
        }
        instance.desired = DesiredState::Cancel;
        instance.transition_to(InstanceStatus::Cancelled, Utc::now())?;
        self.inner.store.update_instance(instance.clone()).await?;
        self.publish(LifecycleKind::Terminated, &instance, json!({})).await;
        Ok(InstanceStatus::Cancelled)
    }

    /// Release a process whose instance no longer wants it.
    pub(super) async fn release_locked(&self, id: &str) {
        if let Some(active) = self.inner.registry.take(id) {
            info!(instance = %id, "releasing process of a finished instance");
            self.force_stop(active).await;
        }
    }

    /// Kill and dispose; failures are logged only.
    pub(super) async fn force_stop(&self, mut active: ActiveProcess) {
        active.supervisor.cancel();
        if let Err(e) = active.handle.stop(Duration::ZERO).await {
            warn!(process = %active.handle.label(), error = %e, "forced stop reported an error");
        }
        active.handle.dispose().await;
    }

    pub(super) async fn publish(&self, kind: LifecycleKind, instance: &WorkflowInstance, detail: Value) {
        let event = lifecycle_event(kind, instance, detail);
        if let Err(e) = self.inner.bus.publish(event).await {
            warn!(instance = %instance.id, %kind, error = %e, "failed to publish lifecycle event");
        }
    }

    // ----- retry bookkeeping -----

    fn retry_pending_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.inner
            .retry_pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    pub(super) fn is_retry_pending(&self, id: &str) -> bool {
        self.retry_pending_set().contains(id)
    }

    fn take_retry_pending(&self, id: &str) -> bool {
        self.retry_pending_set().remove(id)
    }

    fn bump_launch_failures(&self, id: &str) -> u32 {
        let mut failures = self
            .inner
            .launch_failures
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let count = failures.entry(id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn reset_launch_failures(&self, id: &str) {
        self.inner
            .launch_failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
    }

    pub(super) fn clear_retry_state(&self, id: &str) {
        self.take_retry_pending(id);
        self.reset_launch_failures(id);
    }
}

async fn create_and_start(
    backend: &dyn RuntimeBackend,
    definition: &WorkflowDefinition,
    instance: &WorkflowInstance,
    ctx: &LaunchContext,
) -> std::result::Result<ProcessHandle, LaunchFailure> {
    let mut handle = backend
        .create_process(definition, instance, ctx)
        .await
        .map_err(LaunchFailure::Create)?;
    if let Err(e) = handle.start(&ctx.cancel).await {
        handle.dispose().await;
        return Err(LaunchFailure::Start(e));
    }
    Ok(handle)
}
