// src/controller/reconcile.rs

//! Store-driven reconciliation loop and shutdown.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::WorkflowController;
use crate::controller::transitions::{ReconcileAction, parse_output, plan};
use crate::errors::{FlowhostError, Result};
use crate::events::LifecycleKind;
use crate::store::{StoreEvent, WatchFilter};
use crate::workflow::{FaultCause, InstanceError, InstanceStatus};

impl WorkflowController {
    /// Bring one instance in line with its desired state.
    pub async fn reconcile(&self, id: &str) -> Result<ReconcileAction> {
        let _guard = self.inner.locks.lock(id).await;
        let instance = match self.inner.store.get_instance(id).await {
            Ok(instance) => instance,
            Err(FlowhostError::InstanceNotFound(_)) => {
                drop(_guard);
                self.forget(id).await;
                return Ok(ReconcileAction::None);
            }
            Err(e) => return Err(e),
        };

        let live = self.inner.registry.contains(id);
        let action = plan(&instance, live, self.is_retry_pending(id));
        if action != ReconcileAction::None {
            debug!(instance = %id, status = %instance.status, desired = ?instance.desired, ?action, "reconciling");
        }

        match action {
            ReconcileAction::Launch | ReconcileAction::Resume => {
                self.start_attempt(instance).await?;
            }
            ReconcileAction::Suspend => {
                self.suspend_locked(instance).await?;
            }
            ReconcileAction::Terminate => {
                self.terminate_locked(instance).await?;
            }
            ReconcileAction::FaultLost => {
                let error = InstanceError::new(
                    FaultCause::Unknown,
                    "process lost: instance was running but no process is owned by this controller",
                    instance.attempts,
                );
                self.fault(instance, error).await?;
            }
            ReconcileAction::Release => self.release_locked(id).await,
            ReconcileAction::None => {}
        }
        Ok(action)
    }

    /// Reconcile every stored instance, each on its own task.
    pub async fn reconcile_all(&self) -> Result<usize> {
        let instances = self.inner.store.list_instances().await?;
        let count = instances.len();
        for instance in instances {
            self.spawn_reconcile(instance.id);
        }
        Ok(count)
    }

    fn spawn_reconcile(&self, id: String) {
        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.reconcile(&id).await {
                match e {
                    FlowhostError::ShuttingDown => debug!(instance = %id, "skipped during shutdown"),
                    e => warn!(instance = %id, error = %e, "reconcile failed"),
                }
            }
        });
    }

    /// Watch the store and reconcile on every change until `cancel` fires,
    /// then shut down.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut watch = self.inner.store.watch(WatchFilter::all());
        let initial = self.reconcile_all().await?;
        info!(instances = initial, mode = %self.inner.policy.mode, "controller started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("controller cancellation requested");
                    break;
                }
                event = watch.next() => match event {
                    Some(StoreEvent::Created(instance)) | Some(StoreEvent::Updated(instance)) => {
                        self.spawn_reconcile(instance.id);
                    }
                    Some(StoreEvent::Deleted(id)) => {
                        let controller = self.clone();
                        tokio::spawn(async move { controller.forget(&id).await });
                    }
                    Some(StoreEvent::Resync) => {
                        if let Err(e) = self.reconcile_all().await {
                            warn!(error = %e, "resync failed");
                        }
                    }
                    None => {
                        info!("store watch closed");
                        break;
                    }
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop accepting work and stop every live process.
    ///
    /// Interrupted instances are parked as `Suspended` with their desired
    /// state untouched, so the next controller resumes them.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() && self.inner.registry.is_empty() {
            return;
        }
        self.inner.shutdown.cancel();

        let ids = self.inner.registry.live_ids();
        info!(live = ids.len(), "controller shutting down");
        let grace = self.inner.options.graceful_stop_timeout;
        let stops = ids.into_iter().map(|id| {
            let controller = self.clone();
            async move {
                let _guard = controller.inner.locks.lock(&id).await;
                let Some(mut active) = controller.inner.registry.take(&id) else {
                    return;
                };
                if let Err(e) = active.handle.stop(grace).await {
                    warn!(instance = %id, error = %e, "stop during shutdown reported an error");
                }
                let output = parse_output(&active.handle.transcript());
                active.handle.dispose().await;

                let mut instance = match controller.inner.store.get_instance(&id).await {
                    Ok(instance) => instance,
                    Err(_) => return,
                };
                if instance.status != InstanceStatus::Running {
                    return;
                }
                if output.is_some() {
                    instance.output = output;
                }
                if let Err(e) = instance.transition_to(InstanceStatus::Suspended, Utc::now()) {
                    warn!(instance = %id, error = %e, "could not park instance");
                    return;
                }
                match controller.inner.store.update_instance(instance.clone()).await {
                    Ok(()) => {
                        let detail = serde_json::json!({"output": instance.output, "reason": "shutdown"});
                        controller.publish(LifecycleKind::Suspended, &instance, detail).await;
                    }
                    Err(e) => warn!(instance = %id, error = %e, "failed to record suspension"),
                }
            }
        });
        let handles: Vec<_> = stops.map(tokio::spawn).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "shutdown task failed");
            }
        }
        info!("controller stopped");
    }
}
