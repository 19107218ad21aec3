// src/backend/cluster/mod.rs

//! Cluster backend.
//!
//! `create_process` renders and validates a pod manifest; `start` submits it
//! and a monitor task polls the pod until it finishes or disappears. Graceful
//! stop is a delete with a grace period, forced stop a `--force` delete, and
//! `dispose` deletes whatever is left.

pub mod client;
pub mod kubectl;
pub mod template;

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::BoxFuture;
use crate::backend::{
    ClientError, ClientErrorKind, CreateError, LaunchContext, RuntimeBackend, process_label,
    runner_environment,
};
use crate::config::{ApiSection, ClusterSection};
use crate::errors::{FlowhostError, Result};
use crate::process::{
    ExitCode, FORCED_KILL_EXIT_CODE, ProcessDriver, ProcessHandle, ProcessIo, StartError,
    StopError,
};
use crate::types::RuntimeMode;
use crate::workflow::{WorkflowDefinition, WorkflowInstance};

pub use client::{ClusterClient, DeleteMode, WorkloadPhase, WorkloadStatus};
pub use kubectl::Kubectl;
pub use template::{PodOverrides, default_template, render_manifest, workload_name};

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_INSTANCE: &str = "flowhost.io/instance";
pub const LABEL_DEFINITION: &str = "flowhost.io/definition";
pub const LABEL_ATTEMPT: &str = "flowhost.io/attempt";

/// Exit code recorded for a pod removed by a graceful delete.
pub const GRACEFUL_DELETE_EXIT_CODE: ExitCode = -15;

const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const MONITOR_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ClusterBackend {
    client: Arc<dyn ClusterClient>,
    config: ClusterSection,
    template: Value,
    poll_interval: Duration,
    api: ApiSection,
}

impl ClusterBackend {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        config: ClusterSection,
        template: Value,
        poll_interval: Duration,
        api: ApiSection,
    ) -> Self {
        Self {
            client,
            config,
            template,
            poll_interval,
            api,
        }
    }

    /// Backend driving `kubectl`, with the template loaded from
    /// `config.template` or the built-in one.
    pub fn with_cli(
        config: ClusterSection,
        poll_interval: Duration,
        api: ApiSection,
    ) -> Result<Self> {
        let template = match &config.template {
            Some(path) => {
                let text = fs::read_to_string(path)?;
                serde_json::from_str(&text).map_err(|e| {
                    FlowhostError::ConfigError(format!(
                        "invalid pod template {}: {e}",
                        path.display()
                    ))
                })?
            }
            None => default_template(&config.image),
        };
        let client = Arc::new(Kubectl::new(config.cli.clone()));
        Ok(Self::new(client, config, template, poll_interval, api))
    }

    fn overrides(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        ctx: &LaunchContext,
    ) -> PodOverrides {
        let mut env: Vec<(String, String)> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(runner_environment(definition, instance, ctx, &self.api));

        PodOverrides {
            name: workload_name(&self.config.name_prefix, &instance.id, ctx.attempt),
            namespace: self.config.namespace.clone(),
            labels: BTreeMap::from([
                (LABEL_MANAGED_BY.to_string(), "flowhost".to_string()),
                (LABEL_INSTANCE.to_string(), instance.id.clone()),
                (LABEL_DEFINITION.to_string(), definition.id.clone()),
                (LABEL_ATTEMPT.to_string(), ctx.attempt.to_string()),
            ]),
            env,
            service_account: self.config.service_account.clone(),
        }
    }
}

impl RuntimeBackend for ClusterBackend {
    fn mode(&self) -> RuntimeMode {
        RuntimeMode::Cluster
    }

    fn create_process<'a>(
        &'a self,
        definition: &'a WorkflowDefinition,
        instance: &'a WorkflowInstance,
        ctx: &'a LaunchContext,
    ) -> BoxFuture<'a, std::result::Result<ProcessHandle, CreateError>> {
        Box::pin(async move {
            if ctx.cancel.is_cancelled() {
                return Err(CreateError::cancelled());
            }
            let overrides = self.overrides(definition, instance, ctx);
            let manifest = render_manifest(&self.template, &overrides)?;

            let label = process_label(instance, ctx);
            debug!(process = %label, pod = %overrides.name, namespace = %overrides.namespace, "rendered pod manifest");
            let driver = ClusterDriver {
                client: self.client.clone(),
                namespace: overrides.namespace,
                name: overrides.name,
                manifest,
                label: label.clone(),
                poll_interval: self.poll_interval,
                submitted: false,
                deletion_code: Arc::new(AtomicI32::new(0)),
                stop: CancellationToken::new(),
                monitor: None,
            };
            Ok(ProcessHandle::new(RuntimeMode::Cluster, label, Box::new(driver)))
        })
    }
}

fn submit_failure(e: ClientError) -> StartError {
    match e.kind {
        ClientErrorKind::Unreachable | ClientErrorKind::Other => {
            StartError::BackendUnavailable(e.message)
        }
        ClientErrorKind::QuotaExceeded => StartError::ResourceExhausted(e.message),
        ClientErrorKind::PermissionDenied => StartError::PermissionDenied(e.message),
        ClientErrorKind::NotFound | ClientErrorKind::InvalidRequest | ClientErrorKind::Conflict => {
            StartError::InvalidSpec(e.message)
        }
    }
}

/// Drives one pod.
pub struct ClusterDriver {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    name: String,
    manifest: Value,
    label: String,
    poll_interval: Duration,
    submitted: bool,
    /// Synthetic exit code to report once a deleted pod disappears; 0 = none.
    deletion_code: Arc<AtomicI32>,
    stop: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

impl ClusterDriver {
    async fn delete(&self, mode: DeleteMode) -> std::result::Result<(), StopError> {
        if !self.submitted {
            return Ok(());
        }
        match self.client.delete(&self.namespace, &self.name, mode).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(StopError::Backend(e.to_string())),
        }
    }
}

impl ProcessDriver for ClusterDriver {
    fn process_id(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn start<'a>(
        &'a mut self,
        io: &'a ProcessIo,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, std::result::Result<(), StartError>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(StartError::Cancelled);
            }

            let submitted = {
                let mut submit = self.client.submit(&self.namespace, &self.manifest);
                tokio::select! {
                    res = &mut submit => Some(res),
                    _ = cancel.cancelled() => {
                        // Finish the request, then take the pod back down.
                        if submit.await.is_ok() {
                            if let Err(e) = self.client.delete(&self.namespace, &self.name, DeleteMode::Force).await {
                                warn!(process = %self.label, error = %e, "failed to roll back pod");
                            }
                        }
                        None
                    }
                }
            };
            let Some(submitted) = submitted else {
                return Err(StartError::Cancelled);
            };
            let name = submitted.map_err(submit_failure)?;
            if name != self.name {
                debug!(process = %self.label, requested = %self.name, created = %name, "cluster renamed workload");
                self.name = name;
            }
            self.submitted = true;
            info!(process = %self.label, pod = %self.name, namespace = %self.namespace, "pod submitted");

            self.monitor = Some(tokio::spawn(monitor_pod(
                self.client.clone(),
                self.namespace.clone(),
                self.name.clone(),
                self.poll_interval,
                self.deletion_code.clone(),
                self.stop.clone(),
                io.clone(),
                self.label.clone(),
            )));
            Ok(())
        })
    }

    fn terminate(&mut self, grace: Duration) -> BoxFuture<'_, std::result::Result<(), StopError>> {
        Box::pin(async move {
            let _ = self.deletion_code.compare_exchange(
                0,
                GRACEFUL_DELETE_EXIT_CODE,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            self.delete(DeleteMode::Graceful(grace)).await
        })
    }

    fn kill(&mut self) -> BoxFuture<'_, std::result::Result<(), StopError>> {
        Box::pin(async move {
            self.deletion_code
                .store(FORCED_KILL_EXIT_CODE, Ordering::SeqCst);
            self.delete(DeleteMode::Force).await
        })
    }

    fn release(&mut self) -> BoxFuture<'_, std::result::Result<(), StopError>> {
        Box::pin(async move {
            let deleted = self.delete(DeleteMode::Force).await;
            self.stop.cancel();
            if let Some(mut monitor) = self.monitor.take() {
                if timeout(MONITOR_STOP_TIMEOUT, &mut monitor).await.is_err() {
                    monitor.abort();
                }
            }
            deleted
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn monitor_pod(
    client: Arc<dyn ClusterClient>,
    namespace: String,
    name: String,
    poll_interval: Duration,
    deletion_code: Arc<AtomicI32>,
    stop: CancellationToken,
    io: ProcessIo,
    label: String,
) {
    let mut logs: Option<JoinHandle<()>> = None;
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let code = loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let requested = deletion_code.load(Ordering::SeqCst);
        match client.status(&namespace, &name).await {
            Ok(status) => {
                if logs.is_none() && status.phase != WorkloadPhase::Pending {
                    logs = Some(spawn_log_follower(
                        client.clone(),
                        namespace.clone(),
                        name.clone(),
                        io.clone(),
                        stop.clone(),
                    ));
                }
                if status.phase.is_finished() {
                    let observed = status.exit_code.unwrap_or(match status.phase {
                        WorkloadPhase::Succeeded => 0,
                        _ => 1,
                    });
                    break if requested != 0 { requested } else { observed };
                }
            }
            Err(e) if e.is_not_found() => {
                if requested == 0 {
                    warn!(process = %label, pod = %name, "pod disappeared without a delete request");
                    break FORCED_KILL_EXIT_CODE;
                }
                break requested;
            }
            Err(e) => {
                debug!(process = %label, error = %e, "pod status poll failed; retrying");
            }
        }
    };

    if let Some(logs) = logs {
        if timeout(LOG_DRAIN_TIMEOUT, logs).await.is_err() {
            debug!(process = %label, "log follower still running after pod finished");
        }
    }
    info!(process = %label, exit_code = code, "pod finished");
    io.emit_exit(code);
}

fn spawn_log_follower(
    client: Arc<dyn ClusterClient>,
    namespace: String,
    name: String,
    io: ProcessIo,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = stop.cancelled() => {}
            res = client.logs(&namespace, &name, io) => {
                if let Err(e) = res {
                    debug!(pod = %name, error = %e, "log follower ended");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::workflow::DefinitionRef;

    /// Pods go Running on the first poll and stay there until `finish` or a
    /// delete.
    #[derive(Default)]
    struct FakeCluster {
        calls: Mutex<Vec<String>>,
        pods: Mutex<BTreeMap<String, WorkloadStatus>>,
    }

    impl FakeCluster {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn finish(&self, name: &str, code: i32) {
            let phase = if code == 0 {
                WorkloadPhase::Succeeded
            } else {
                WorkloadPhase::Failed
            };
            self.pods.lock().unwrap().insert(
                name.to_string(),
                WorkloadStatus {
                    phase,
                    exit_code: Some(code),
                    reason: None,
                },
            );
        }
    }

    impl ClusterClient for FakeCluster {
        fn submit<'a>(
            &'a self,
            _namespace: &'a str,
            manifest: &'a Value,
        ) -> BoxFuture<'a, std::result::Result<String, ClientError>> {
            Box::pin(async move {
                let name = manifest["metadata"]["name"].as_str().unwrap().to_string();
                self.calls.lock().unwrap().push(format!("submit {name}"));
                self.pods.lock().unwrap().insert(
                    name.clone(),
                    WorkloadStatus {
                        phase: WorkloadPhase::Running,
                        exit_code: None,
                        reason: None,
                    },
                );
                Ok(name)
            })
        }

        fn status<'a>(
            &'a self,
            _namespace: &'a str,
            name: &'a str,
        ) -> BoxFuture<'a, std::result::Result<WorkloadStatus, ClientError>> {
            Box::pin(async move {
                self.pods
                    .lock()
                    .unwrap()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ClientError::new(ClientErrorKind::NotFound, "gone"))
            })
        }

        fn logs<'a>(
            &'a self,
            _namespace: &'a str,
            _name: &'a str,
            io: ProcessIo,
        ) -> BoxFuture<'a, std::result::Result<(), ClientError>> {
            Box::pin(async move {
                io.emit_stdout("{\"done\":true}");
                Ok(())
            })
        }

        fn delete<'a>(
            &'a self,
            _namespace: &'a str,
            name: &'a str,
            mode: DeleteMode,
        ) -> BoxFuture<'a, std::result::Result<(), ClientError>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(format!("delete {mode:?}"));
                self.pods.lock().unwrap().remove(name);
                Ok(())
            })
        }
    }

    fn backend(cluster: Arc<FakeCluster>) -> ClusterBackend {
        ClusterBackend::new(
            cluster,
            ClusterSection::default(),
            default_template("flowhost/runner:1"),
            Duration::from_millis(10),
            ApiSection::default(),
        )
    }

    async fn started(b: &ClusterBackend) -> ProcessHandle {
        let def = WorkflowDefinition::new("echo", "v1", json!({}));
        let inst = WorkflowInstance::new("wf-1", DefinitionRef::new("echo", "v1"), json!({}));
        let ctx = LaunchContext::new(2, json!({}));
        let mut handle = b.create_process(&def, &inst, &ctx).await.unwrap();
        handle.start(&ctx.cancel).await.unwrap();
        handle
    }

    #[tokio::test]
    async fn pod_exit_code_surfaces_as_handle_exit() {
        let cluster = Arc::new(FakeCluster::default());
        let b = backend(cluster.clone());
        let handle = started(&b).await;
        assert_eq!(handle.process_id().as_deref(), Some("flowhost-wf-1-2"));

        cluster.finish("flowhost-wf-1-2", 3);
        assert_eq!(handle.exited().wait().await, Some(3));
        assert_eq!(handle.transcript().last_stdout.as_deref(), Some("{\"done\":true}"));

        handle.dispose().await;
        assert_eq!(
            cluster.calls(),
            vec!["submit flowhost-wf-1-2".to_string(), "delete Force".to_string()]
        );
    }

    #[tokio::test]
    async fn graceful_delete_reports_sigterm_code() {
        let cluster = Arc::new(FakeCluster::default());
        let b = backend(cluster.clone());
        let mut handle = started(&b).await;

        handle.stop(Duration::from_secs(2)).await.unwrap();
        assert_eq!(handle.exit_code(), Some(GRACEFUL_DELETE_EXIT_CODE));
        assert!(cluster.calls().contains(&format!("delete {:?}", DeleteMode::Graceful(Duration::from_secs(2)))));
        handle.dispose().await;
    }

    #[tokio::test]
    async fn invalid_template_fails_create() {
        let cluster = Arc::new(FakeCluster::default());
        let b = ClusterBackend::new(
            cluster.clone(),
            ClusterSection::default(),
            json!({"kind": "Pod", "spec": {"containers": []}}),
            Duration::from_millis(10),
            ApiSection::default(),
        );
        let def = WorkflowDefinition::new("echo", "v1", json!({}));
        let inst = WorkflowInstance::new("wf-1", DefinitionRef::new("echo", "v1"), json!({}));
        let err = b
            .create_process(&def, &inst, &LaunchContext::new(1, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::backend::CreateErrorKind::InvalidSpec);
        assert!(cluster.calls().is_empty());
    }
}
