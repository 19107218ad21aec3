// src/backend/container/mod.rs

//! Container backend.
//!
//! `create_process` resolves the image according to the pull policy and
//! creates the container; `ProcessHandle::start` starts it. The container's
//! exit code becomes the handle's exit signal and `dispose` force-removes the
//! container whatever happened to it.

pub mod client;
pub mod docker;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::BoxFuture;
use crate::backend::{
    ClientError, ClientErrorKind, CreateError, CreateErrorKind, LaunchContext, RuntimeBackend,
    or_cancelled, process_label, runner_environment,
};
use crate::config::{ApiSection, ContainerSection};
use crate::process::{
    FORCED_KILL_EXIT_CODE, ProcessDriver, ProcessHandle, ProcessIo, StartError, StopError,
};
use crate::types::{PullPolicy, RuntimeMode};
use crate::workflow::{WorkflowDefinition, WorkflowInstance};

pub use client::{ContainerClient, ContainerSpec};
pub use docker::DockerCli;

pub const LABEL_INSTANCE: &str = "io.flowhost.instance";
pub const LABEL_DEFINITION: &str = "io.flowhost.definition";
pub const LABEL_ATTEMPT: &str = "io.flowhost.attempt";

const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const MONITOR_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ContainerBackend {
    client: Arc<dyn ContainerClient>,
    config: ContainerSection,
    api: ApiSection,
}

impl ContainerBackend {
    pub fn new(client: Arc<dyn ContainerClient>, config: ContainerSection, api: ApiSection) -> Self {
        Self {
            client,
            config,
            api,
        }
    }

    /// Backend driving the configured container CLI.
    pub fn with_cli(config: ContainerSection, api: ApiSection) -> Self {
        let client = Arc::new(DockerCli::new(config.cli.clone()));
        Self::new(client, config, api)
    }

    async fn ensure_image(&self, image: &str, cancel: &CancellationToken) -> Result<(), CreateError> {
        let pull = match self.config.pull_policy {
            PullPolicy::Always => true,
            PullPolicy::IfNotPresent | PullPolicy::Never => {
                let exists = or_cancelled(cancel, self.client.image_exists(image))
                    .await
                    .ok_or_else(CreateError::cancelled)??;
                if !exists && self.config.pull_policy == PullPolicy::Never {
                    return Err(CreateError::invalid_spec(format!(
                        "image {image} is not present and pull policy is 'never'"
                    )));
                }
                !exists
            }
        };

        if pull {
            info!(image, "pulling runner image");
            or_cancelled(cancel, self.client.pull_image(image))
                .await
                .ok_or_else(CreateError::cancelled)?
                .map_err(|e| pull_failure(image, e))?;
        }
        Ok(())
    }

    fn spec_for(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        ctx: &LaunchContext,
        image: String,
    ) -> ContainerSpec {
        let mut env: Vec<(String, String)> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(runner_environment(definition, instance, ctx, &self.api));

        ContainerSpec {
            name: container_name(&instance.id, ctx.attempt),
            image,
            env,
            labels: BTreeMap::from([
                (LABEL_INSTANCE.to_string(), instance.id.clone()),
                (LABEL_DEFINITION.to_string(), definition.reference().to_string()),
                (LABEL_ATTEMPT.to_string(), ctx.attempt.to_string()),
            ]),
            network: self.config.network.clone(),
            cpus: self.config.cpus,
            memory: self.config.memory.clone(),
        }
    }

    async fn remove_quietly(&self, id: &str) {
        if let Err(e) = self.client.remove(id, true).await {
            if !e.is_not_found() {
                warn!(container = id, error = %e, "failed to roll back container");
            }
        }
    }
}

impl RuntimeBackend for ContainerBackend {
    fn mode(&self) -> RuntimeMode {
        RuntimeMode::Container
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
            let image = self.config.image_reference();
            self.ensure_image(&image, &ctx.cancel).await?;

            let spec = self.spec_for(definition, instance, ctx, image);
            let create = self.client.create(&spec);
            tokio::pin!(create);

            let id = tokio::select! {
                res = &mut create => res.map_err(CreateError::from)?,
                _ = ctx.cancel.cancelled() => {
                    // The engine may still be creating; let it finish, then undo.
                    if let Ok(id) = create.await {
                        self.remove_quietly(&id).await;
                    }
                    return Err(CreateError::cancelled());
                }
            };

            let label = process_label(instance, ctx);
            debug!(process = %label, container = %id, name = %spec.name, "container created");
            let driver = ContainerDriver {
                client: self.client.clone(),
                id,
                label: label.clone(),
                monitor: None,
            };
            Ok(ProcessHandle::new(
                RuntimeMode::Container,
                label,
                Box::new(driver),
            ))
        })
    }
}

/// `flowhost-<instance>-<attempt>-<random>`, restricted to the characters
/// container engines accept in names.
pub fn container_name(instance_id: &str, attempt: u32) -> String {
    let safe: String = instance_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("flowhost-{safe}-{attempt}-{}", &suffix[..8])
}

fn pull_failure(image: &str, e: ClientError) -> CreateError {
    let kind = match e.kind {
        ClientErrorKind::Unreachable => CreateErrorKind::BackendUnreachable,
        ClientErrorKind::QuotaExceeded => CreateErrorKind::QuotaExceeded,
        _ => CreateErrorKind::InvalidSpec,
    };
    CreateError::new(kind, format!("image pull failed for {image}: {}", e.message))
}

fn start_failure(e: ClientError) -> StartError {
    match e.kind {
        ClientErrorKind::QuotaExceeded => StartError::ResourceExhausted(e.message),
        ClientErrorKind::PermissionDenied => StartError::PermissionDenied(e.message),
        ClientErrorKind::NotFound if e.message.contains("executable file not found") => {
            StartError::ExecutableNotFound(e.message)
        }
        _ => StartError::BackendUnavailable(e.message),
    }
}

/// Stop requests against a container that already stopped are fine.
fn stop_result(e: ClientError) -> Result<(), StopError> {
    if e.is_not_found() || e.message.contains("is not running") {
        Ok(())
    } else {
        Err(StopError::Backend(e.to_string()))
    }
}

/// Drives one created container.
pub struct ContainerDriver {
    client: Arc<dyn ContainerClient>,
    id: String,
    label: String,
    monitor: Option<JoinHandle<()>>,
}

impl ProcessDriver for ContainerDriver {
    fn process_id(&self) -> Option<String> {
        Some(self.id.clone())
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
            match or_cancelled(cancel, self.client.start(&self.id)).await {
                None => return Err(StartError::Cancelled),
                Some(Err(e)) => return Err(start_failure(e)),
                Some(Ok(())) => {}
            }

            let client = self.client.clone();
            let id = self.id.clone();
            let io = io.clone();
            let label = self.label.clone();
            self.monitor = Some(tokio::spawn(async move {
                let logs = {
                    let client = client.clone();
                    let id = id.clone();
                    let io = io.clone();
                    tokio::spawn(async move { client.logs(&id, io).await })
                };

                let code = match client.wait(&id).await {
                    Ok(code) => i32::try_from(code).unwrap_or(i32::MAX),
                    Err(e) => {
                        warn!(process = %label, error = %e, "waiting for container failed");
                        FORCED_KILL_EXIT_CODE
                    }
                };

                match timeout(LOG_DRAIN_TIMEOUT, logs).await {
                    Ok(Ok(Err(e))) => debug!(process = %label, error = %e, "log follower ended"),
                    Err(_) => debug!(process = %label, "log follower still running after exit"),
                    _ => {}
                }
                info!(process = %label, exit_code = code, "container exited");
                io.emit_exit(code);
            }));
            Ok(())
        })
    }

    fn terminate(&mut self, _grace: Duration) -> BoxFuture<'_, Result<(), StopError>> {
        Box::pin(async move {
            match self.client.kill(&self.id, "TERM").await {
                Ok(()) => Ok(()),
                Err(e) => stop_result(e),
            }
        })
    }

    fn kill(&mut self) -> BoxFuture<'_, Result<(), StopError>> {
        Box::pin(async move {
            match self.client.kill(&self.id, "KILL").await {
                Ok(()) => Ok(()),
                Err(e) => stop_result(e),
            }
        })
    }

    fn release(&mut self) -> BoxFuture<'_, Result<(), StopError>> {
        Box::pin(async move {
            let removed = match self.client.remove(&self.id, true).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(StopError::Backend(e.to_string())),
            };
            if let Some(mut monitor) = self.monitor.take() {
                if timeout(MONITOR_STOP_TIMEOUT, &mut monitor).await.is_err() {
                    monitor.abort();
                }
            }
            debug!(process = %self.label, container = %self.id, "container removed");
            removed
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::workflow::DefinitionRef;

    /// In-memory engine: containers "run" until killed or `finish` is called.
    #[derive(Default)]
    struct FakeEngine {
        calls: Mutex<Vec<String>>,
        images: Mutex<Vec<String>>,
        create_delay: Option<Duration>,
        exited: Notify,
        exit_code: Mutex<Option<i64>>,
    }

    impl FakeEngine {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn finish(&self, code: i64) {
            *self.exit_code.lock().unwrap() = Some(code);
            self.exited.notify_waiters();
        }
    }

    impl ContainerClient for FakeEngine {
        fn image_exists<'a>(&'a self, image: &'a str) -> BoxFuture<'a, Result<bool, ClientError>> {
            Box::pin(async move { Ok(self.images.lock().unwrap().iter().any(|i| i == image)) })
        }

        fn pull_image<'a>(&'a self, image: &'a str) -> BoxFuture<'a, Result<(), ClientError>> {
            Box::pin(async move {
                self.record(format!("pull {image}"));
                self.images.lock().unwrap().push(image.to_string());
                Ok(())
            })
        }

        fn create<'a>(
            &'a self,
            spec: &'a ContainerSpec,
        ) -> BoxFuture<'a, Result<String, ClientError>> {
            Box::pin(async move {
                if let Some(d) = self.create_delay {
                    tokio::time::sleep(d).await;
                }
                self.record("create".into());
                Ok(format!("id-{}", spec.name))
            })
        }

        fn start<'a>(&'a self, _id: &'a str) -> BoxFuture<'a, Result<(), ClientError>> {
            Box::pin(async move {
                self.record("start".into());
                Ok(())
            })
        }

        fn kill<'a>(
            &'a self,
            _id: &'a str,
            signal: &'a str,
        ) -> BoxFuture<'a, Result<(), ClientError>> {
            Box::pin(async move {
                self.record(format!("kill {signal}"));
                self.finish(if signal == "KILL" { 137 } else { 143 });
                Ok(())
            })
        }

        fn remove<'a>(&'a self, _id: &'a str, force: bool) -> BoxFuture<'a, Result<(), ClientError>> {
            Box::pin(async move {
                self.record(format!("rm force={force}"));
                Ok(())
            })
        }

        fn wait<'a>(&'a self, _id: &'a str) -> BoxFuture<'a, Result<i64, ClientError>> {
            Box::pin(async move {
                loop {
                    let notified = self.exited.notified();
                    if let Some(code) = *self.exit_code.lock().unwrap() {
                        return Ok(code);
                    }
                    notified.await;
                }
            })
        }

        fn logs<'a>(&'a self, _id: &'a str, io: ProcessIo) -> BoxFuture<'a, Result<(), ClientError>> {
            Box::pin(async move {
                io.emit_stdout("{\"y\":2}");
                Ok(())
            })
        }
    }

    fn fixtures() -> (WorkflowDefinition, WorkflowInstance) {
        (
            WorkflowDefinition::new("echo", "v1", json!({})),
            WorkflowInstance::new("wf-1", DefinitionRef::new("echo", "v1"), json!({"x": 1})),
        )
    }

    fn backend(engine: Arc<FakeEngine>, policy: PullPolicy) -> ContainerBackend {
        let config = ContainerSection {
            pull_policy: policy,
            ..ContainerSection::default()
        };
        ContainerBackend::new(engine, config, ApiSection::default())
    }

    #[tokio::test]
    async fn pulls_missing_image_then_runs_to_exit() {
        let engine = Arc::new(FakeEngine::default());
        let b = backend(engine.clone(), PullPolicy::IfNotPresent);
        let (def, inst) = fixtures();
        let ctx = LaunchContext::new(1, json!({"x": 1}));

        let mut handle = b.create_process(&def, &inst, &ctx).await.unwrap();
        handle.start(&ctx.cancel).await.unwrap();
        engine.finish(0);

        assert_eq!(handle.exited().wait().await, Some(0));
        assert_eq!(handle.transcript().last_stdout.as_deref(), Some("{\"y\":2}"));
        handle.dispose().await;

        assert_eq!(
            engine.calls(),
            vec!["pull flowhost/runner:latest", "create", "start", "rm force=true"]
        );
    }

    #[tokio::test]
    async fn never_policy_without_image_is_invalid_spec() {
        let engine = Arc::new(FakeEngine::default());
        let b = backend(engine.clone(), PullPolicy::Never);
        let (def, inst) = fixtures();
        let ctx = LaunchContext::new(1, json!({}));

        let err = b.create_process(&def, &inst, &ctx).await.unwrap_err();
        assert_eq!(err.kind, CreateErrorKind::InvalidSpec);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn cancelled_create_is_rolled_back() {
        let engine = Arc::new(FakeEngine {
            create_delay: Some(Duration::from_millis(50)),
            images: Mutex::new(vec!["flowhost/runner:latest".into()]),
            ..FakeEngine::default()
        });
        let b = backend(engine.clone(), PullPolicy::IfNotPresent);
        let (def, inst) = fixtures();
        let ctx = LaunchContext::new(1, json!({}));

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let err = b.create_process(&def, &inst, &ctx).await.unwrap_err();
        assert_eq!(err.kind, CreateErrorKind::Cancelled);
        assert_eq!(engine.calls(), vec!["create", "rm force=true"]);
    }

    #[tokio::test]
    async fn graceful_stop_sends_term() {
        let engine = Arc::new(FakeEngine::default());
        let b = backend(engine.clone(), PullPolicy::Always);
        let (def, inst) = fixtures();
        let ctx = LaunchContext::new(1, json!({}));

        let mut handle = b.create_process(&def, &inst, &ctx).await.unwrap();
        handle.start(&ctx.cancel).await.unwrap();
        handle.stop(Duration::from_secs(1)).await.unwrap();

        assert_eq!(handle.exit_code(), Some(143));
        assert!(engine.calls().contains(&"kill TERM".to_string()));
        assert!(!engine.calls().contains(&"kill KILL".to_string()));
        handle.dispose().await;
    }

    #[test]
    fn container_names_are_sanitized_and_unique() {
        let a = container_name("orders/42", 3);
        let b = container_name("orders/42", 3);
        assert!(a.starts_with("flowhost-orders-42-3-"), "{a}");
        assert_ne!(a, b);
    }
}
