// src/backend/mod.rs

//! Pluggable runtime backend abstraction.
//!
//! The controller talks to a `RuntimeBackend` instead of a concrete
//! substrate. Each backend turns a definition + instance pair into a
//! [`ProcessHandle`] that the controller then starts, supervises and
//! disposes:
//!
//! - [`native::NativeBackend`] spawns a local runner executable,
//! - [`container::ContainerBackend`] creates a container through a
//!   [`container::ContainerClient`],
//! - [`cluster::ClusterBackend`] submits a pod through a
//!   [`cluster::ClusterClient`].
//!
//! Tests provide their own `RuntimeBackend` that scripts process behaviour
//! without touching the OS.

pub mod client;
pub mod cluster;
pub mod container;
pub mod native;
pub mod selector;

use std::fmt;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::BoxFuture;
use crate::config::ApiSection;
use crate::process::ProcessHandle;
use crate::types::RuntimeMode;
use crate::workflow::{FaultCause, WorkflowDefinition, WorkflowInstance};

pub use client::{ClientError, ClientErrorKind};
pub use selector::{RuntimePolicy, RuntimeSelector};

/// Environment variable names handed to every runner process.
pub const ENV_INSTANCE_ID: &str = "FLOWHOST_INSTANCE_ID";
pub const ENV_DEFINITION: &str = "FLOWHOST_DEFINITION";
pub const ENV_ATTEMPT: &str = "FLOWHOST_ATTEMPT";
pub const ENV_INPUT: &str = "FLOWHOST_INPUT";
pub const ENV_API_ENDPOINT: &str = "FLOWHOST_API_ENDPOINT";
pub const ENV_API_TOKEN: &str = "FLOWHOST_API_TOKEN";

/// Per-attempt launch parameters.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Effective input: the instance input, or prior output on resume.
    pub input: Value,
    /// Fires when the launch should be abandoned.
    pub cancel: CancellationToken,
}

impl LaunchContext {
    pub fn new(attempt: u32, input: Value) -> Self {
        Self {
            attempt,
            input,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateErrorKind {
    BackendUnreachable,
    InvalidSpec,
    QuotaExceeded,
    Cancelled,
    Unknown,
}

impl fmt::Display for CreateErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CreateErrorKind::BackendUnreachable => "backend unreachable",
            CreateErrorKind::InvalidSpec => "invalid spec",
            CreateErrorKind::QuotaExceeded => "quota exceeded",
            CreateErrorKind::Cancelled => "cancelled",
            CreateErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Failure to materialize a process. Anything partially created has been
/// rolled back by the time this is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct CreateError {
    pub kind: CreateErrorKind,
    pub message: String,
}

impl CreateError {
    pub fn new(kind: CreateErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(CreateErrorKind::Cancelled, "process creation cancelled")
    }

    pub fn invalid_spec(message: impl Into<String>) -> Self {
        Self::new(CreateErrorKind::InvalidSpec, message)
    }

    pub fn fault_cause(&self) -> FaultCause {
        match self.kind {
            CreateErrorKind::BackendUnreachable => FaultCause::BackendUnavailable,
            CreateErrorKind::InvalidSpec => FaultCause::InvalidSpec,
            CreateErrorKind::QuotaExceeded => FaultCause::ResourceExhausted,
            CreateErrorKind::Cancelled => FaultCause::Timeout,
            CreateErrorKind::Unknown => FaultCause::Unknown,
        }
    }
}

impl From<ClientError> for CreateError {
    fn from(e: ClientError) -> Self {
        let kind = match e.kind {
            ClientErrorKind::Unreachable => CreateErrorKind::BackendUnreachable,
            ClientErrorKind::QuotaExceeded => CreateErrorKind::QuotaExceeded,
            ClientErrorKind::NotFound
            | ClientErrorKind::InvalidRequest
            | ClientErrorKind::PermissionDenied => CreateErrorKind::InvalidSpec,
            ClientErrorKind::Conflict | ClientErrorKind::Other => CreateErrorKind::Unknown,
        };
        CreateError::new(kind, e.message)
    }
}

/// Materializes [`ProcessHandle`]s on one execution substrate.
pub trait RuntimeBackend: Send + Sync {
    fn mode(&self) -> RuntimeMode;

    /// Prepare (but do not start) the process for one attempt.
    ///
    /// Must honour `ctx.cancel` and roll back anything it created before
    /// returning an error.
    fn create_process<'a>(
        &'a self,
        definition: &'a WorkflowDefinition,
        instance: &'a WorkflowInstance,
        ctx: &'a LaunchContext,
    ) -> BoxFuture<'a, Result<ProcessHandle, CreateError>>;
}

/// Label used for logs and process naming: `<instance>#<attempt>`.
pub fn process_label(instance: &WorkflowInstance, ctx: &LaunchContext) -> String {
    format!("{}#{}", instance.id, ctx.attempt)
}

/// Environment every runner receives, whatever the substrate.
pub fn runner_environment(
    definition: &WorkflowDefinition,
    instance: &WorkflowInstance,
    ctx: &LaunchContext,
    api: &ApiSection,
) -> Vec<(String, String)> {
    let mut env = vec![
        (ENV_INSTANCE_ID.to_string(), instance.id.clone()),
        (ENV_DEFINITION.to_string(), definition.reference().to_string()),
        (ENV_ATTEMPT.to_string(), ctx.attempt.to_string()),
        (ENV_INPUT.to_string(), ctx.input.to_string()),
        (ENV_API_ENDPOINT.to_string(), api.endpoint.clone()),
    ];
    if let Some(token) = &api.token {
        env.push((ENV_API_TOKEN.to_string(), token.clone()));
    }
    env
}

/// Race `fut` against `cancel`.
pub(crate) async fn or_cancelled<F, T>(cancel: &CancellationToken, fut: F) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::workflow::DefinitionRef;

    #[test]
    fn environment_carries_identity_input_and_api() {
        let def = WorkflowDefinition::new("echo", "v1", json!({}));
        let inst = WorkflowInstance::new("wf-1", DefinitionRef::new("echo", "v1"), json!({"x": 1}));
        let ctx = LaunchContext::new(2, json!({"y": 2}));
        let api = ApiSection {
            endpoint: "http://api:1".into(),
            token: Some("secret".into()),
        };

        let env = runner_environment(&def, &inst, &ctx, &api);
        let get = |k: &str| env.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());

        assert_eq!(get(ENV_INSTANCE_ID), Some("wf-1"));
        assert_eq!(get(ENV_DEFINITION), Some("echo@v1"));
        assert_eq!(get(ENV_ATTEMPT), Some("2"));
        assert_eq!(get(ENV_INPUT), Some("{\"y\":2}"));
        assert_eq!(get(ENV_API_ENDPOINT), Some("http://api:1"));
        assert_eq!(get(ENV_API_TOKEN), Some("secret"));
    }

    #[test]
    fn client_errors_map_to_create_kinds() {
        let e: CreateError = ClientError::new(ClientErrorKind::Unreachable, "down").into();
        assert_eq!(e.kind, CreateErrorKind::BackendUnreachable);
        assert_eq!(e.fault_cause(), FaultCause::BackendUnavailable);

        let e: CreateError = ClientError::new(ClientErrorKind::QuotaExceeded, "full").into();
        assert_eq!(e.fault_cause(), FaultCause::ResourceExhausted);
    }
}
