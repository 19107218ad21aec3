// src/backend/cluster/kubectl.rs

//! [`ClusterClient`] over `kubectl`.

use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tokio::time::timeout;

use crate::BoxFuture;
use crate::backend::client::{run_cli, spawn_error};
use crate::backend::cluster::{ClusterClient, DeleteMode, WorkloadPhase, WorkloadStatus};
use crate::backend::{ClientError, ClientErrorKind};
use crate::process::{OutputChannel, ProcessIo, spawn_line_pump};

const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: String,
}

impl Kubectl {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for Kubectl {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

/// Extract phase and runner exit code from `kubectl get pod -o json` output.
pub fn parse_pod_status(pod: &Value) -> WorkloadStatus {
    let status = &pod["status"];
    let phase = status["phase"]
        .as_str()
        .map(WorkloadPhase::parse)
        .unwrap_or(WorkloadPhase::Pending);

    let terminated = status["containerStatuses"]
        .as_array()
        .and_then(|cs| cs.first())
        .map(|c| &c["state"]["terminated"])
        .filter(|t| t.is_object());

    let exit_code = terminated
        .and_then(|t| t["exitCode"].as_i64())
        .and_then(|c| i32::try_from(c).ok());
    let reason = terminated
        .and_then(|t| t["reason"].as_str())
        .or_else(|| status["reason"].as_str())
        .map(str::to_string);

    WorkloadStatus {
        phase,
        exit_code,
        reason,
    }
}

/// Arguments for `kubectl delete`.
pub fn delete_args(namespace: &str, name: &str, mode: DeleteMode) -> Vec<String> {
    let mut args = vec![
        "delete".to_string(),
        "pod".to_string(),
        name.to_string(),
        "--namespace".to_string(),
        namespace.to_string(),
        "--ignore-not-found".to_string(),
        "--wait=false".to_string(),
    ];
    match mode {
        DeleteMode::Graceful(grace) => {
            // Zero would mean "immediate" to the API server.
            args.push(format!("--grace-period={}", grace.as_secs().max(1)));
        }
        DeleteMode::Force => {
            args.push("--grace-period=0".to_string());
            args.push("--force".to_string());
        }
    }
    args
}

impl ClusterClient for Kubectl {
    fn submit<'a>(
        &'a self,
        namespace: &'a str,
        manifest: &'a Value,
    ) -> BoxFuture<'a, Result<String, ClientError>> {
        Box::pin(async move {
            let body = serde_json::to_vec(manifest).map_err(|e| {
                ClientError::new(ClientErrorKind::InvalidRequest, format!("encoding manifest: {e}"))
            })?;
            let args: Vec<String> = ["create", "--namespace", namespace, "--output", "name", "-f", "-"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            let out = run_cli(&self.binary, &args, Some(&body)).await?;
            // `pod/<name>`
            Ok(out.rsplit('/').next().unwrap_or(&out).to_string())
        })
    }

    fn status<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<WorkloadStatus, ClientError>> {
        Box::pin(async move {
            let args: Vec<String> = ["get", "pod", name, "--namespace", namespace, "--output", "json"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            let out = run_cli(&self.binary, &args, None).await?;
            let pod: Value = serde_json::from_str(&out).map_err(|e| {
                ClientError::new(ClientErrorKind::Other, format!("decoding pod {name}: {e}"))
            })?;
            Ok(parse_pod_status(&pod))
        })
    }

    fn logs<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        io: ProcessIo,
    ) -> BoxFuture<'a, Result<(), ClientError>> {
        Box::pin(async move {
            let mut child = Command::new(&self.binary)
                .args(["logs", "--follow", name, "--namespace", namespace])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| spawn_error(&self.binary, &e))?;

            // The API merges the runner's streams; everything arrives on stdout.
            let pump = child
                .stdout
                .take()
                .map(|o| spawn_line_pump(o, io, OutputChannel::Stdout, name.to_string()));

            let status = child.wait().await.map_err(|e| {
                ClientError::new(ClientErrorKind::Other, format!("following logs of {name}: {e}"))
            })?;
            if let Some(pump) = pump {
                let _ = timeout(LOG_DRAIN_TIMEOUT, pump).await;
            }
            if status.success() {
                Ok(())
            } else {
                Err(ClientError::new(
                    ClientErrorKind::Other,
                    format!("log follower for {name} exited with {status}"),
                ))
            }
        })
    }

    fn delete<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        mode: DeleteMode,
    ) -> BoxFuture<'a, Result<(), ClientError>> {
        Box::pin(async move {
            run_cli(&self.binary, &delete_args(namespace, name, mode), None)
                .await
                .map(|_| ())
        })
    }
}
