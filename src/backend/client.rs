// src/backend/client.rs

//! Errors and CLI plumbing shared by the container and cluster clients.

use std::fmt;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// Daemon / API server unreachable.
    Unreachable,
    NotFound,
    Conflict,
    QuotaExceeded,
    PermissionDenied,
    InvalidRequest,
    Other,
}

impl fmt::Display for ClientErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientErrorKind::Unreachable => "unreachable",
            ClientErrorKind::NotFound => "not found",
            ClientErrorKind::Conflict => "conflict",
            ClientErrorKind::QuotaExceeded => "quota exceeded",
            ClientErrorKind::PermissionDenied => "permission denied",
            ClientErrorKind::InvalidRequest => "invalid request",
            ClientErrorKind::Other => "error",
        };
        f.write_str(s)
    }
}

/// Failure reported by a container or cluster client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ClientErrorKind::NotFound
    }
}

/// Classify a CLI failure from its stderr text.
pub fn classify_failure(stderr: &str) -> ClientErrorKind {
    let s = stderr.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| s.contains(n));

    if has(&[
        "cannot connect",
        "error during connect",
        "connection refused",
        "is the docker daemon running",
        "unable to connect to the server",
        "no such host",
        "i/o timeout",
    ]) {
        ClientErrorKind::Unreachable
    } else if has(&["quota", "no space left", "toomanyrequests", "insufficient"]) {
        ClientErrorKind::QuotaExceeded
    } else if has(&["no such", "not found", "notfound", "does not exist", "manifest unknown"]) {
        ClientErrorKind::NotFound
    } else if has(&["forbidden", "permission denied", "unauthorized"]) {
        ClientErrorKind::PermissionDenied
    } else if has(&["conflict", "already exists", "already in use"]) {
        ClientErrorKind::Conflict
    } else if has(&["invalid", "error parsing", "unknown flag", "unknown shorthand"]) {
        ClientErrorKind::InvalidRequest
    } else {
        ClientErrorKind::Other
    }
}

/// Run `binary args...` to completion and return trimmed stdout.
///
/// The child is killed if the returned future is dropped.
pub(crate) async fn run_cli(
    binary: &str,
    args: &[String],
    stdin: Option<&[u8]>,
) -> Result<String, ClientError> {
    let subcommand = args.first().map(String::as_str).unwrap_or_default();
    debug!(cli = binary, subcommand, "invoking backend CLI");

    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| spawn_error(binary, &e))?;

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(bytes).await.map_err(|e| {
            ClientError::new(
                ClientErrorKind::Other,
                format!("writing stdin of `{binary} {subcommand}`: {e}"),
            )
        })?;
        // Close stdin so the CLI sees EOF.
        drop(pipe);
    }

    let output = child.wait_with_output().await.map_err(|e| {
        ClientError::new(
            ClientErrorKind::Other,
            format!("waiting for `{binary} {subcommand}`: {e}"),
        )
    })?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(ClientError::new(
        classify_failure(&stderr),
        format!("`{binary} {subcommand}` failed: {}", stderr.trim()),
    ))
}

pub(crate) fn spawn_error(binary: &str, e: &std::io::Error) -> ClientError {
    match e.kind() {
        std::io::ErrorKind::NotFound => ClientError::new(
            ClientErrorKind::Unreachable,
            format!("`{binary}` CLI not found on PATH"),
        ),
        std::io::ErrorKind::PermissionDenied => ClientError::new(
            ClientErrorKind::PermissionDenied,
            format!("`{binary}` CLI is not executable"),
        ),
        _ => ClientError::new(
            ClientErrorKind::Unreachable,
            format!("spawning `{binary}`: {e}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_cli_failures() {
        assert_eq!(
            classify_failure(
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?"
            ),
            ClientErrorKind::Unreachable
        );
        assert_eq!(
            classify_failure("Error: No such container: flowhost-wf-1"),
            ClientErrorKind::NotFound
        );
        assert_eq!(
            classify_failure(
                "Error from server (Forbidden): pods \"x\" is forbidden: exceeded quota: compute"
            ),
            ClientErrorKind::QuotaExceeded
        );
        assert_eq!(
            classify_failure("Error from server (AlreadyExists): pods \"x\" already exists"),
            ClientErrorKind::Conflict
        );
        assert_eq!(
            classify_failure("Error from server (Forbidden): pods is forbidden: User cannot create"),
            ClientErrorKind::PermissionDenied
        );
        assert_eq!(classify_failure("something odd"), ClientErrorKind::Other);
    }

    #[tokio::test]
    async fn missing_cli_is_unreachable() {
        let err = run_cli("flowhost-definitely-missing-cli", &["ps".into()], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ClientErrorKind::Unreachable);
    }
}
