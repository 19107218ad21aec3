// src/backend/container/docker.rs

//! [`ContainerClient`] over the `docker` CLI (or a compatible one such as
//! `podman`).

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::BoxFuture;
use crate::backend::client::{run_cli, spawn_error};
use crate::backend::container::{ContainerClient, ContainerSpec};
use crate::backend::{ClientError, ClientErrorKind};
use crate::process::{OutputChannel, ProcessIo, spawn_line_pump};

const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<String, ClientError> {
        run_cli(&self.binary, &args, None).await
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// Arguments for `docker create`.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
    if let Some(network) = &spec.network {
        args.push("--network".into());
        args.push(network.clone());
    }
    if let Some(cpus) = spec.cpus {
        args.push("--cpus".into());
        args.push(cpus.to_string());
    }
    if let Some(memory) = &spec.memory {
        args.push("--memory".into());
        args.push(memory.clone());
    }
    for (k, v) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{k}={v}"));
    }
    for (k, v) in &spec.env {
        args.push("--env".into());
        args.push(format!("{k}={v}"));
    }
    args.push(spec.image.clone());
    args
}

impl ContainerClient for DockerCli {
    fn image_exists<'a>(&'a self, image: &'a str) -> BoxFuture<'a, Result<bool, ClientError>> {
        Box::pin(async move {
            let args = vec![
                "image".into(),
                "inspect".into(),
                "--format".into(),
                "{{.Id}}".into(),
                image.to_string(),
            ];
            match self.run(args).await {
                Ok(_) => Ok(true),
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn pull_image<'a>(&'a self, image: &'a str) -> BoxFuture<'a, Result<(), ClientError>> {
        Box::pin(async move {
            self.run(vec!["pull".into(), "--quiet".into(), image.to_string()])
                .await
                .map(|_| ())
        })
    }

    fn create<'a>(&'a self, spec: &'a ContainerSpec) -> BoxFuture<'a, Result<String, ClientError>> {
        Box::pin(async move {
            let id = self.run(create_args(spec)).await?;
            // `docker create` may print pull progress before the id.
            id.lines()
                .last()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .ok_or_else(|| {
                    ClientError::new(ClientErrorKind::Other, "container create printed no id")
                })
        })
    }

    fn start<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ClientError>> {
        Box::pin(async move {
            self.run(vec!["start".into(), id.to_string()])
                .await
                .map(|_| ())
        })
    }

    fn kill<'a>(&'a self, id: &'a str, signal: &'a str) -> BoxFuture<'a, Result<(), ClientError>> {
        Box::pin(async move {
            self.run(vec![
                "kill".into(),
                "--signal".into(),
                signal.to_string(),
                id.to_string(),
            ])
            .await
            .map(|_| ())
        })
    }

    fn remove<'a>(&'a self, id: &'a str, force: bool) -> BoxFuture<'a, Result<(), ClientError>> {
        Box::pin(async move {
            let mut args = vec!["rm".to_string()];
            if force {
                args.push("--force".into());
            }
            args.push(id.to_string());
            self.run(args).await.map(|_| ())
        })
    }

    fn wait<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<i64, ClientError>> {
        Box::pin(async move {
            let out = self.run(vec!["wait".into(), id.to_string()]).await?;
            out.lines()
                .last()
                .and_then(|l| l.trim().parse::<i64>().ok())
                .ok_or_else(|| {
                    ClientError::new(
                        ClientErrorKind::Other,
                        format!("unexpected `wait` output: {out:?}"),
                    )
                })
        })
    }

    fn logs<'a>(&'a self, id: &'a str, io: ProcessIo) -> BoxFuture<'a, Result<(), ClientError>> {
        Box::pin(async move {
            let mut child = Command::new(&self.binary)
                .args(["logs", "--follow", id])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| spawn_error(&self.binary, &e))?;

            let pumps = [
                child
                    .stdout
                    .take()
                    .map(|o| spawn_line_pump(o, io.clone(), OutputChannel::Stdout, id.to_string())),
                child
                    .stderr
                    .take()
                    .map(|e| spawn_line_pump(e, io.clone(), OutputChannel::Stderr, id.to_string())),
            ];

            let status = child.wait().await.map_err(|e| {
                ClientError::new(ClientErrorKind::Other, format!("following logs of {id}: {e}"))
            })?;
            for pump in pumps.into_iter().flatten() {
                let _ = timeout(LOG_DRAIN_TIMEOUT, pump).await;
            }
            if status.success() {
                Ok(())
            } else {
                Err(ClientError::new(
                    ClientErrorKind::Other,
                    format!("log follower for {id} exited with {status}"),
                ))
            }
        })
    }
}
