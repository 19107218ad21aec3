// src/backend/container/client.rs

use std::collections::BTreeMap;

use crate::BoxFuture;
use crate::backend::ClientError;
use crate::process::ProcessIo;

/// Everything needed to create one runner container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: BTreeMap<String, String>,
    pub network: Option<String>,
    pub cpus: Option<f64>,
    pub memory: Option<String>,
}

/// Container engine operations the backend needs.
pub trait ContainerClient: Send + Sync {
    fn image_exists<'a>(&'a self, image: &'a str) -> BoxFuture<'a, Result<bool, ClientError>>;

    fn pull_image<'a>(&'a self, image: &'a str) -> BoxFuture<'a, Result<(), ClientError>>;

    /// Create (not start) a container; returns its id.
    fn create<'a>(&'a self, spec: &'a ContainerSpec) -> BoxFuture<'a, Result<String, ClientError>>;

    fn start<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ClientError>>;

    /// Deliver `signal` (`"TERM"`, `"KILL"`) to the container's main process.
    fn kill<'a>(&'a self, id: &'a str, signal: &'a str) -> BoxFuture<'a, Result<(), ClientError>>;

    fn remove<'a>(&'a self, id: &'a str, force: bool) -> BoxFuture<'a, Result<(), ClientError>>;

    /// Block until the container exits; returns its exit code.
    fn wait<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<i64, ClientError>>;

    /// Forward the container's stdout/stderr lines into `io` until it ends.
    fn logs<'a>(&'a self, id: &'a str, io: ProcessIo) -> BoxFuture<'a, Result<(), ClientError>>;
}
