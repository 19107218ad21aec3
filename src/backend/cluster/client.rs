// src/backend/cluster/client.rs

use std::time::Duration;

use serde_json::Value;

use crate::BoxFuture;
use crate::backend::ClientError;
use crate::process::ProcessIo;

/// Coarse workload phase, mirroring pod phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl WorkloadPhase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => WorkloadPhase::Pending,
            "Running" => WorkloadPhase::Running,
            "Succeeded" => WorkloadPhase::Succeeded,
            "Failed" => WorkloadPhase::Failed,
            _ => WorkloadPhase::Unknown,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, WorkloadPhase::Succeeded | WorkloadPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub phase: WorkloadPhase,
    /// Exit code of the runner container once it terminated.
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

/// How to delete a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Let the runner shut down within the grace period.
    Graceful(Duration),
    /// Immediate removal.
    Force,
}

/// Cluster API operations the backend needs.
pub trait ClusterClient: Send + Sync {
    /// Submit a pod manifest; returns the created workload name.
    fn submit<'a>(
        &'a self,
        namespace: &'a str,
        manifest: &'a Value,
    ) -> BoxFuture<'a, Result<String, ClientError>>;

    /// Fails with a `NotFound` error once the workload is gone.
    fn status<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<WorkloadStatus, ClientError>>;

    /// Forward the runner's log lines into `io` until the workload ends.
    fn logs<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        io: ProcessIo,
    ) -> BoxFuture<'a, Result<(), ClientError>>;

    /// Delete the workload; deleting a missing workload succeeds.
    fn delete<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        mode: DeleteMode,
    ) -> BoxFuture<'a, Result<(), ClientError>>;
}
