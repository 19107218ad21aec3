pub mod builders;
pub mod mock_backend;

use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::{Result, bail};
use tracing_subscriber::{EnvFilter, fmt};

use flowhost::store::InstanceStore;
use flowhost::workflow::{InstanceStatus, WorkflowInstance};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// Poll the store until `id` reaches `status`, for at most 5 seconds.
pub async fn wait_for_status(
    store: &Arc<dyn InstanceStore>,
    id: &str,
    status: InstanceStatus,
) -> Result<WorkflowInstance> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(instance) = store.get_instance(id).await {
            if instance.status == status {
                return Ok(instance);
            }
            if instance.status.is_terminal() {
                bail!("{id} settled as {} while waiting for {status}", instance.status);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("{id} did not reach {status} in time");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
