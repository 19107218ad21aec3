// src/lib.rs

pub mod backend;
pub mod cli;
pub mod config;
pub mod controller;
pub mod correlation;
pub mod errors;
pub mod events;
pub mod keyed_lock;
pub mod logging;
pub mod process;
pub mod store;
pub mod types;
pub mod workflow;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{RuntimePolicy, RuntimeSelector};
use crate::cli::CliArgs;
use crate::config::{ConfigFile, load_and_validate, load_definitions};
use crate::controller::WorkflowController;
use crate::correlation::CorrelationListener;
use crate::events::{EventBus, MemoryEventBus};
use crate::store::{InstanceStore, MemoryStore, WatchFilter};
use crate::workflow::{DefinitionRef, WorkflowDefinition, WorkflowInstance};

/// Boxed `Send` future returned by the object-safe async traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config and definition loading
/// - the in-memory store and event bus
/// - runtime backends, the controller and the correlation listener
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let definitions = match &cfg.definitions {
        Some(dir) => load_definitions(dir)?,
        None => Vec::new(),
    };

    if args.dry_run {
        print_dry_run(&cfg, &definitions);
        return Ok(());
    }

    let store = Arc::new(MemoryStore::new());
    for definition in definitions {
        store.put_definition(definition);
    }
    let bus: Arc<dyn EventBus> = Arc::new(MemoryEventBus::new());

    let selector = RuntimeSelector::from_config(&cfg)?;
    let controller = WorkflowController::new(
        store.clone(),
        bus.clone(),
        selector,
        RuntimePolicy::from_config(&cfg),
        cfg.controller.clone(),
    );

    let cancel = CancellationToken::new();

    // Ctrl-C → graceful shutdown.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("Ctrl+C received; shutting down");
            cancel.cancel();
        });
    }

    let listener = CorrelationListener::new(&cfg.correlation, store.clone(), bus.clone());
    let listener_task = tokio::spawn(listener.run(cancel.child_token()));
    let controller_task = {
        let controller = controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(cancel).await })
    };

    if let Some(reference) = &args.start {
        let id = start_instance(store.as_ref(), reference, &args.input, args.instance_id.clone())
            .await?;
        info!(instance = %id, definition = %reference, "instance created from command line");
    }

    if args.once {
        wait_until_settled(store.as_ref(), &cancel).await?;
        cancel.cancel();
    }

    controller_task.await??;
    listener_task.await??;
    info!("flowhost exiting");
    Ok(())
}

async fn start_instance(
    store: &dyn InstanceStore,
    reference: &str,
    input: &str,
    id: Option<String>,
) -> Result<String> {
    let definition: DefinitionRef = reference.parse().map_err(anyhow::Error::msg)?;
    let input = serde_json::from_str(input).context("--input is not valid JSON")?;
    // Fail early with a clear message instead of a faulted instance.
    store.get_definition(&definition).await?;

    let id = id.unwrap_or_else(|| format!("{}-{}", definition.id, Uuid::new_v4().simple()));
    store
        .create_instance(WorkflowInstance::new(id.clone(), definition, input))
        .await?;
    Ok(id)
}

/// Resolve once every stored instance is terminal (or on cancellation).
async fn wait_until_settled(store: &dyn InstanceStore, cancel: &CancellationToken) -> Result<()> {
    let mut watch = store.watch(WatchFilter::all());
    loop {
        let instances = store.list_instances().await?;
        let open = instances.iter().filter(|i| !i.status.is_terminal()).count();
        if open == 0 {
            info!(total = instances.len(), "all instances settled");
            return Ok(());
        }
        debug!(open, "waiting for instances to settle");

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = watch.next() => {
                if event.is_none() {
                    return Ok(());
                }
            }
        }
    }
}

/// Print the resolved configuration without starting anything.
fn print_dry_run(cfg: &ConfigFile, definitions: &[WorkflowDefinition]) {
    println!("flowhost dry-run");
    println!("  runtime.mode = {}", cfg.runtime.mode);
    match cfg.runtime.mode {
        types::RuntimeMode::Native => {
            if let Some(native) = &cfg.runtime.native {
                println!("  native.executable = {}", native.executable.display());
                if !native.args.is_empty() {
                    println!("  native.args = {:?}", native.args);
                }
            }
        }
        types::RuntimeMode::Container => {
            let container = cfg.container_section();
            println!("  container.image = {}", container.image_reference());
            println!("  container.pull_policy = {:?}", container.pull_policy);
        }
        types::RuntimeMode::Cluster => {
            let cluster = cfg.cluster_section();
            println!("  cluster.namespace = {}", cluster.namespace);
            println!("  cluster.poll_interval = {:?}", cfg.cluster_poll_interval);
        }
    }
    println!("  api.endpoint = {}", cfg.api.endpoint);

    let c = &cfg.controller;
    println!("  scheduler.graceful_stop_timeout = {:?}", c.graceful_stop_timeout);
    println!("  scheduler.liveness_timeout = {:?}", c.liveness_timeout);
    if let Some(idle) = c.output_idle_timeout {
        println!("  scheduler.output_idle_timeout = {idle:?}");
    }
    println!("  scheduler.operation_timeout = {:?}", c.operation_timeout);
    println!(
        "  scheduler.retry = {} attempt(s), backoff {:?} x{} up to {:?}",
        c.retry.max_attempts, c.retry.initial_backoff, c.retry.multiplier, c.retry.max_backoff
    );
    println!();

    println!("definitions ({}):", definitions.len());
    for d in definitions {
        match &d.name {
            Some(name) => println!("  - {} ({name})", d.reference()),
            None => println!("  - {}", d.reference()),
        }
    }

    println!("correlation rules ({}):", cfg.correlation.rules.len());
    for rule in &cfg.correlation.rules {
        println!(
            "  - {} -> {} (key: {}, ttl: {:?})",
            rule.name, rule.workflow, rule.key, rule.ttl
        );
    }

    debug!("dry-run complete (no execution)");
}
