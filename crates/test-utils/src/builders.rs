#![allow(dead_code)]

use std::time::Duration;

use serde_json::{Value, json};

use flowhost::controller::{ControllerOptions, RetryPolicy};
use flowhost::types::ActivationType;
use flowhost::workflow::{DefinitionRef, DesiredState, WorkflowDefinition, WorkflowInstance};

/// Builder for `WorkflowInstance` to simplify test setup.
pub struct InstanceBuilder {
    instance: WorkflowInstance,
}

impl InstanceBuilder {
    /// A `Pending` instance of `echo@v1` with `{}` as input.
    pub fn new(id: &str) -> Self {
        Self {
            instance: WorkflowInstance::new(id, DefinitionRef::new("echo", "v1"), json!({})),
        }
    }

    pub fn definition(mut self, id: &str, version: &str) -> Self {
        self.instance.definition = DefinitionRef::new(id, version);
        self
    }

    pub fn input(mut self, input: Value) -> Self {
        self.instance.input = input;
        self
    }

    pub fn desired(mut self, desired: DesiredState) -> Self {
        self.instance.desired = desired;
        self
    }

    pub fn activation(mut self, activation: ActivationType) -> Self {
        self.instance.activation = activation;
        self
    }

    pub fn build(self) -> WorkflowInstance {
        self.instance
    }
}

/// `id@version` definition with an empty document.
pub fn definition(id: &str, version: &str) -> WorkflowDefinition {
    WorkflowDefinition::new(id, version, json!({"steps": []}))
}

/// Builder for `ControllerOptions` with timeouts short enough for tests.
pub struct OptionsBuilder {
    options: ControllerOptions,
}

impl OptionsBuilder {
    pub fn new() -> Self {
        Self {
            options: ControllerOptions {
                graceful_stop_timeout: Duration::from_millis(200),
                liveness_timeout: Duration::from_secs(30),
                output_idle_timeout: None,
                operation_timeout: Duration::from_secs(2),
                retry: RetryPolicy::default(),
            },
        }
    }

    pub fn graceful_stop(mut self, d: Duration) -> Self {
        self.options.graceful_stop_timeout = d;
        self
    }

    pub fn liveness(mut self, d: Duration) -> Self {
        self.options.liveness_timeout = d;
        self
    }

    pub fn output_idle(mut self, d: Duration) -> Self {
        self.options.output_idle_timeout = Some(d);
        self
    }

    pub fn operation_timeout(mut self, d: Duration) -> Self {
        self.options.operation_timeout = d;
        self
    }

    pub fn retry(mut self, max_attempts: u32, initial_backoff: Duration) -> Self {
        self.options.retry = RetryPolicy {
            max_attempts,
            initial_backoff,
            max_backoff: initial_backoff * 8,
            multiplier: 2.0,
        };
        self
    }

    pub fn build(self) -> ControllerOptions {
        self.options
    }
}

impl Default for OptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
