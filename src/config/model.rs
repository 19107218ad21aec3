// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::controller::ControllerOptions;
use crate::correlation::CorrelationRule;
use crate::types::{PullPolicy, RuntimeMode};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// definitions = "workflows"
///
/// [runtime]
/// mode = "container"
///
/// [runtime.container]
/// image = "flowhost/runner"
/// registry = "ghcr.io/acme"
/// tag = "1.4.0"
/// network = "flowhost"
///
/// [api]
/// endpoint = "http://flowhost-api:42286"
///
/// [scheduler]
/// liveness_timeout = "30m"
///
/// [scheduler.retry]
/// max_attempts = 3
/// ```
///
/// All sections are optional and have reasonable defaults, except that the
/// native runtime needs `[runtime.native].executable` when selected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub runtime: RuntimeSection,

    #[serde(default)]
    pub api: ApiSection,

    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub correlation: CorrelationSection,

    /// Directory of `*.json` workflow definitions loaded at startup.
    #[serde(default)]
    pub definitions: Option<PathBuf>,
}

/// `[runtime]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeSection {
    #[serde(default)]
    pub mode: RuntimeMode,

    #[serde(default)]
    pub native: Option<NativeSection>,

    #[serde(default)]
    pub container: Option<ContainerSection>,

    #[serde(default)]
    pub cluster: Option<ClusterSection>,
}

/// `[runtime.native]`: spawn a local runner executable per instance.
#[derive(Debug, Clone, Deserialize)]
pub struct NativeSection {
    pub executable: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    /// Defaults to the daemon's working directory.
    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// Extra environment variables for every process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// `[runtime.container]`: run each instance in a container.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSection {
    #[serde(default = "default_runner_image")]
    pub image: String,

    #[serde(default)]
    pub registry: Option<String>,

    #[serde(default = "default_image_tag")]
    pub tag: String,

    #[serde(default)]
    pub pull_policy: PullPolicy,

    #[serde(default)]
    pub network: Option<String>,

    /// CPU limit, e.g. `1.5`.
    #[serde(default)]
    pub cpus: Option<f64>,

    /// Memory limit in container CLI syntax, e.g. `"512m"`.
    #[serde(default)]
    pub memory: Option<String>,

    /// Container CLI binary.
    #[serde(default = "default_docker_cli")]
    pub cli: String,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            image: default_runner_image(),
            registry: None,
            tag: default_image_tag(),
            pull_policy: PullPolicy::default(),
            network: None,
            cpus: None,
            memory: None,
            cli: default_docker_cli(),
            env: BTreeMap::new(),
        }
    }
}

impl ContainerSection {
    /// Fully qualified image reference: `[registry/]image:tag`.
    pub fn image_reference(&self) -> String {
        let name = match &self.registry {
            Some(registry) if !registry.is_empty() => {
                format!("{}/{}", registry.trim_end_matches('/'), self.image)
            }
            _ => self.image.clone(),
        };
        // An explicit tag or digest in `image` wins over `tag`.
        let last_segment = name.rsplit('/').next().unwrap_or(&name);
        if last_segment.contains(':') || last_segment.contains('@') {
            name
        } else {
            format!("{name}:{}", self.tag)
        }
    }
}

/// `[runtime.cluster]`: submit a pod per instance to a cluster namespace.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSection {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Runner image used by the built-in pod template.
    #[serde(default = "default_cluster_image")]
    pub image: String,

    /// Optional JSON pod template replacing the built-in one.
    #[serde(default)]
    pub template: Option<PathBuf>,

    #[serde(default = "default_kubectl_cli")]
    pub cli: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    #[serde(default)]
    pub service_account: Option<String>,

    /// Workload names are `<name_prefix>-<instance>-<attempt>`.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            image: default_cluster_image(),
            template: None,
            cli: default_kubectl_cli(),
            poll_interval: default_poll_interval(),
            service_account: None,
            name_prefix: default_name_prefix(),
            env: BTreeMap::new(),
        }
    }
}

/// `[api]`: how runner processes reach the flowhost API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_api_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub token: Option<String>,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            endpoint: default_api_endpoint(),
            token: None,
        }
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    /// How long `suspend` waits for a graceful exit before killing.
    #[serde(default = "default_graceful_stop_timeout")]
    pub graceful_stop_timeout: String,

    /// Maximum run duration of one attempt without exiting.
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout: String,

    /// Optional: fault an attempt that prints nothing for this long.
    #[serde(default)]
    pub output_idle_timeout: Option<String>,

    /// Deadline for one create + start sequence.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout: String,

    #[serde(default)]
    pub retry: RetrySection,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            graceful_stop_timeout: default_graceful_stop_timeout(),
            liveness_timeout: default_liveness_timeout(),
            output_idle_timeout: None,
            operation_timeout: default_operation_timeout(),
            retry: RetrySection::default(),
        }
    }
}

/// `[scheduler.retry]` section. The default of one attempt disables retries.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: String,

    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

/// `[correlation]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationSection {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,

    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleSection>,
}

impl Default for CorrelationSection {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
            rules: Vec::new(),
        }
    }
}

/// `[[correlation.rule]]`.
///
/// ```toml
/// [[correlation.rule]]
/// name = "order-ready"
/// workflow = "fulfil-order@1.0.0"
/// key = "orderid"
/// ttl = "10m"
///
/// [[correlation.rule.filter]]
/// type = "com.acme.order.*"
/// attributes = { region = "^eu-" }
///
/// [correlation.rule.completion]
/// all_of = ["com.acme.order.paid", "com.acme.order.packed"]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSection {
    pub name: String,

    /// Definition started when the rule is satisfied (`id@version`).
    pub workflow: String,

    /// Event attribute whose value is the correlation key (`subject`,
    /// `source`, an extension name, or `data.<field>`).
    pub key: String,

    #[serde(default = "default_correlation_ttl")]
    pub ttl: String,

    #[serde(default, rename = "filter")]
    pub filters: Vec<FilterSection>,

    pub completion: CompletionSection,
}

/// `[[correlation.rule.filter]]`.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterSection {
    /// Event type glob, e.g. `com.acme.order.*`.
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub source: Option<String>,

    /// Attribute name -> regex the attribute value must match.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// `[correlation.rule.completion]`: exactly one of `all_of` or `any_of`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionSection {
    #[serde(default)]
    pub all_of: Vec<String>,

    #[serde(default)]
    pub any_of: Option<String>,

    /// With `any_of`: how many occurrences are needed.
    #[serde(default = "default_completion_count")]
    pub count: u32,
}

/// Validated configuration.
///
/// Built from [`RawConfigFile`] via `TryFrom`, see `validate.rs`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub runtime: RuntimeSection,
    pub api: ApiSection,
    pub controller: ControllerOptions,
    pub correlation: CorrelationOptions,
    pub cluster_poll_interval: Duration,
    pub definitions: Option<PathBuf>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        raw: RawConfigFile,
        controller: ControllerOptions,
        correlation: CorrelationOptions,
        cluster_poll_interval: Duration,
    ) -> Self {
        Self {
            runtime: raw.runtime,
            api: raw.api,
            controller,
            correlation,
            cluster_poll_interval,
            definitions: raw.definitions,
        }
    }

    pub fn container_section(&self) -> ContainerSection {
        self.runtime.container.clone().unwrap_or_default()
    }

    pub fn cluster_section(&self) -> ClusterSection {
        self.runtime.cluster.clone().unwrap_or_default()
    }
}

/// Compiled correlation settings.
#[derive(Debug, Clone)]
pub struct CorrelationOptions {
    pub sweep_interval: Duration,
    pub rules: Vec<CorrelationRule>,
}

fn default_runner_image() -> String {
    "flowhost/runner".to_string()
}

fn default_image_tag() -> String {
    "latest".to_string()
}

fn default_docker_cli() -> String {
    "docker".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_cluster_image() -> String {
    "flowhost/runner:latest".to_string()
}

fn default_kubectl_cli() -> String {
    "kubectl".to_string()
}

fn default_poll_interval() -> String {
    "2s".to_string()
}

fn default_name_prefix() -> String {
    "flowhost".to_string()
}

fn default_api_endpoint() -> String {
    "http://localhost:42286".to_string()
}

fn default_graceful_stop_timeout() -> String {
    "10s".to_string()
}

fn default_liveness_timeout() -> String {
    "1h".to_string()
}

fn default_operation_timeout() -> String {
    "2m".to_string()
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_backoff() -> String {
    "1s".to_string()
}

fn default_max_backoff() -> String {
    "1m".to_string()
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_sweep_interval() -> String {
    "5s".to_string()
}

fn default_correlation_ttl() -> String {
    "10m".to_string()
}

fn default_completion_count() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(image: &str, registry: Option<&str>) -> ContainerSection {
        ContainerSection {
            image: image.to_string(),
            registry: registry.map(str::to_string),
            tag: "1.2".to_string(),
            ..ContainerSection::default()
        }
    }

    #[test]
    fn image_reference_joins_registry_and_tag() {
        assert_eq!(
            section("flowhost/runner", Some("ghcr.io/acme/")).image_reference(),
            "ghcr.io/acme/flowhost/runner:1.2"
        );
        assert_eq!(section("runner", None).image_reference(), "runner:1.2");
    }

    #[test]
    fn explicit_image_tag_wins() {
        assert_eq!(
            section("runner:edge", Some("localhost:5000")).image_reference(),
            "localhost:5000/runner:edge"
        );
        assert_eq!(
            section("localhost:5000/runner", None).image_reference(),
            "localhost:5000/runner:1.2"
        );
    }
}
