// tests/config_loading.rs

use std::error::Error;
use std::fs;
use std::io::Write;
use std::time::Duration;

use tempfile::{NamedTempFile, tempdir};

use flowhost::backend::RuntimeSelector;
use flowhost::config::{load_and_validate, load_definitions};
use flowhost::correlation::CompletionPredicate;
use flowhost::errors::FlowhostError;
use flowhost::types::{PullPolicy, RuntimeMode};
use flowhost_test_utils::init_tracing;

type TestResult = Result<(), Box<dyn Error>>;

#[test]
fn full_config_resolves_every_section() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("Flowhost.toml");
    fs::write(
        &path,
        r#"
definitions = "workflows"

[runtime]
mode = "container"

[runtime.container]
image = "acme/runner"
registry = "registry.acme.io"
tag = "2.1"
pull_policy = "always"

[api]
endpoint = "http://flowhost-api:8080"
token = "t0ken"

[scheduler]
graceful_stop_timeout = "5s"
liveness_timeout = "30m"
output_idle_timeout = "2m"
operation_timeout = "45s"

[scheduler.retry]
max_attempts = 4
initial_backoff = "500ms"
max_backoff = "10s"
multiplier = 3.0

[[correlation.rule]]
name = "order-ready"
workflow = "fulfil@1.0.0"
key = "orderid"
ttl = "10m"

[[correlation.rule.filter]]
type = "com.acme.order.*"
attributes = { region = "^eu-" }

[correlation.rule.completion]
any_of = "com.acme.order.item"
count = 3
"#,
    )?;

    let cfg = load_and_validate(&path)?;

    assert_eq!(cfg.runtime.mode, RuntimeMode::Container);
    let container = cfg.container_section();
    assert_eq!(container.image_reference(), "registry.acme.io/acme/runner:2.1");
    assert_eq!(container.pull_policy, PullPolicy::Always);
    assert_eq!(cfg.api.endpoint, "http://flowhost-api:8080");
    assert_eq!(cfg.api.token.as_deref(), Some("t0ken"));

    let c = &cfg.controller;
    assert_eq!(c.graceful_stop_timeout, Duration::from_secs(5));
    assert_eq!(c.liveness_timeout, Duration::from_secs(30 * 60));
    assert_eq!(c.output_idle_timeout, Some(Duration::from_secs(120)));
    assert_eq!(c.operation_timeout, Duration::from_secs(45));
    assert_eq!(c.retry.max_attempts, 4);
    assert_eq!(c.retry.initial_backoff, Duration::from_millis(500));
    assert_eq!(c.retry.backoff_before(3), Duration::from_millis(1500));
    assert_eq!(c.retry.backoff_before(10), Duration::from_secs(10));

    assert_eq!(cfg.correlation.rules.len(), 1);
    let rule = &cfg.correlation.rules[0];
    assert_eq!(rule.ttl, Duration::from_secs(600));
    assert_eq!(
        rule.completion,
        CompletionPredicate::AnyOf {
            event_type: "com.acme.order.item".into(),
            count: 3
        }
    );

    // Relative to the config file.
    assert_eq!(cfg.definitions, Some(dir.path().join("workflows")));

    let selector = RuntimeSelector::from_config(&cfg)?;
    assert!(selector.modes().contains(&RuntimeMode::Container));
    Ok(())
}

#[test]
fn unknown_runtime_mode_is_rejected() -> TestResult {
    let mut file = NamedTempFile::new()?;
    write!(file, "[runtime]\nmode = \"lambda\"\n")?;
    assert!(load_and_validate(file.path()).is_err());
    Ok(())
}

#[test]
fn bad_rule_is_reported_with_its_name() -> TestResult {
    let mut file = NamedTempFile::new()?;
    write!(
        file,
        r#"
[runtime]
mode = "container"

[[correlation.rule]]
name = "broken"
workflow = "no-version"
key = "subject"

[correlation.rule.completion]
all_of = ["a"]
"#
    )?;

    match load_and_validate(file.path()) {
        Err(FlowhostError::ConfigError(msg)) => assert!(msg.contains("broken"), "{msg}"),
        other => panic!("expected config error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn definitions_directory_loads_json_files_in_name_order() -> TestResult {
    let dir = tempdir()?;
    fs::write(
        dir.path().join("b.json"),
        r#"{"id": "ship", "version": "2", "document": {"steps": ["pack"]}}"#,
    )?;
    fs::write(
        dir.path().join("a.json"),
        r#"{"id": "bill", "version": "1", "name": "Billing"}"#,
    )?;
    fs::write(dir.path().join("notes.txt"), "ignored")?;

    let defs = load_definitions(dir.path())?;
    let refs: Vec<String> = defs.iter().map(|d| d.reference().to_string()).collect();
    assert_eq!(refs, vec!["bill@1", "ship@2"]);
    assert_eq!(defs[0].name.as_deref(), Some("Billing"));
    Ok(())
}

#[test]
fn definition_without_version_is_rejected() -> TestResult {
    let dir = tempdir()?;
    fs::write(dir.path().join("x.json"), r#"{"id": "x", "version": ""}"#)?;
    assert!(load_definitions(dir.path()).is_err());
    Ok(())
}
