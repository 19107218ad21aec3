// src/config/validate.rs

use std::collections::HashSet;
use std::time::Duration;

use crate::config::duration::parse_duration;
use crate::config::model::{
    ConfigFile, CorrelationOptions, RawConfigFile, RetrySection, SchedulerSection,
};
use crate::controller::{ControllerOptions, RetryPolicy};
use crate::correlation::CorrelationRule;
use crate::errors::{FlowhostError, Result};
use crate::types::RuntimeMode;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::FlowhostError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_runtime(&raw)?;
        let controller = controller_options(&raw.scheduler)?;
        let correlation = correlation_options(&raw)?;
        let poll = raw.runtime.cluster.clone().unwrap_or_default().poll_interval;
        let cluster_poll_interval = positive_duration("[runtime.cluster].poll_interval", &poll)?;
        Ok(ConfigFile::new_unchecked(
            raw,
            controller,
            correlation,
            cluster_poll_interval,
        ))
    }
}

fn config_error(msg: impl Into<String>) -> FlowhostError {
    FlowhostError::ConfigError(msg.into())
}

fn duration_field(field: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| config_error(format!("{field}: {e}")))
}

fn positive_duration(field: &str, value: &str) -> Result<Duration> {
    let d = duration_field(field, value)?;
    if d.is_zero() {
        return Err(config_error(format!("{field} must be greater than zero")));
    }
    Ok(d)
}

fn validate_runtime(cfg: &RawConfigFile) -> Result<()> {
    match cfg.runtime.mode {
        RuntimeMode::Native => {
            let native = cfg.runtime.native.as_ref().ok_or_else(|| {
                config_error("[runtime].mode = \"native\" requires a [runtime.native] section")
            })?;
            if native.executable.as_os_str().is_empty() {
                return Err(config_error("[runtime.native].executable must not be empty"));
            }
        }
        RuntimeMode::Container => {
            let container = cfg.runtime.container.clone().unwrap_or_default();
            if container.image.trim().is_empty() {
                return Err(config_error("[runtime.container].image must not be empty"));
            }
            if container.cpus.is_some_and(|c| !(c > 0.0)) {
                return Err(config_error("[runtime.container].cpus must be > 0"));
            }
        }
        RuntimeMode::Cluster => {
            let cluster = cfg.runtime.cluster.clone().unwrap_or_default();
            if cluster.namespace.trim().is_empty() {
                return Err(config_error("[runtime.cluster].namespace must not be empty"));
            }
        }
    }
    Ok(())
}

fn controller_options(s: &SchedulerSection) -> Result<ControllerOptions> {
    let output_idle_timeout = s
        .output_idle_timeout
        .as_deref()
        .map(|v| positive_duration("[scheduler].output_idle_timeout", v))
        .transpose()?;

    Ok(ControllerOptions {
        graceful_stop_timeout: duration_field(
            "[scheduler].graceful_stop_timeout",
            &s.graceful_stop_timeout,
        )?,
        liveness_timeout: positive_duration("[scheduler].liveness_timeout", &s.liveness_timeout)?,
        output_idle_timeout,
        operation_timeout: positive_duration(
            "[scheduler].operation_timeout",
            &s.operation_timeout,
        )?,
        retry: retry_policy(&s.retry)?,
    })
}

fn retry_policy(r: &RetrySection) -> Result<RetryPolicy> {
    if r.max_attempts == 0 {
        return Err(config_error(
            "[scheduler.retry].max_attempts must be >= 1 (got 0)",
        ));
    }
    if !(r.multiplier >= 1.0) || !r.multiplier.is_finite() {
        return Err(config_error(format!(
            "[scheduler.retry].multiplier must be a finite number >= 1.0 (got {})",
            r.multiplier
        )));
    }
    let initial_backoff = duration_field("[scheduler.retry].initial_backoff", &r.initial_backoff)?;
    let max_backoff = duration_field("[scheduler.retry].max_backoff", &r.max_backoff)?;
    if max_backoff < initial_backoff {
        return Err(config_error(
            "[scheduler.retry].max_backoff must be >= initial_backoff",
        ));
    }
    Ok(RetryPolicy {
        max_attempts: r.max_attempts,
        initial_backoff,
        max_backoff,
        multiplier: r.multiplier,
    })
}

fn correlation_options(cfg: &RawConfigFile) -> Result<CorrelationOptions> {
    let sweep_interval =
        positive_duration("[correlation].sweep_interval", &cfg.correlation.sweep_interval)?;

    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(cfg.correlation.rules.len());
    for section in &cfg.correlation.rules {
        if !seen.insert(section.name.as_str()) {
            return Err(config_error(format!(
                "duplicate correlation rule name '{}'",
                section.name
            )));
        }
        let rule = CorrelationRule::compile(section).map_err(|e| {
            config_error(format!("correlation rule '{}': {e}", section.name))
        })?;
        rules.push(rule);
    }

    Ok(CorrelationOptions {
        sweep_interval,
        rules,
    })
}
