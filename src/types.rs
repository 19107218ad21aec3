// src/types.rs

//! Small configuration-facing enums shared across modules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which execution substrate hosts workflow processes.
///
/// Only one mode is active at a time; the selector resolves it to a
/// registered backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    Native,
    Container,
    Cluster,
}

impl Default for RuntimeMode {
    fn default() -> Self {
        RuntimeMode::Native
    }
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeMode::Native => "native",
            RuntimeMode::Container => "container",
            RuntimeMode::Cluster => "cluster",
        };
        f.write_str(s)
    }
}

impl FromStr for RuntimeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "native" => Ok(RuntimeMode::Native),
            "container" | "docker" => Ok(RuntimeMode::Container),
            "cluster" | "kubernetes" => Ok(RuntimeMode::Cluster),
            other => Err(format!(
                "invalid runtime mode: {other} (expected \"native\", \"container\" or \"cluster\")"
            )),
        }
    }
}

/// How instances come into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivationType {
    Manual,
    Scheduled,
    EventTriggered,
}

impl Default for ActivationType {
    fn default() -> Self {
        ActivationType::Manual
    }
}

/// When the container backend pulls the runner image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

impl Default for PullPolicy {
    fn default() -> Self {
        PullPolicy::IfNotPresent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_mode_accepts_substrate_aliases() {
        assert_eq!("docker".parse::<RuntimeMode>(), Ok(RuntimeMode::Container));
        assert_eq!(" Kubernetes ".parse::<RuntimeMode>(), Ok(RuntimeMode::Cluster));
        assert!("lambda".parse::<RuntimeMode>().is_err());
    }
}
