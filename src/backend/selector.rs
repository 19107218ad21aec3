// src/backend/selector.rs

//! Backend selection by runtime mode.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::backend::RuntimeBackend;
use crate::backend::cluster::ClusterBackend;
use crate::backend::container::ContainerBackend;
use crate::backend::native::NativeBackend;
use crate::config::ConfigFile;
use crate::errors::{FlowhostError, Result};
use crate::types::RuntimeMode;

/// Which substrate new attempts run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimePolicy {
    pub mode: RuntimeMode,
}

impl RuntimePolicy {
    pub fn new(mode: RuntimeMode) -> Self {
        Self { mode }
    }

    pub fn from_config(config: &ConfigFile) -> Self {
        Self::new(config.runtime.mode)
    }
}

/// Registered backends, one per mode.
#[derive(Clone, Default)]
pub struct RuntimeSelector {
    backends: HashMap<RuntimeMode, Arc<dyn RuntimeBackend>>,
}

impl std::fmt::Debug for RuntimeSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut modes: Vec<String> = self.backends.keys().map(|m| m.to_string()).collect();
        modes.sort();
        f.debug_struct("RuntimeSelector")
            .field("modes", &modes)
            .finish()
    }
}

impl RuntimeSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` under its own mode, replacing any previous one.
    pub fn register(&mut self, backend: Arc<dyn RuntimeBackend>) {
        self.backends.insert(backend.mode(), backend);
    }

    pub fn with_backend(mut self, backend: Arc<dyn RuntimeBackend>) -> Self {
        self.register(backend);
        self
    }

    /// Backends for every mode the configuration can serve.
    ///
    /// Native is only registered when `[runtime.native]` names an executable;
    /// container and cluster fall back to their section defaults.
    pub fn from_config(config: &ConfigFile) -> Result<Self> {
        let mut selector = Self::new();

        if let Some(native) = &config.runtime.native {
            selector.register(Arc::new(NativeBackend::new(
                native.clone(),
                config.api.clone(),
            )));
        }
        selector.register(Arc::new(ContainerBackend::with_cli(
            config.container_section(),
            config.api.clone(),
        )));
        selector.register(Arc::new(ClusterBackend::with_cli(
            config.cluster_section(),
            config.cluster_poll_interval,
            config.api.clone(),
        )?));

        debug!(?selector, "runtime backends registered");
        Ok(selector)
    }

    pub fn modes(&self) -> Vec<RuntimeMode> {
        self.backends.keys().copied().collect()
    }

    /// Backend for `policy.mode`.
    pub fn select(&self, policy: &RuntimePolicy) -> Result<Arc<dyn RuntimeBackend>> {
        self.backends
            .get(&policy.mode)
            .cloned()
            .ok_or(FlowhostError::UnsupportedMode(policy.mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfigFile;

    #[test]
    fn selects_registered_mode_only() {
        let raw: RawConfigFile = toml::from_str(
            r#"
            [runtime]
            mode = "container"
            "#,
        )
        .unwrap();
        let config = ConfigFile::try_from(raw).unwrap();
        let selector = RuntimeSelector::from_config(&config).unwrap();

        let backend = selector
            .select(&RuntimePolicy::from_config(&config))
            .unwrap();
        assert_eq!(backend.mode(), RuntimeMode::Container);

        let Err(err) = selector.select(&RuntimePolicy::new(RuntimeMode::Native)) else {
            panic!("native backend should not be registered");
        };
        assert!(matches!(
            err,
            FlowhostError::UnsupportedMode(RuntimeMode::Native)
        ));
    }
}
