// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::types::RuntimeMode;
use crate::workflow::InstanceStatus;

#[derive(Error, Debug)]
pub enum FlowhostError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Workflow instance already exists: {0}")]
    InstanceExists(String),

    #[error("Invalid status transition for instance '{instance}': {from} -> {to}")]
    InvalidTransition {
        instance: String,
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error("No runtime backend registered for mode '{0}'")]
    UnsupportedMode(RuntimeMode),

    #[error("Controller is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, FlowhostError>;
