// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{FlowhostError, Result};
use crate::workflow::WorkflowDefinition;

/// Load a configuration file from a given path and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path and validate it.
///
/// This is the recommended entry point for the rest of the application:
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` + `Default` impls).
/// - Parses durations, checks the selected runtime has what it needs and
///   compiles correlation rules.
///
/// A relative `definitions` directory is resolved against the config file's
/// directory.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    let raw_config = load_from_path(path)?;
    let mut config = ConfigFile::try_from(raw_config)?;

    if let Some(dir) = config.definitions.take() {
        let resolved = if dir.is_relative() {
            path.parent().map(|p| p.join(&dir)).unwrap_or(dir)
        } else {
            dir
        };
        config.definitions = Some(resolved);
    }

    Ok(config)
}

/// Default config path: `Flowhost.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Flowhost.toml")
}

/// Read every `*.json` file in `dir` as a [`WorkflowDefinition`], sorted by
/// file name.
pub fn load_definitions(dir: impl AsRef<Path>) -> Result<Vec<WorkflowDefinition>> {
    let dir = dir.as_ref();
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut definitions = Vec::with_capacity(paths.len());
    for path in paths {
        let contents = fs::read_to_string(&path)?;
        let definition: WorkflowDefinition = serde_json::from_str(&contents).map_err(|e| {
            FlowhostError::ConfigError(format!(
                "invalid workflow definition {}: {e}",
                path.display()
            ))
        })?;
        if definition.id.is_empty() || definition.version.is_empty() {
            return Err(FlowhostError::ConfigError(format!(
                "workflow definition {} needs a non-empty id and version",
                path.display()
            )));
        }
        debug!(definition = %definition.reference(), path = %path.display(), "loaded definition");
        definitions.push(definition);
    }
    Ok(definitions)
}
