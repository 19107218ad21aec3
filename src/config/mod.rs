// src/config/mod.rs

//! Configuration loading and validation for flowhost.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Parse human duration strings like `"3s"` (`duration.rs`).
//! - Load a config file and workflow definitions from disk (`loader.rs`).
//! - Validate and type-check the raw model into a [`ConfigFile`]
//!   (`validate.rs`).

pub mod duration;
pub mod loader;
pub mod model;
pub mod validate;

pub use duration::parse_duration;
pub use loader::{default_config_path, load_and_validate, load_definitions, load_from_path};
pub use model::{
    ApiSection, ClusterSection, CompletionSection, ConfigFile, ContainerSection,
    CorrelationOptions, CorrelationSection, FilterSection, NativeSection, RawConfigFile,
    RetrySection, RuleSection, RuntimeSection, SchedulerSection,
};
