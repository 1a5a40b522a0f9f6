//! # Stack Configuration
//!
//! YAML stack definition parser for the stack controller.
//!
//! A stack file lists the services of a compose project together with their
//! groups, profiles and startup dependencies, plus optional controller
//! settings. This crate parses and validates it and converts it into the
//! orchestration types.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub mod parser;

pub use parser::{build_graph, compose_runtime, parse_file, parse_str, substitute_env_vars, to_definitions};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse YAML
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Environment variable not found
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    /// Service reference not found
    #[error("Service '{0}' not found")]
    ServiceNotFound(String),

    /// The services do not form a valid dependency graph
    #[error("Invalid dependency graph: {0}")]
    Graph(#[from] stack_orchestration::Error),

    /// Substitution pattern failed to compile
    #[error("Invalid substitution pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// Optional stack name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Optional description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Global settings
    #[serde(default, skip_serializing_if = "Settings::is_default")]
    pub settings: Settings,

    /// Service definitions
    pub services: BTreeMap<String, Service>,
}

/// Controller settings; unset values fall back to the built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    /// Runtime poll interval in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,

    /// Per-service readiness timeout in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_timeout_secs: Option<u64>,

    /// Runtime calls allowed in flight at once
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,

    /// Attempts per runtime call, including the first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,

    /// Delay before the first retry in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_backoff_ms: Option<u64>,

    /// Upper bound for retry delays in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_max_backoff_ms: Option<u64>,

    /// Events buffered per subscriber
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriber_buffer: Option<usize>,

    /// Metrics sampling interval in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_interval_ms: Option<u64>,

    /// Metrics samples kept per service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_history: Option<usize>,

    /// Container runtime settings
    #[serde(default, skip_serializing_if = "RuntimeSettings::is_default")]
    pub runtime: RuntimeSettings,
}

impl Settings {
    /// Check if settings are default (all None)
    fn is_default(&self) -> bool {
        self == &Settings::default()
    }
}

/// Compose project settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RuntimeSettings {
    /// Compose project name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    /// Directory compose runs from, relative to the stack file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_path: Option<PathBuf>,

    /// Compose files, relative to `base_path`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compose_files: Vec<PathBuf>,
}

impl RuntimeSettings {
    fn is_default(&self) -> bool {
        self == &RuntimeSettings::default()
    }
}

/// Service definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    /// Image reference
    #[serde(default)]
    pub image: String,

    /// Profile tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,

    /// Group label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Part of every start selection
    #[serde(default)]
    pub required: bool,

    /// Startup dependencies
    #[serde(default)]
    pub depends_on: DependsOn,
}

/// Compose-style `depends_on`, either a list or a map with conditions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DependsOn {
    /// `[a, b]`: every dependency must be started
    List(Vec<String>),
    /// `{a: {condition: service_healthy}}`
    Map(BTreeMap<String, DependsOnEntry>),
}

impl Default for DependsOn {
    fn default() -> Self {
        DependsOn::List(Vec::new())
    }
}

/// One entry of the map form
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DependsOnEntry {
    /// Readiness condition, `service_started` when omitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}
