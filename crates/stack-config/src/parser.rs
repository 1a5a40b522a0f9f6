//! Stack file parser with environment variable substitution

use crate::{Config, ConfigError, DependsOn, Result, Settings};
use regex::Regex;
use stack_orchestration::{
    ComposeRuntime, ControllerSettings, DependencyCondition, DependencyResolver, GraphBuilder,
    MetricsSettings, RetryPolicy, ServiceDefinition, StreamerSettings, TrackerSettings,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Compose project used when the stack file does not name one
pub const DEFAULT_PROJECT: &str = "localai";

/// Parse a YAML stack file
pub fn parse_file(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    debug!("Reading stack file {}", path.display());
    let content = std::fs::read_to_string(path)?;
    parse_str(&content)
}

/// Parse a YAML stack definition from a string
pub fn parse_str(content: &str) -> Result<Config> {
    let content = substitute_env_vars(content)?;
    let config: Config = serde_yaml::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &Config) -> Result<()> {
    if config.version != "1.0" {
        return Err(ConfigError::ValidationError(format!(
            "Unsupported version: {}, expected 1.0",
            config.version
        )));
    }

    if config.services.is_empty() {
        return Err(ConfigError::ValidationError(
            "Stack defines no services".to_string(),
        ));
    }

    for (name, service) in &config.services {
        for (dependency, condition) in dependencies(&service.depends_on) {
            if !config.services.contains_key(dependency) {
                return Err(ConfigError::ServiceNotFound(format!(
                    "{} (dependency of {})",
                    dependency, name
                )));
            }
            if let Some(condition) = condition {
                condition.parse::<DependencyCondition>().map_err(|e| {
                    ConfigError::ValidationError(format!("Service '{}': {}", name, e))
                })?;
            }
        }
    }

    validate_settings(&config.settings)
}

fn validate_settings(settings: &Settings) -> Result<()> {
    let zero = [
        ("poll_interval_ms", settings.poll_interval_ms.map(|v| v as u128)),
        ("max_parallel", settings.max_parallel.map(|v| v as u128)),
        ("retry_attempts", settings.retry_attempts.map(|v| v as u128)),
        ("subscriber_buffer", settings.subscriber_buffer.map(|v| v as u128)),
        ("metrics_interval_ms", settings.metrics_interval_ms.map(|v| v as u128)),
        ("metrics_history", settings.metrics_history.map(|v| v as u128)),
    ]
    .into_iter()
    .find(|(_, value)| *value == Some(0));

    match zero {
        Some((key, _)) => Err(ConfigError::ValidationError(format!(
            "Setting '{}' must be greater than zero",
            key
        ))),
        None => Ok(()),
    }
}

fn dependencies(depends_on: &DependsOn) -> Vec<(&str, Option<&str>)> {
    match depends_on {
        DependsOn::List(names) => names.iter().map(|n| (n.as_str(), None)).collect(),
        DependsOn::Map(entries) => entries
            .iter()
            .map(|(n, entry)| (n.as_str(), entry.condition.as_deref()))
            .collect(),
    }
}

/// Substitute `${VAR}` and `${VAR:-default}` references
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}")?;
    let mut missing = Vec::new();

    let output = re.replace_all(input, |caps: &regex::Captures<'_>| {
        let expr = &caps[1];
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };
        match (std::env::var(name), default) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::EnvVarNotFound(missing.join(", ")));
    }
    Ok(output.into_owned())
}

/// Convert the stack's services into graph definitions
pub fn to_definitions(config: &Config) -> Result<Vec<ServiceDefinition>> {
    config
        .services
        .iter()
        .map(|(name, service)| {
            let mut definition = ServiceDefinition::new(name.clone(), service.image.clone());
            if let Some(group) = &service.group {
                definition = definition.in_group(group.clone());
            }
            for profile in &service.profiles {
                definition = definition.with_profile(profile.clone());
            }
            if service.required {
                definition = definition.required();
            }
            for (dependency, condition) in dependencies(&service.depends_on) {
                let condition = match condition {
                    Some(raw) => raw.parse().map_err(|e| {
                        ConfigError::ValidationError(format!("Service '{}': {}", name, e))
                    })?,
                    None => DependencyCondition::default(),
                };
                definition = definition.depends_on(dependency, condition);
            }
            Ok(definition)
        })
        .collect()
}

/// Build and validate the dependency graph of a stack
pub fn build_graph(config: &Config) -> Result<DependencyResolver> {
    let resolver = GraphBuilder::from_definitions(to_definitions(config)?).build()?;
    Ok(resolver)
}

/// Compose runtime for a stack, resolving paths against `config_dir`
pub fn compose_runtime(config: &Config, config_dir: &Path) -> ComposeRuntime {
    let runtime = &config.settings.runtime;
    let project = runtime.project.as_deref().unwrap_or(DEFAULT_PROJECT);
    let base = match &runtime.base_path {
        Some(path) => config_dir.join(path),
        None => config_dir.to_path_buf(),
    };

    runtime
        .compose_files
        .iter()
        .fold(ComposeRuntime::new(project), |compose, file| {
            compose.with_compose_file(base.join(file))
        })
        .with_working_dir(base)
}

impl Settings {
    /// Controller settings, defaults filled in
    pub fn controller(&self) -> ControllerSettings {
        let defaults = ControllerSettings::default();
        let retry = RetryPolicy {
            max_attempts: self.retry_attempts.unwrap_or(defaults.retry.max_attempts),
            initial_backoff: self
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.initial_backoff),
            max_backoff: self
                .retry_max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_backoff),
        };
        ControllerSettings {
            max_parallel: self.max_parallel.unwrap_or(defaults.max_parallel),
            health_timeout: self
                .health_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.health_timeout),
            retry,
        }
    }

    /// Tracker settings, defaults filled in
    pub fn tracker(&self) -> TrackerSettings {
        self.poll_interval_ms
            .map(|ms| TrackerSettings {
                poll_interval: Duration::from_millis(ms),
            })
            .unwrap_or_default()
    }

    /// Streamer settings, defaults filled in
    pub fn streamer(&self) -> StreamerSettings {
        self.subscriber_buffer
            .map(|buffer_capacity| StreamerSettings { buffer_capacity })
            .unwrap_or_default()
    }

    /// Metrics collector settings, defaults filled in
    pub fn metrics(&self) -> MetricsSettings {
        let defaults = MetricsSettings::default();
        MetricsSettings {
            interval: self
                .metrics_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.interval),
            history: self.metrics_history.unwrap_or(defaults.history),
            thresholds: defaults.thresholds,
        }
    }
}

/// Group membership as declared in the file, for diagnostics
pub fn declared_groups(config: &Config) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, service) in &config.services {
        let group = service
            .group
            .clone()
            .unwrap_or_else(|| stack_orchestration::DEFAULT_GROUP.to_string());
        groups.entry(group).or_default().push(name.clone());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use stack_orchestration::{Error as GraphError, ErrorKind};

    const STACK: &str = r#"
version: "1.0"
name: localai
settings:
  max_parallel: 2
  health_timeout_secs: 30
  metrics_history: 10
services:
  postgres:
    image: postgres:16
    group: storage
    required: true
  redis:
    image: redis:7
    group: storage
  api:
    image: localai/api:latest
    group: core
    depends_on:
      postgres:
        condition: service_healthy
      redis: {}
  worker:
    image: localai/worker:latest
    group: core
    depends_on: [api]
  ollama:
    image: ollama/ollama
    group: llm
    profiles: [cpu]
"#;

    #[test]
    fn test_parse_stack() {
        let config = parse_str(STACK).unwrap();
        assert_eq!(config.name.as_deref(), Some("localai"));
        assert_eq!(config.services.len(), 5);
        assert!(config.services["postgres"].required);
        assert_eq!(config.services["ollama"].profiles, vec!["cpu"]);
    }

    #[test]
    fn test_depends_on_forms() {
        let config = parse_str(STACK).unwrap();
        let definitions = to_definitions(&config).unwrap();
        let api = definitions.iter().find(|d| d.name == "api").unwrap();
        assert_eq!(api.depends_on["postgres"], DependencyCondition::Healthy);
        assert_eq!(api.depends_on["redis"], DependencyCondition::Started);

        let worker = definitions.iter().find(|d| d.name == "worker").unwrap();
        assert_eq!(worker.depends_on["api"], DependencyCondition::Started);
        assert_eq!(worker.group, "core");
    }

    #[test]
    fn test_build_graph() {
        let config = parse_str(STACK).unwrap();
        let resolver = build_graph(&config).unwrap();
        let targets = ["worker".to_string()].into_iter().collect();
        let batches = resolver.start_order(&targets).unwrap();
        assert_eq!(
            batches,
            vec![
                vec!["postgres".to_string(), "redis".to_string()],
                vec!["api".to_string()],
                vec!["worker".to_string()],
            ]
        );
    }

    #[test]
    fn test_unsupported_version() {
        let yaml = "version: \"2.0\"\nservices:\n  a:\n    image: a\n";
        let err = parse_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_unknown_dependency() {
        let yaml = r#"
version: "1.0"
services:
  api:
    image: api
    depends_on: [db]
"#;
        let err = parse_str(yaml).unwrap_err();
        match err {
            ConfigError::ServiceNotFound(msg) => assert!(msg.contains("db")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_unknown_condition() {
        let yaml = r#"
version: "1.0"
services:
  db:
    image: db
  api:
    image: api
    depends_on:
      db:
        condition: service_warm
"#;
        let err = parse_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_zero_setting_rejected() {
        let yaml = r#"
version: "1.0"
settings:
  max_parallel: 0
services:
  a:
    image: a
"#;
        let err = parse_str(yaml).unwrap_err();
        match err {
            ConfigError::ValidationError(msg) => assert!(msg.contains("max_parallel")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_cycle_reported_from_graph() {
        let yaml = r#"
version: "1.0"
services:
  a:
    image: a
    depends_on: [b]
  b:
    image: b
    depends_on: [a]
"#;
        let config = parse_str(yaml).unwrap();
        match build_graph(&config).unwrap_err() {
            ConfigError::Graph(err @ GraphError::CycleDetected { .. }) => {
                assert_eq!(err.kind(), ErrorKind::CycleDetected);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_env_var_substitution() {
        unsafe {
            std::env::set_var("STACK_CONFIG_TEST_TAG", "1.2.3");
        }
        let result = substitute_env_vars("image: api:${STACK_CONFIG_TEST_TAG}").unwrap();
        assert_eq!(result, "image: api:1.2.3");
    }

    #[test]
    fn test_env_var_with_default() {
        let result =
            substitute_env_vars("image: ${STACK_CONFIG_TEST_UNSET_IMAGE:-redis:7}").unwrap();
        assert_eq!(result, "image: redis:7");
    }

    #[test]
    fn test_missing_env_var() {
        let err = substitute_env_vars("image: ${STACK_CONFIG_TEST_MISSING}").unwrap_err();
        match err {
            ConfigError::EnvVarNotFound(name) => assert_eq!(name, "STACK_CONFIG_TEST_MISSING"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        let controller = settings.controller();
        assert_eq!(controller.max_parallel, 4);
        assert_eq!(controller.health_timeout, Duration::from_secs(120));
        assert_eq!(controller.retry.max_attempts, 3);
        assert_eq!(settings.tracker().poll_interval, Duration::from_secs(2));
        assert_eq!(settings.streamer().buffer_capacity, 1000);
        assert_eq!(settings.metrics().interval, Duration::from_secs(5));
        assert_eq!(settings.metrics().history, 120);
    }

    #[test]
    fn test_settings_overrides() {
        let config = parse_str(STACK).unwrap();
        let controller = config.settings.controller();
        assert_eq!(controller.max_parallel, 2);
        assert_eq!(controller.health_timeout, Duration::from_secs(30));
        let metrics = config.settings.metrics();
        assert_eq!(metrics.history, 10);
        assert_eq!(metrics.interval, Duration::from_secs(5));
    }

    #[test]
    fn test_declared_groups() {
        let config = parse_str(STACK).unwrap();
        let groups = declared_groups(&config);
        assert_eq!(groups["storage"], vec!["postgres", "redis"]);
        assert_eq!(groups["llm"], vec!["ollama"]);
    }
}
