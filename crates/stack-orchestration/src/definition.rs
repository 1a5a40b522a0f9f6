//! Service definitions consumed by the graph builder.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Group label used when a definition does not name one
pub const DEFAULT_GROUP: &str = "other";

/// Readiness predicate an edge requires of its source before the dependent may proceed
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// The dependency container is running
    #[default]
    #[serde(alias = "service_started")]
    Started,
    /// The dependency container reports a passing health check
    #[serde(alias = "service_healthy")]
    Healthy,
    /// The dependency ran to completion with exit code 0
    #[serde(alias = "service_completed_successfully")]
    CompletedSuccessfully,
}

impl DependencyCondition {
    /// Whether the dependent must wait in a later batch than the source
    pub fn requires_readiness(&self) -> bool {
        !matches!(self, DependencyCondition::Started)
    }
}

impl fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DependencyCondition::Started => "started",
            DependencyCondition::Healthy => "healthy",
            DependencyCondition::CompletedSuccessfully => "completed_successfully",
        };
        f.write_str(name)
    }
}

impl FromStr for DependencyCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" | "service_started" => Ok(DependencyCondition::Started),
            "healthy" | "service_healthy" => Ok(DependencyCondition::Healthy),
            "completed_successfully" | "service_completed_successfully" => {
                Ok(DependencyCondition::CompletedSuccessfully)
            }
            other => Err(format!("unsupported dependency condition '{}'", other)),
        }
    }
}

/// A parsed service definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Unique service name
    pub name: String,
    /// Image reference
    #[serde(default)]
    pub image: String,
    /// Profile tags, empty means available in every profile
    #[serde(default)]
    pub profiles: Vec<String>,
    /// Tier or group label
    #[serde(default = "default_group")]
    pub group: String,
    /// Required services are part of every start selection
    #[serde(default)]
    pub required: bool,
    /// Dependencies keyed by service name
    #[serde(default)]
    pub depends_on: BTreeMap<String, DependencyCondition>,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

impl ServiceDefinition {
    /// Create a definition with no dependencies in the default group
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            profiles: Vec::new(),
            group: default_group(),
            required: false,
            depends_on: BTreeMap::new(),
        }
    }

    /// Set the group label
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Add a profile tag
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profiles.push(profile.into());
        self
    }

    /// Mark the service as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Add a dependency
    pub fn depends_on(mut self, service: impl Into<String>, condition: DependencyCondition) -> Self {
        self.depends_on.insert(service.into(), condition);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_accepts_compose_names() {
        assert_eq!(
            "service_healthy".parse::<DependencyCondition>().unwrap(),
            DependencyCondition::Healthy
        );
        assert_eq!(
            "completed_successfully".parse::<DependencyCondition>().unwrap(),
            DependencyCondition::CompletedSuccessfully
        );
        assert!("service_ready".parse::<DependencyCondition>().is_err());

        let parsed: DependencyCondition =
            serde_json::from_str("\"service_completed_successfully\"").unwrap();
        assert_eq!(parsed, DependencyCondition::CompletedSuccessfully);
    }

    #[test]
    fn definition_defaults() {
        let def: ServiceDefinition = serde_json::from_str(r#"{"name": "redis"}"#).unwrap();
        assert_eq!(def.group, DEFAULT_GROUP);
        assert!(!def.required);
        assert!(def.depends_on.is_empty());
    }
}
