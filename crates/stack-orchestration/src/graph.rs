//! Service graph construction.
//!
//! [`GraphBuilder`] turns service definitions into nodes and typed edges. An edge
//! points from a dependency (`from`) to the service that depends on it (`to`) and
//! carries the condition required of `from` before `to` may proceed.

use crate::definition::{DependencyCondition, ServiceDefinition};
use crate::resolver::DependencyResolver;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// A service in the graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNode {
    /// Unique name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Profile tags, empty means available in every profile
    pub profiles: BTreeSet<String>,
    /// Tier or group label
    pub group: String,
    /// Always part of a start selection
    pub required: bool,
}

impl ServiceNode {
    /// Whether the node can run under `profile`
    pub fn is_available_for(&self, profile: &str) -> bool {
        self.profiles.is_empty() || self.profiles.contains(profile)
    }

    /// Whether the node carries any profile tag
    pub fn is_profile_tagged(&self) -> bool {
        !self.profiles.is_empty()
    }
}

impl From<&ServiceDefinition> for ServiceNode {
    fn from(def: &ServiceDefinition) -> Self {
        Self {
            name: def.name.clone(),
            image: def.image.clone(),
            profiles: def.profiles.iter().cloned().collect(),
            group: def.group.clone(),
            required: def.required,
        }
    }
}

/// A typed dependency edge
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The dependency
    pub from: String,
    /// The dependent service
    pub to: String,
    /// Condition required of `from`
    pub condition: DependencyCondition,
}

/// Collects definitions into graph parts
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: BTreeMap<String, ServiceNode>,
    edges: Vec<DependencyEdge>,
    duplicates: Vec<String>,
}

impl GraphBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder from a set of definitions
    pub fn from_definitions(definitions: impl IntoIterator<Item = ServiceDefinition>) -> Self {
        let mut builder = Self::new();
        for definition in definitions {
            builder.add_definition(definition);
        }
        builder
    }

    /// Add a definition. A name defined twice fails the build.
    pub fn add_definition(&mut self, definition: ServiceDefinition) -> &mut Self {
        if self.nodes.contains_key(&definition.name) {
            warn!("Service '{}' defined more than once", definition.name);
            self.duplicates.push(definition.name);
            return self;
        }

        for (dependency, condition) in &definition.depends_on {
            self.edges.push(DependencyEdge {
                from: dependency.clone(),
                to: definition.name.clone(),
                condition: *condition,
            });
        }
        self.nodes
            .insert(definition.name.clone(), ServiceNode::from(&definition));
        self
    }

    /// Return the collected nodes and edges, rejecting edges to undefined services
    pub fn into_parts(self) -> Result<(Vec<ServiceNode>, Vec<DependencyEdge>)> {
        if let Some(name) = self.duplicates.into_iter().next() {
            return Err(Error::DuplicateService(name));
        }
        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.from) {
                return Err(Error::UnknownService(edge.from.clone()));
            }
        }
        debug!(
            "Collected {} services and {} dependency edges",
            self.nodes.len(),
            self.edges.len()
        );
        Ok((self.nodes.into_values().collect(), self.edges))
    }

    /// Build and validate the graph
    pub fn build(self) -> Result<DependencyResolver> {
        let (nodes, edges) = self.into_parts()?;
        DependencyResolver::build(nodes, edges)
    }
}

/// Immutable service graph with adjacency indexes
#[derive(Debug, Clone)]
pub struct ServiceGraph {
    nodes: BTreeMap<String, ServiceNode>,
    edges: Vec<DependencyEdge>,
    incoming: BTreeMap<String, Vec<DependencyEdge>>,
    outgoing: BTreeMap<String, Vec<DependencyEdge>>,
}

impl ServiceGraph {
    /// Index nodes and edges. Does not check for cycles.
    pub(crate) fn index(nodes: Vec<ServiceNode>, edges: Vec<DependencyEdge>) -> Result<Self> {
        let nodes: BTreeMap<String, ServiceNode> = nodes
            .into_iter()
            .map(|node| (node.name.clone(), node))
            .collect();

        let mut incoming: BTreeMap<String, Vec<DependencyEdge>> = BTreeMap::new();
        let mut outgoing: BTreeMap<String, Vec<DependencyEdge>> = BTreeMap::new();
        for edge in &edges {
            for endpoint in [&edge.from, &edge.to] {
                if !nodes.contains_key(endpoint) {
                    return Err(Error::UnknownService(endpoint.clone()));
                }
            }
            incoming.entry(edge.to.clone()).or_default().push(edge.clone());
            outgoing
                .entry(edge.from.clone())
                .or_default()
                .push(edge.clone());
        }

        Ok(Self {
            nodes,
            edges,
            incoming,
            outgoing,
        })
    }

    /// Look up a node
    pub fn node(&self, name: &str) -> Option<&ServiceNode> {
        self.nodes.get(name)
    }

    /// Whether a node exists
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// All nodes in name order
    pub fn nodes(&self) -> impl Iterator<Item = &ServiceNode> {
        self.nodes.values()
    }

    /// All edges
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Edges into `name`, i.e. its direct dependencies
    pub fn incoming(&self, name: &str) -> &[DependencyEdge] {
        self.incoming.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Edges out of `name`, i.e. its direct dependents
    pub fn outgoing(&self, name: &str) -> &[DependencyEdge] {
        self.outgoing.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Serializable export of the graph
    pub fn to_view(&self) -> GraphView {
        GraphView {
            nodes: self
                .nodes
                .values()
                .map(|node| NodeView {
                    name: node.name.clone(),
                    group: node.group.clone(),
                    profiles: node.profiles.iter().cloned().collect(),
                })
                .collect(),
            edges: self
                .edges
                .iter()
                .map(|edge| EdgeView {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    condition: edge.condition,
                })
                .collect(),
        }
    }
}

/// Exported graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphView {
    /// Nodes
    pub nodes: Vec<NodeView>,
    /// Edges
    pub edges: Vec<EdgeView>,
}

/// Exported node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    /// Service name
    pub name: String,
    /// Group label
    pub group: String,
    /// Profile tags
    pub profiles: Vec<String>,
}

/// Exported edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeView {
    /// Dependency
    pub from: String,
    /// Dependent
    pub to: String,
    /// Required condition
    pub condition: DependencyCondition,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_creates_edges_from_dependency_to_dependent() {
        let builder = GraphBuilder::from_definitions(vec![
            ServiceDefinition::new("db", "postgres"),
            ServiceDefinition::new("api", "api").depends_on("db", DependencyCondition::Healthy),
        ]);
        let (nodes, edges) = builder.into_parts().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(
            edges,
            vec![DependencyEdge {
                from: "db".to_string(),
                to: "api".to_string(),
                condition: DependencyCondition::Healthy,
            }]
        );
    }

    #[test]
    fn builder_rejects_undefined_dependency() {
        let builder = GraphBuilder::from_definitions(vec![
            ServiceDefinition::new("api", "api").depends_on("db", DependencyCondition::Started),
        ]);
        assert_eq!(
            builder.into_parts().unwrap_err(),
            Error::UnknownService("db".to_string())
        );
    }

    #[test]
    fn duplicate_definition_is_rejected() {
        let mut builder = GraphBuilder::new();
        builder
            .add_definition(ServiceDefinition::new("db", "postgres"))
            .add_definition(
                ServiceDefinition::new("api", "api").depends_on("db", DependencyCondition::Healthy),
            )
            .add_definition(ServiceDefinition::new("api", "api:v2"));
        assert_eq!(
            builder.into_parts().unwrap_err(),
            Error::DuplicateService("api".to_string())
        );
    }

    #[test]
    fn graph_view_exports_nodes_and_edges() {
        let resolver = GraphBuilder::from_definitions(vec![
            ServiceDefinition::new("ollama-cpu", "ollama")
                .in_group("core_ai")
                .with_profile("cpu"),
            ServiceDefinition::new("webui", "open-webui")
                .in_group("ui")
                .depends_on("ollama-cpu", DependencyCondition::Started),
        ])
        .build()
        .unwrap();

        let view = resolver.graph().to_view();
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["nodes"][0]["name"], "ollama-cpu");
        assert_eq!(json["nodes"][0]["profiles"][0], "cpu");
        assert_eq!(json["edges"][0]["from"], "ollama-cpu");
        assert_eq!(json["edges"][0]["to"], "webui");
        assert_eq!(json["edges"][0]["condition"], "started");
    }
}
