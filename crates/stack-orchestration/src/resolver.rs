//! Dependency resolution over a validated service graph.
//!
//! The resolver owns the graph after a successful build and answers every
//! ordering question the controller asks: batch plans for start and stop,
//! dependency and dependent sets, closures and profile filtering.

use crate::definition::DependencyCondition;
use crate::graph::{DependencyEdge, ServiceGraph, ServiceNode};
use crate::operation::OperationTarget;
use crate::state::{ServiceRuntimeState, ServiceStatus};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, error};

/// Attribution used in selection reports for services pulled in by `required`
const REQUIRED_MARKER: &str = "(required)";

/// Validated, acyclic service graph with ordering queries
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    graph: ServiceGraph,
}

/// Direction in which batch levels are computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Dependencies first
    Forward,
    /// Dependents first
    Reverse,
}

impl DependencyResolver {
    /// Build the graph, rejecting unknown references and cycles
    pub fn build(nodes: Vec<ServiceNode>, edges: Vec<DependencyEdge>) -> Result<Self> {
        let graph = ServiceGraph::index(nodes, edges)?;
        if let Some(cycle) = find_cycle(&graph) {
            error!("Dependency cycle detected: {}", cycle.join(" -> "));
            return Err(Error::CycleDetected { cycle });
        }
        Ok(Self { graph })
    }

    /// The underlying graph
    pub fn graph(&self) -> &ServiceGraph {
        &self.graph
    }

    /// Look up a node or fail with `UnknownService`
    pub fn node(&self, name: &str) -> Result<&ServiceNode> {
        self.graph
            .node(name)
            .ok_or_else(|| Error::UnknownService(name.to_string()))
    }

    /// Direct dependencies of `name`
    pub fn dependencies(&self, name: &str) -> Result<BTreeSet<String>> {
        self.node(name)?;
        Ok(self
            .graph
            .incoming(name)
            .iter()
            .map(|edge| edge.from.clone())
            .collect())
    }

    /// Direct dependencies of `name` together with the condition each one must meet
    pub fn dependency_conditions(&self, name: &str) -> Vec<(String, DependencyCondition)> {
        self.graph
            .incoming(name)
            .iter()
            .map(|edge| (edge.from.clone(), edge.condition))
            .collect()
    }

    /// Direct dependents of `name`
    pub fn dependents(&self, name: &str) -> Result<BTreeSet<String>> {
        self.node(name)?;
        Ok(self
            .graph
            .outgoing(name)
            .iter()
            .map(|edge| edge.to.clone())
            .collect())
    }

    /// All services `name` depends on, directly or not
    pub fn transitive_dependencies(&self, name: &str) -> Result<BTreeSet<String>> {
        self.node(name)?;
        Ok(self.walk(name, Direction::Reverse))
    }

    /// All services depending on `name`, directly or not
    pub fn transitive_dependents(&self, name: &str) -> Result<BTreeSet<String>> {
        self.node(name)?;
        Ok(self.walk(name, Direction::Forward))
    }

    fn walk(&self, start: &str, direction: Direction) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![start.to_string()];
        while let Some(current) = stack.pop() {
            let edges = match direction {
                Direction::Forward => self.graph.outgoing(&current),
                Direction::Reverse => self.graph.incoming(&current),
            };
            for edge in edges {
                let next = match direction {
                    Direction::Forward => &edge.to,
                    Direction::Reverse => &edge.from,
                };
                if seen.insert(next.clone()) {
                    stack.push(next.clone());
                }
            }
        }
        seen
    }

    /// Targets plus their transitive dependencies plus every required node
    /// (and the dependencies of those)
    pub fn closure(&self, targets: &BTreeSet<String>) -> Result<BTreeSet<String>> {
        let required = self
            .graph
            .nodes()
            .filter(|node| node.required)
            .map(|node| node.name.clone());

        let mut closure = BTreeSet::new();
        for name in targets.iter().cloned().chain(required) {
            closure.extend(self.transitive_dependencies(&name)?);
            closure.insert(name);
        }
        Ok(closure)
    }

    /// Batches for starting `targets`, dependencies first
    pub fn start_order(&self, targets: &BTreeSet<String>) -> Result<Vec<Vec<String>>> {
        let closure = self.closure(targets)?;
        Ok(self.start_batches(&closure))
    }

    /// Batches for stopping `targets` and everything that depends on them, dependents first
    pub fn stop_order(&self, targets: &BTreeSet<String>) -> Result<Vec<Vec<String>>> {
        let mut closure = BTreeSet::new();
        for name in targets {
            closure.extend(self.transitive_dependents(name)?);
            closure.insert(name.clone());
        }
        Ok(self.stop_batches(&closure))
    }

    /// Start levels over an already computed member set
    pub fn start_batches(&self, members: &BTreeSet<String>) -> Vec<Vec<String>> {
        self.levels(members, Direction::Forward)
    }

    /// Stop levels over an already computed member set
    pub fn stop_batches(&self, members: &BTreeSet<String>) -> Vec<Vec<String>> {
        self.levels(members, Direction::Reverse)
    }

    /// Kahn's algorithm restricted to `members`. Each level is sorted by name.
    ///
    /// Ordering follows reachability through the whole graph, so a member
    /// still waits for another member when the path between them runs
    /// through services outside the set.
    fn levels(&self, members: &BTreeSet<String>, direction: Direction) -> Vec<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> =
            members.iter().map(|name| (name.as_str(), 0)).collect();
        let mut successors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for name in members {
            for reached in self.walk(name, Direction::Forward) {
                let Some(reached) = members.get(&reached) else {
                    continue;
                };
                let (before, after) = match direction {
                    Direction::Forward => (name.as_str(), reached.as_str()),
                    Direction::Reverse => (reached.as_str(), name.as_str()),
                };
                successors.entry(before).or_default().push(after);
                *in_degree.entry(after).or_default() += 1;
            }
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut batches = Vec::new();

        while !ready.is_empty() {
            ready.sort_unstable();
            let mut next = Vec::new();
            for name in &ready {
                for after in successors.get(name).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(after) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(*after);
                        }
                    }
                }
            }
            batches.push(ready.iter().map(|name| name.to_string()).collect());
            ready = next;
        }

        debug!("Resolved {} services into {} batches", members.len(), batches.len());
        batches
    }

    /// Services whose profile tags are empty or include `profile`
    pub fn closure_for_profile(&self, profile: &str) -> BTreeSet<String> {
        self.graph
            .nodes()
            .filter(|node| node.is_available_for(profile))
            .map(|node| node.name.clone())
            .collect()
    }

    /// Services named by an operation target
    pub fn resolve_target(&self, target: &OperationTarget) -> Result<BTreeSet<String>> {
        match target {
            OperationTarget::Service(name) => {
                self.node(name)?;
                Ok(BTreeSet::from([name.clone()]))
            }
            OperationTarget::Group(group) => {
                let members: BTreeSet<String> = self
                    .graph
                    .nodes()
                    .filter(|node| &node.group == group)
                    .map(|node| node.name.clone())
                    .collect();
                if members.is_empty() {
                    return Err(Error::UnknownService(group.clone()));
                }
                Ok(members)
            }
        }
    }

    /// Members of every group, keyed by group label
    pub fn groups(&self) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in self.graph.nodes() {
            groups
                .entry(node.group.clone())
                .or_default()
                .push(node.name.clone());
        }
        groups
    }

    /// Group membership with running counts taken from `states`
    pub fn group_summaries(
        &self,
        states: &BTreeMap<String, ServiceRuntimeState>,
    ) -> Vec<GroupSummary> {
        self.groups()
            .into_iter()
            .map(|(name, services)| {
                let running = services
                    .iter()
                    .filter(|service| {
                        states
                            .get(service.as_str())
                            .is_some_and(|state| state.status == ServiceStatus::Running)
                    })
                    .count();
                GroupSummary {
                    name,
                    total: services.len(),
                    running,
                    services,
                }
            })
            .collect()
    }

    /// Explain what a selection pulls in
    pub fn selection_report(
        &self,
        selected: &BTreeSet<String>,
        profile: Option<&str>,
    ) -> Result<SelectionReport> {
        let mut auto_enabled: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut warnings = Vec::new();

        for name in selected {
            let node = self.node(name)?;
            if let Some(profile) = profile {
                if !node.is_available_for(profile) {
                    warnings.push(format!(
                        "Service '{}' is not available for profile '{}'",
                        name, profile
                    ));
                }
            }
            for dependency in self.transitive_dependencies(name)? {
                if !selected.contains(&dependency) {
                    auto_enabled.entry(dependency).or_default().insert(name.clone());
                }
            }
        }

        for node in self.graph.nodes().filter(|node| node.required) {
            if selected.contains(&node.name) {
                continue;
            }
            auto_enabled
                .entry(node.name.clone())
                .or_default()
                .insert(REQUIRED_MARKER.to_string());
            for dependency in self.transitive_dependencies(&node.name)? {
                if !selected.contains(&dependency) {
                    auto_enabled
                        .entry(dependency)
                        .or_default()
                        .insert(node.name.clone());
                }
            }
        }

        let total = selected.len() + auto_enabled.len();
        Ok(SelectionReport {
            selected: selected.iter().cloned().collect(),
            auto_enabled: auto_enabled
                .into_iter()
                .map(|(name, by)| (name, by.into_iter().collect()))
                .collect(),
            warnings,
            total,
        })
    }

    /// Static view of one service; `state` is filled in by the caller
    pub fn service_detail(&self, name: &str) -> Result<ServiceDetail> {
        let node = self.node(name)?;
        Ok(ServiceDetail {
            name: node.name.clone(),
            image: node.image.clone(),
            group: node.group.clone(),
            profiles: node.profiles.iter().cloned().collect(),
            required: node.required,
            dependencies: self.dependency_conditions(name).into_iter().collect(),
            dependents: self.dependents(name)?.into_iter().collect(),
            all_dependencies: self.transitive_dependencies(name)?.into_iter().collect(),
            all_dependents: self.transitive_dependents(name)?.into_iter().collect(),
            state: None,
        })
    }
}

/// DFS coloring. Returns the first cycle found as a closed path.
fn find_cycle(graph: &ServiceGraph) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();
    for node in graph.nodes() {
        if marks.contains_key(node.name.as_str()) {
            continue;
        }
        if let Some(cycle) = visit(graph, &node.name, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

fn visit<'g>(
    graph: &'g ServiceGraph,
    name: &'g str,
    marks: &mut HashMap<&'g str, Mark>,
    path: &mut Vec<&'g str>,
) -> Option<Vec<String>> {
    marks.insert(name, Mark::Visiting);
    path.push(name);

    for edge in graph.outgoing(name) {
        let next = edge.to.as_str();
        match marks.get(next) {
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == next).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(next.to_string());
                return Some(cycle);
            }
            Some(Mark::Done) => {}
            None => {
                if let Some(cycle) = visit(graph, next, marks, path) {
                    return Some(cycle);
                }
            }
        }
    }

    path.pop();
    marks.insert(name, Mark::Done);
    None
}

/// Group membership and running count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    /// Group label
    pub name: String,
    /// Member services
    pub services: Vec<String>,
    /// Members currently running
    pub running: usize,
    /// Number of members
    pub total: usize,
}

/// What a selection pulls in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionReport {
    /// Services the caller selected
    pub selected: Vec<String>,
    /// Services added by the closure, with the services that required them
    pub auto_enabled: BTreeMap<String, Vec<String>>,
    /// Profile warnings
    pub warnings: Vec<String>,
    /// Size of the full selection
    pub total: usize,
}

/// Static and live information about one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDetail {
    /// Service name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Group label
    pub group: String,
    /// Profile tags
    pub profiles: Vec<String>,
    /// Required flag
    pub required: bool,
    /// Direct dependencies and their conditions
    pub dependencies: BTreeMap<String, DependencyCondition>,
    /// Direct dependents
    pub dependents: Vec<String>,
    /// Transitive dependencies
    pub all_dependencies: Vec<String>,
    /// Transitive dependents
    pub all_dependents: Vec<String>,
    /// Last observed runtime state
    pub state: Option<ServiceRuntimeState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ServiceDefinition;
    use crate::graph::GraphBuilder;
    use DependencyCondition::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn abc() -> DependencyResolver {
        GraphBuilder::from_definitions(vec![
            ServiceDefinition::new("a", "a"),
            ServiceDefinition::new("b", "b").depends_on("a", Healthy),
            ServiceDefinition::new("c", "c").depends_on("b", Started),
        ])
        .build()
        .unwrap()
    }

    #[test]
    fn start_order_follows_conditions() {
        let resolver = abc();
        assert_eq!(
            resolver.start_order(&set(&["c"])).unwrap(),
            vec![vec!["a"], vec!["b"], vec!["c"]]
        );
    }

    #[test]
    fn stop_order_reverses_edges() {
        let resolver = abc();
        assert_eq!(
            resolver.stop_order(&set(&["a"])).unwrap(),
            vec![vec!["c"], vec!["b"], vec!["a"]]
        );
        assert_eq!(resolver.stop_order(&set(&["c"])).unwrap(), vec![vec!["c"]]);
    }

    #[test]
    fn ordering_holds_through_services_outside_the_set() {
        let resolver = abc();
        assert_eq!(
            resolver.stop_batches(&set(&["a", "c"])),
            vec![vec!["c"], vec!["a"]]
        );
        assert_eq!(
            resolver.start_batches(&set(&["a", "c"])),
            vec![vec!["a"], vec!["c"]]
        );
    }

    #[test]
    fn independent_services_share_a_sorted_batch() {
        let resolver = GraphBuilder::from_definitions(vec![
            ServiceDefinition::new("zeta", "z"),
            ServiceDefinition::new("alpha", "a"),
            ServiceDefinition::new("app", "app")
                .depends_on("zeta", Started)
                .depends_on("alpha", Started),
        ])
        .build()
        .unwrap();
        assert_eq!(
            resolver.start_order(&set(&["app"])).unwrap(),
            vec![vec!["alpha", "zeta"], vec!["app"]]
        );
    }

    #[test]
    fn required_services_join_every_start_closure() {
        let resolver = GraphBuilder::from_definitions(vec![
            ServiceDefinition::new("vector", "vector"),
            ServiceDefinition::new("db", "postgres")
                .required()
                .depends_on("vector", Healthy),
            ServiceDefinition::new("n8n", "n8n"),
        ])
        .build()
        .unwrap();
        assert_eq!(
            resolver.closure(&set(&["n8n"])).unwrap(),
            set(&["db", "n8n", "vector"])
        );
        // stop never pulls required services in
        assert_eq!(resolver.stop_order(&set(&["n8n"])).unwrap(), vec![vec!["n8n"]]);
    }

    #[test]
    fn cycle_is_rejected_with_path() {
        let err = GraphBuilder::from_definitions(vec![
            ServiceDefinition::new("a", "a").depends_on("c", Started),
            ServiceDefinition::new("b", "b").depends_on("a", Started),
            ServiceDefinition::new("c", "c").depends_on("b", Healthy),
            ServiceDefinition::new("d", "d"),
        ])
        .build()
        .unwrap_err();

        match err {
            Error::CycleDetected { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                let members: BTreeSet<String> = cycle.iter().cloned().collect();
                assert_eq!(members, set(&["a", "b", "c"]));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = GraphBuilder::from_definitions(vec![
            ServiceDefinition::new("a", "a").depends_on("a", Started),
        ])
        .build()
        .unwrap_err();
        assert_eq!(
            err,
            Error::CycleDetected {
                cycle: vec!["a".into(), "a".into()]
            }
        );
    }

    #[test]
    fn dependents_and_dependencies() {
        let resolver = abc();
        assert_eq!(resolver.dependents("a").unwrap(), set(&["b"]));
        assert_eq!(resolver.transitive_dependents("a").unwrap(), set(&["b", "c"]));
        assert_eq!(resolver.dependencies("c").unwrap(), set(&["b"]));
        assert_eq!(resolver.transitive_dependencies("c").unwrap(), set(&["a", "b"]));
        assert_eq!(
            resolver.dependents("missing").unwrap_err(),
            Error::UnknownService("missing".into())
        );
    }

    #[test]
    fn profile_closure_keeps_untagged_and_matching() {
        let resolver = GraphBuilder::from_definitions(vec![
            ServiceDefinition::new("ollama-cpu", "ollama").with_profile("cpu"),
            ServiceDefinition::new("ollama-gpu", "ollama").with_profile("gpu-nvidia"),
            ServiceDefinition::new("webui", "webui"),
        ])
        .build()
        .unwrap();
        assert_eq!(resolver.closure_for_profile("cpu"), set(&["ollama-cpu", "webui"]));
        assert_eq!(
            resolver.closure_for_profile("gpu-nvidia"),
            set(&["ollama-gpu", "webui"])
        );
    }

    #[test]
    fn group_targets_resolve_to_members() {
        let resolver = GraphBuilder::from_definitions(vec![
            ServiceDefinition::new("a", "a").in_group("core"),
            ServiceDefinition::new("b", "b").in_group("core"),
            ServiceDefinition::new("c", "c").in_group("ui"),
        ])
        .build()
        .unwrap();
        assert_eq!(
            resolver
                .resolve_target(&OperationTarget::Group("core".into()))
                .unwrap(),
            set(&["a", "b"])
        );
        assert_eq!(
            resolver
                .resolve_target(&OperationTarget::Group("nope".into()))
                .unwrap_err(),
            Error::UnknownService("nope".into())
        );
    }

    #[test]
    fn selection_report_attributes_auto_enabled_services() {
        let resolver = GraphBuilder::from_definitions(vec![
            ServiceDefinition::new("db", "postgres").required(),
            ServiceDefinition::new("ollama", "ollama").with_profile("cpu"),
            ServiceDefinition::new("webui", "webui").depends_on("ollama", Started),
        ])
        .build()
        .unwrap();

        let report = resolver
            .selection_report(&set(&["webui"]), Some("gpu-nvidia"))
            .unwrap();
        assert_eq!(report.auto_enabled["ollama"], vec!["webui"]);
        assert_eq!(report.auto_enabled["db"], vec![REQUIRED_MARKER]);
        assert_eq!(report.total, 3);
        assert!(report.warnings.is_empty());

        let report = resolver
            .selection_report(&set(&["ollama"]), Some("gpu-nvidia"))
            .unwrap();
        assert_eq!(report.warnings.len(), 1);
    }

    /// Deterministic acyclic graphs: edges only go from lower to higher index.
    #[test]
    fn every_edge_crosses_batches_forward() {
        for seed in 1..12usize {
            let count = 4 + seed % 7;
            let mut definitions = Vec::new();
            for i in 0..count {
                let mut def = ServiceDefinition::new(format!("s{:02}", i), "img");
                for j in 0..i {
                    if (i * 7 + j * 3 + seed) % 4 == 0 {
                        let condition = match (i + j) % 3 {
                            0 => Started,
                            1 => Healthy,
                            _ => CompletedSuccessfully,
                        };
                        def = def.depends_on(format!("s{:02}", j), condition);
                    }
                }
                definitions.push(def);
            }
            let resolver = GraphBuilder::from_definitions(definitions).build().unwrap();
            let all: BTreeSet<String> = resolver.graph().nodes().map(|n| n.name.clone()).collect();
            let batches = resolver.start_order(&all).unwrap();

            let index: HashMap<&str, usize> = batches
                .iter()
                .enumerate()
                .flat_map(|(i, batch)| batch.iter().map(move |name| (name.as_str(), i)))
                .collect();
            assert_eq!(index.len(), all.len());
            for edge in resolver.graph().edges() {
                assert!(index[edge.from.as_str()] <= index[edge.to.as_str()]);
                if edge.condition.requires_readiness() {
                    assert!(index[edge.from.as_str()] < index[edge.to.as_str()]);
                }
            }
        }
    }
}
