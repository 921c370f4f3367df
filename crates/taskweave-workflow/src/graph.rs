use std::collections::{BTreeSet, HashMap, VecDeque};

use taskweave_core::error::{Result, WeaveError};
use taskweave_core::types::{NodeStatus, WorkflowDefinition};

use crate::context::ExecutionContext;
use crate::reference;
use crate::step::StepRegistry;

/// Dependency graph derived from reference expressions.
///
/// Built and validated before execution starts: duplicate ids, unknown
/// references, and cycles are all configuration errors.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// node id → ids it depends on.
    deps: HashMap<String, BTreeSet<String>>,
    /// node id → ids depending on it.
    dependents: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn build(definition: &WorkflowDefinition) -> Result<Self> {
        let mut deps: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut dependents: HashMap<String, BTreeSet<String>> = HashMap::new();

        for node in &definition.nodes {
            if deps.contains_key(&node.id) {
                return Err(WeaveError::Configuration(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
            deps.insert(node.id.clone(), BTreeSet::new());
            dependents.entry(node.id.clone()).or_default();
        }

        for node in &definition.nodes {
            let mut referenced = BTreeSet::new();
            for value in node.params.values() {
                referenced.extend(reference::references(value));
            }
            for dep in referenced {
                if !deps.contains_key(&dep) {
                    return Err(WeaveError::Configuration(format!(
                        "node '{}' references unknown node '{}'",
                        node.id, dep
                    )));
                }
                if dep == node.id {
                    return Err(WeaveError::Configuration(format!(
                        "node '{}' references itself",
                        node.id
                    )));
                }
                dependents.entry(dep.clone()).or_default().insert(node.id.clone());
                deps.entry(node.id.clone()).or_default().insert(dep);
            }
        }

        let graph = Self { deps, dependents };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Validate that every node's kind has a registered implementation.
    pub fn check_kinds(definition: &WorkflowDefinition, registry: &StepRegistry) -> Result<()> {
        for node in &definition.nodes {
            if !registry.contains(&node.kind) {
                return Err(WeaveError::Configuration(format!(
                    "node '{}' uses unknown step kind '{}'",
                    node.id, node.kind
                )));
            }
        }
        Ok(())
    }

    /// Kahn's algorithm; leftovers are cycle members.
    fn check_acyclic(&self) -> Result<()> {
        let mut in_degree: HashMap<&str, usize> = self
            .deps
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.len()))
            .collect();

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            if let Some(dependents) = self.dependents.get(id) {
                for dependent in dependents {
                    if let Some(d) = in_degree.get_mut(dependent.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        if visited < self.deps.len() {
            let mut cycle: Vec<&str> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| *id)
                .collect();
            cycle.sort_unstable();
            return Err(WeaveError::Configuration(format!(
                "reference cycle involving nodes: {}",
                cycle.join(", ")
            )));
        }
        Ok(())
    }

    pub fn dependencies(&self, node_id: &str) -> Option<&BTreeSet<String>> {
        self.deps.get(node_id)
    }

    /// Nodes eligible to run: `Pending` with every dependency `Success`.
    pub fn ready(&self, ctx: &ExecutionContext) -> Vec<String> {
        let mut ready: Vec<String> = self
            .deps
            .iter()
            .filter(|(id, deps)| {
                ctx.status(id) == Some(NodeStatus::Pending)
                    && deps.iter().all(|d| ctx.is_success(d))
            })
            .map(|(id, _)| id.clone())
            .collect();
        ready.sort_unstable();
        ready
    }

    /// Transitive dependents of a node, for skip propagation.
    pub fn transitive_dependents(&self, node_id: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<&str> = vec![node_id];
        while let Some(id) = stack.pop() {
            if let Some(dependents) = self.dependents.get(id) {
                for dependent in dependents {
                    if out.insert(dependent.clone()) {
                        stack.push(dependent);
                    }
                }
            }
        }
        out
    }

    /// Topological levels: every node in level N only depends on nodes
    /// in earlier levels. Used by the CLI plan output.
    pub fn topo_levels(&self) -> Vec<Vec<String>> {
        let mut placed: BTreeSet<String> = BTreeSet::new();
        let mut levels = Vec::new();

        while placed.len() < self.deps.len() {
            let mut level: Vec<String> = self
                .deps
                .iter()
                .filter(|(id, deps)| {
                    !placed.contains(id.as_str()) && deps.iter().all(|d| placed.contains(d))
                })
                .map(|(id, _)| id.clone())
                .collect();
            if level.is_empty() {
                // Unreachable for a validated graph.
                break;
            }
            level.sort_unstable();
            placed.extend(level.iter().cloned());
            levels.push(level);
        }
        levels
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }
}
