use std::collections::{BTreeSet, HashMap};

use chorus_core::{AgentSpec, Error, Result};
use petgraph::graph::DiGraph;
use petgraph::visit::EdgeRef as _;
use petgraph::{Direction, algo};

/// Immutable agent dependency graph; an edge `a -> b` means `b` reads `a`'s outcome.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<u32, ()>,
}

impl DependencyGraph {
    /// Builds the graph from a roster. Dependencies on agents outside the
    /// roster are ignored.
    #[must_use]
    pub fn from_specs(specs: &[AgentSpec]) -> Self {
        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();

        for spec in specs {
            let node = graph.add_node(spec.agent_number);
            node_map.insert(spec.agent_number, node);
        }

        for spec in specs {
            let agent_node = node_map[&spec.agent_number];
            for dependency in spec.dependencies() {
                if let Some(&dependency_node) = node_map.get(&dependency) {
                    graph.add_edge(dependency_node, agent_node, ());
                }
            }
        }

        Self { graph }
    }

    /// Agents not yet completed whose dependencies all are, ascending.
    #[must_use]
    pub fn ready(&self, completed: &BTreeSet<u32>) -> Vec<u32> {
        let mut ready: Vec<u32> = self
            .graph
            .node_indices()
            .filter_map(|node| {
                let agent = self.graph[node];
                if completed.contains(&agent) {
                    return None;
                }

                let dependencies_done = self
                    .graph
                    .edges_directed(node, Direction::Incoming)
                    .all(|edge| completed.contains(&self.graph[edge.source()]));

                dependencies_done.then_some(agent)
            })
            .collect();
        ready.sort_unstable();
        ready
    }

    /// Detect cycles (invalid graph)
    #[must_use]
    pub fn has_cycles(&self) -> bool {
        algo::is_cyclic_directed(&self.graph)
    }

    /// Number of agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Groups agents into levels: each level holds the agents whose
    /// dependencies are all in earlier levels.
    ///
    /// # Errors
    /// Returns `Error::Validation` if the graph has a cycle.
    pub fn levels(&self) -> Result<Vec<Vec<u32>>> {
        if self.has_cycles() {
            return Err(Error::Validation(
                "agent dependencies form a cycle".to_owned(),
            ));
        }

        let mut completed = BTreeSet::new();
        let mut levels = Vec::new();
        while completed.len() < self.agent_count() {
            let level = self.ready(&completed);
            if level.is_empty() {
                return Err(Error::Validation(
                    "agent dependencies cannot be satisfied".to_owned(),
                ));
            }
            completed.extend(level.iter().copied());
            levels.push(level);
        }
        Ok(levels)
    }
}
