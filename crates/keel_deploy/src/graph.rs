//! Constructor ordering and the wiring schedule.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::blueprint::{Blueprint, EdgeKind};
use crate::error::DeployError;

/// A post-construction setter call closing a (possibly circular) reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WiringEdge {
    /// Component that owns the setter.
    pub from: String,
    /// Component whose address is passed to the setter.
    pub to: String,
    pub setter: String,
    pub getter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    /// `deps[i]` holds every node `i` needs at construction time.
    deps: Vec<BTreeSet<usize>>,
    wiring: Vec<WiringEdge>,
    deferred: HashSet<(usize, usize)>,
}

impl DependencyGraph {
    /// Collect explicit constructor edges plus the edges implied by `ref`
    /// arguments. A `ref` covered by a wiring edge in the same direction is
    /// deferred instead: it gets the placeholder if the target is not yet
    /// deployed.
    pub fn build(blueprint: &Blueprint) -> Result<Self, DeployError> {
        let nodes: Vec<String> = blueprint.components.iter().map(|c| c.name.clone()).collect();
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, name) in nodes.iter().enumerate() {
            if index.insert(name.clone(), i).is_some() {
                return Err(DeployError::InvalidBlueprint(format!(
                    "duplicate component name '{name}'"
                )));
            }
        }
        let lookup = |name: &str| {
            index.get(name).copied().ok_or_else(|| {
                DeployError::InvalidBlueprint(format!("unknown component '{name}'"))
            })
        };

        let mut deps = vec![BTreeSet::new(); nodes.len()];
        let mut wiring = Vec::new();
        let mut deferred = HashSet::new();

        for edge in &blueprint.edges {
            let (from, to) = (lookup(&edge.from)?, lookup(&edge.to)?);
            match edge.kind {
                EdgeKind::Constructor => {
                    deps[from].insert(to);
                }
                EdgeKind::Wiring => {
                    let setter = edge.setter.clone().ok_or_else(|| {
                        DeployError::InvalidBlueprint(format!(
                            "wiring edge {} -> {} needs a setter",
                            edge.from, edge.to
                        ))
                    })?;
                    deferred.insert((from, to));
                    wiring.push(WiringEdge {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        setter,
                        getter: edge.getter.clone(),
                    });
                }
            }
        }

        for (from, component) in blueprint.components.iter().enumerate() {
            for target in component.args.iter().filter_map(|a| a.target()) {
                let to = lookup(target)?;
                if !deferred.contains(&(from, to)) {
                    deps[from].insert(to);
                }
            }
        }

        Ok(Self {
            nodes,
            index,
            deps,
            wiring,
            deferred,
        })
    }

    /// Kahn's algorithm, always releasing the earliest-declared ready node so
    /// the output is deterministic.
    pub fn deployment_order(&self) -> Result<Vec<String>, DeployError> {
        let n = self.nodes.len();
        let mut pending: Vec<usize> = self.deps.iter().map(BTreeSet::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (node, deps) in self.deps.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(node);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &dependent in &dependents[node] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() < n {
            let placed: HashSet<usize> = order.iter().copied().collect();
            let cycle = self.find_cycle(&placed);
            return Err(DeployError::ConstructorCycle { cycle });
        }
        Ok(order.into_iter().map(|i| self.nodes[i].clone()).collect())
    }

    /// Every unplaced node still has an unplaced dependency, so walking those
    /// dependencies from any unplaced node must revisit a node.
    fn find_cycle(&self, placed: &HashSet<usize>) -> Vec<String> {
        let Some(start) = (0..self.nodes.len()).find(|i| !placed.contains(i)) else {
            return Vec::new();
        };
        let mut path = vec![start];
        let mut seen: HashMap<usize, usize> = HashMap::from([(start, 0)]);
        let mut current = start;
        loop {
            let Some(next) = self.deps[current].iter().copied().find(|d| !placed.contains(d))
            else {
                return path.iter().map(|&i| self.nodes[i].clone()).collect();
            };
            if let Some(&pos) = seen.get(&next) {
                let mut cycle: Vec<String> =
                    path[pos..].iter().map(|&i| self.nodes[i].clone()).collect();
                cycle.push(self.nodes[next].clone());
                return cycle;
            }
            seen.insert(next, path.len());
            path.push(next);
            current = next;
        }
    }

    pub fn wiring_edges(&self) -> &[WiringEdge] {
        &self.wiring
    }

    /// `from` may be constructed with a placeholder for `to`.
    pub fn is_deferred(&self, from: &str, to: &str) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&f), Some(&t)) => self.deferred.contains(&(f, t)),
            _ => false,
        }
    }

    pub fn constructor_deps(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| self.deps[i].iter().map(|&d| self.nodes[d].as_str()).collect())
            .unwrap_or_default()
    }
}

/// What a run would do, computed without touching the network.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub order: Vec<String>,
    /// `(component, target)` pairs that will receive the placeholder because
    /// `target` is constructed later.
    pub deferred: Vec<(String, String)>,
    pub wiring: Vec<WiringEdge>,
    pub grants: Vec<String>,
}

impl Plan {
    pub fn build(blueprint: &Blueprint) -> Result<Self, DeployError> {
        blueprint.validate()?;
        let graph = DependencyGraph::build(blueprint)?;
        let order = graph.deployment_order()?;
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let mut deferred = Vec::new();
        for name in &order {
            let Some(component) = blueprint.component(name) else {
                continue;
            };
            for target in component.args.iter().filter_map(|a| a.target()) {
                if graph.is_deferred(name, target) && position[target] > position[name.as_str()] {
                    deferred.push((name.clone(), target.to_string()));
                }
            }
        }

        Ok(Self {
            order,
            deferred,
            wiring: graph.wiring_edges().to_vec(),
            grants: blueprint.roles.iter().map(|g| g.to_string()).collect(),
        })
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Deployment order:")?;
        for (i, name) in self.order.iter().enumerate() {
            writeln!(f, "  {:>2}. {name}", i + 1)?;
        }
        if !self.deferred.is_empty() {
            writeln!(f, "Placeholders:")?;
            for (component, target) in &self.deferred {
                writeln!(f, "  {component} <- {target} (patched during wiring)")?;
            }
        }
        if !self.wiring.is_empty() {
            writeln!(f, "Wiring:")?;
            for edge in &self.wiring {
                writeln!(f, "  {}.{} <- {}", edge.from, edge.setter, edge.to)?;
            }
        }
        if !self.grants.is_empty() {
            writeln!(f, "Grants:")?;
            for grant in &self.grants {
                writeln!(f, "  {grant}")?;
            }
        }
        Ok(())
    }
}
