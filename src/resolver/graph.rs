//! # Dependency Graph
//!
//! Directed graph over a playbook's top-level steps, derived from declared
//! `dependsOn` edges. Nested steps contribute edges to their enclosing
//! top-level step: a child of a parallel group that depends on an outside
//! step makes the whole group wait, because the group occupies one slot in
//! the outer plan until every child finishes.
//!
//! Resolution rules for a dependency token:
//! - a step name at any depth resolves to its enclosing top-level step
//! - a numeric token resolves through the unit sequence registry
//! - a declared external resolves as already satisfied (no edge)
//! - anything else is an `UnknownDependency` error
//!
//! A reference between two steps nested under the same top-level step
//! collapses to a self-edge and is dropped: the container already
//! serializes (branches) or deliberately unorders (parallel children) its
//! members. A step naming itself is a cycle, reported immediately.

use std::collections::{BTreeSet, HashMap};

use crate::playbook::{DependencyRef, Playbook, SequenceId};

use super::ResolveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    Visiting,
    Visited,
}

/// Dependency graph over top-level steps. Node order is declaration order,
/// which makes every traversal below deterministic.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    /// For each node, the indexes of the nodes it depends on.
    dependencies: Vec<BTreeSet<usize>>,
    /// Reverse edges: for each node, the indexes of the nodes depending on it.
    dependents: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    /// Builds the graph from a validated playbook. Rejects unknown and
    /// ambiguous dependency references; acyclicity is checked separately
    /// via [`DependencyGraph::find_cycle`].
    pub fn build(playbook: &Playbook) -> Result<Self, ResolveError> {
        let nodes: Vec<String> = playbook.steps.iter().map(|s| s.name().to_string()).collect();
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        let ancestors = playbook.top_level_ancestors();
        let sequences = sequence_registry(playbook);

        let mut graph = Self {
            dependencies: vec![BTreeSet::new(); nodes.len()],
            dependents: vec![BTreeSet::new(); nodes.len()],
            nodes,
            index,
        };

        for step in playbook.all_steps() {
            let declaring = step.name();
            // Present for every step of the playbook by construction.
            let Some(source) = ancestors.get(declaring).and_then(|a| graph.index.get(a)) else {
                continue;
            };
            let source = *source;
            for dep in step.depends_on() {
                let target = match resolve_target(dep, declaring, playbook, &ancestors, &sequences)?
                {
                    Some(resolved) => resolved,
                    None => continue,
                };
                if target.step_name == declaring {
                    return Err(ResolveError::Cycle {
                        cycle: vec![declaring.to_string(), declaring.to_string()],
                    });
                }
                let Some(&target_index) = graph.index.get(&target.top_level) else {
                    continue;
                };
                if target_index == source {
                    continue;
                }
                graph.dependencies[source].insert(target_index);
                graph.dependents[target_index].insert(source);
            }
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Names of the steps `name` directly depends on, declaration order.
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| {
                self.dependencies[i]
                    .iter()
                    .map(|&d| self.nodes[d].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names of the steps directly depending on `name`, declaration order.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| {
                self.dependents[i]
                    .iter()
                    .map(|&d| self.nodes[d].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Depth-first cycle search following dependency edges. Returns the
    /// participating step names in cycle order, first repeated at the end,
    /// or `None` for an acyclic graph.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut state = vec![VisitState::Unvisited; self.nodes.len()];
        let mut path = Vec::new();
        for start in 0..self.nodes.len() {
            if state[start] == VisitState::Unvisited {
                if let Some(cycle) = self.visit(start, &mut state, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(
        &self,
        node: usize,
        state: &mut [VisitState],
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        state[node] = VisitState::Visiting;
        path.push(node);
        for &next in &self.dependencies[node] {
            match state[next] {
                VisitState::Visiting => {
                    let pos = path.iter().position(|&p| p == next)?;
                    let mut cycle: Vec<String> =
                        path[pos..].iter().map(|&i| self.nodes[i].clone()).collect();
                    cycle.push(self.nodes[next].clone());
                    return Some(cycle);
                }
                VisitState::Visited => {}
                VisitState::Unvisited => {
                    if let Some(cycle) = self.visit(next, state, path) {
                        return Some(cycle);
                    }
                }
            }
        }
        path.pop();
        state[node] = VisitState::Visited;
        None
    }

    /// Kahn's algorithm by waves: each wave holds every step whose
    /// dependencies are all satisfied by earlier waves, in declaration
    /// order. Call only after [`DependencyGraph::find_cycle`] came back
    /// empty; nodes trapped in a cycle would never be emitted.
    pub fn ready_groups(&self) -> Vec<Vec<String>> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(|d| d.len()).collect();
        let mut emitted = vec![false; self.nodes.len()];
        let mut groups = Vec::new();
        let mut done = 0;
        while done < self.nodes.len() {
            let wave: Vec<usize> = (0..self.nodes.len())
                .filter(|&i| !emitted[i] && remaining[i] == 0)
                .collect();
            if wave.is_empty() {
                break;
            }
            for &node in &wave {
                emitted[node] = true;
                done += 1;
                for &dependent in &self.dependents[node] {
                    remaining[dependent] -= 1;
                }
            }
            groups.push(wave.into_iter().map(|i| self.nodes[i].clone()).collect());
        }
        groups
    }
}

struct ResolvedTarget {
    /// The step the token actually named (any depth).
    step_name: String,
    /// Its enclosing top-level step, the graph node the edge points at.
    top_level: String,
}

fn sequence_registry(playbook: &Playbook) -> HashMap<SequenceId, Vec<String>> {
    let mut registry: HashMap<SequenceId, Vec<String>> = HashMap::new();
    for unit in playbook.unit_refs() {
        registry
            .entry(unit.sequence)
            .or_default()
            .push(unit.name.clone());
    }
    registry
}

fn resolve_target(
    dep: &DependencyRef,
    declaring: &str,
    playbook: &Playbook,
    ancestors: &HashMap<String, String>,
    sequences: &HashMap<SequenceId, Vec<String>>,
) -> Result<Option<ResolvedTarget>, ResolveError> {
    match dep {
        DependencyRef::Name(name) => {
            if let Some(top_level) = ancestors.get(name) {
                return Ok(Some(ResolvedTarget {
                    step_name: name.clone(),
                    top_level: top_level.clone(),
                }));
            }
            if let Ok(sequence) = name.parse::<SequenceId>() {
                return resolve_sequence(sequence, declaring, playbook, ancestors, sequences);
            }
            if playbook.externals.iter().any(|e| e == name) {
                return Ok(None);
            }
            Err(ResolveError::UnknownDependency {
                step: declaring.to_string(),
                dependency: name.clone(),
            })
        }
        DependencyRef::Sequence(sequence) => {
            resolve_sequence(*sequence, declaring, playbook, ancestors, sequences)
        }
    }
}

fn resolve_sequence(
    sequence: SequenceId,
    declaring: &str,
    playbook: &Playbook,
    ancestors: &HashMap<String, String>,
    sequences: &HashMap<SequenceId, Vec<String>>,
) -> Result<Option<ResolvedTarget>, ResolveError> {
    match sequences.get(&sequence).map(Vec::as_slice) {
        Some([unit_name]) => {
            let top_level = ancestors
                .get(unit_name)
                .cloned()
                .unwrap_or_else(|| unit_name.clone());
            Ok(Some(ResolvedTarget {
                step_name: unit_name.clone(),
                top_level,
            }))
        }
        Some(_) => Err(ResolveError::AmbiguousSequence {
            step: declaring.to_string(),
            sequence,
        }),
        None => {
            if playbook.externals.iter().any(|e| e == &sequence.to_string()) {
                return Ok(None);
            }
            Err(ResolveError::UnknownDependency {
                step: declaring.to_string(),
                dependency: sequence.to_string(),
            })
        }
    }
}
