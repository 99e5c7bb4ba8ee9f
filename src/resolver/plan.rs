//! Execution plan: the resolved, dependency-respecting ordering of ready
//! groups produced before a run begins.

use tracing::debug;

use crate::playbook::Playbook;

use super::graph::DependencyGraph;
use super::ResolveError;

/// Ordered sequence of ready groups over a playbook's top-level steps.
///
/// Every member of group `i` has all of its dependencies in groups
/// `0..i`, so the members of one group may be dispatched concurrently.
/// Within a group, members appear in declaration order; resolving the
/// same playbook twice yields an identical plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    groups: Vec<Vec<String>>,
}

impl ExecutionPlan {
    /// Builds the dependency graph and computes the plan, rejecting
    /// unknown references and cycles. Fatal and non-retryable on error:
    /// nothing from the playbook executes.
    pub fn resolve(playbook: &Playbook) -> Result<Self, ResolveError> {
        let graph = DependencyGraph::build(playbook)?;
        if let Some(cycle) = graph.find_cycle() {
            return Err(ResolveError::Cycle { cycle });
        }
        let groups = graph.ready_groups();
        debug!(
            playbook = %playbook.name,
            steps = graph.len(),
            groups = groups.len(),
            "resolved execution plan"
        );
        Ok(Self { groups })
    }

    pub fn groups(&self) -> &[Vec<String>] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Total step order with group boundaries flattened away.
    pub fn total_order(&self) -> Vec<&str> {
        self.groups
            .iter()
            .flat_map(|g| g.iter().map(String::as_str))
            .collect()
    }

    /// Position of a step in the flattened order, if it is in the plan.
    pub fn position(&self, step: &str) -> Option<usize> {
        self.total_order().iter().position(|s| *s == step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(yaml: &str) -> ExecutionPlan {
        let playbook = Playbook::from_yaml(yaml).expect("playbook should load");
        ExecutionPlan::resolve(&playbook).expect("plan should resolve")
    }

    #[test]
    fn diamond_resolves_into_three_groups() {
        let plan = plan(
            r#"
name: diamond
steps:
  - type: script
    name: a
    command: "x"
  - type: script
    name: b
    command: "x"
    dependsOn: [a]
  - type: script
    name: c
    command: "x"
    dependsOn: [a]
  - type: script
    name: d
    command: "x"
    dependsOn: [b, c]
"#,
        );
        assert_eq!(plan.groups().len(), 3);
        assert!(plan.position("a").unwrap() < plan.position("b").unwrap());
        assert!(plan.position("a").unwrap() < plan.position("c").unwrap());
        assert!(plan.position("d").unwrap() > plan.position("b").unwrap());
        assert!(plan.position("d").unwrap() > plan.position("c").unwrap());
    }

    #[test]
    fn independent_steps_share_the_first_group() {
        let plan = plan(
            r#"
name: flat
steps:
  - type: script
    name: one
    command: "x"
  - type: script
    name: two
    command: "x"
  - type: script
    name: three
    command: "x"
"#,
        );
        assert_eq!(plan.groups().len(), 1);
        assert_eq!(plan.total_order(), vec!["one", "two", "three"]);
    }

    #[test]
    fn resolve_is_deterministic() {
        let yaml = r#"
name: repeat
steps:
  - type: script
    name: z-last-by-name
    command: "x"
  - type: script
    name: a-first-by-name
    command: "x"
  - type: script
    name: tail
    command: "x"
    dependsOn: [z-last-by-name, a-first-by-name]
"#;
        let playbook = Playbook::from_yaml(yaml).unwrap();
        let first = ExecutionPlan::resolve(&playbook).unwrap();
        let second = ExecutionPlan::resolve(&playbook).unwrap();
        assert_eq!(first, second);
        // Declaration order, not alphabetical order, breaks ties.
        assert_eq!(first.groups()[0], vec!["z-last-by-name", "a-first-by-name"]);
    }

    #[test]
    fn cycle_error_names_the_participants() {
        let playbook = Playbook::from_yaml(
            r#"
name: cyclic
steps:
  - type: script
    name: first
    command: "x"
    dependsOn: [second]
  - type: script
    name: second
    command: "x"
    dependsOn: [first]
"#,
        )
        .unwrap();
        let err = ExecutionPlan::resolve(&playbook).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("first"), "missing step name in `{message}`");
        assert!(message.contains("second"), "missing step name in `{message}`");
        assert!(message.contains("->"), "missing arrow in `{message}`");
    }

    #[test]
    fn empty_playbook_resolves_to_an_empty_plan() {
        let plan = plan("name: empty\nsteps: []");
        assert!(plan.is_empty());
        assert!(plan.total_order().is_empty());
    }
}
