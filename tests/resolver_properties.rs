//! # Resolver Property Tests
//!
//! Generated playbooks exercise the dependency resolver: backward-only
//! edges must always produce a plan consistent with every edge, and
//! chains closed into rings must always be rejected as cycles.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;

use playbook_core::playbook::{DependencyRef, Playbook, ScriptStep, Step};
use playbook_core::resolver::{ExecutionPlan, ResolveError};

fn step_name(i: usize) -> String {
    format!("step-{i:02}")
}

fn script(i: usize, deps: Vec<usize>) -> Step {
    Step::Script(ScriptStep {
        name: step_name(i),
        command: format!("cmd {i}"),
        depends_on: deps
            .into_iter()
            .map(|d| DependencyRef::Name(step_name(d)))
            .collect(),
        retry: None,
        continue_on_error: false,
    })
}

fn playbook(steps: Vec<Step>) -> Playbook {
    Playbook {
        name: "generated".to_string(),
        description: None,
        variables: HashMap::new(),
        steps,
        externals: Vec::new(),
    }
}

/// Random DAGs: step `i` may depend only on steps declared before it, so
/// the result is acyclic by construction.
fn acyclic_playbook_strategy() -> impl Strategy<Value = Playbook> {
    (2usize..10).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<bool>(), n), n).prop_map(
            move |edge_bits| {
                let steps = (0..n)
                    .map(|i| {
                        let deps = (0..i).filter(|&j| edge_bits[i][j]).collect();
                        script(i, deps)
                    })
                    .collect();
                playbook(steps)
            },
        )
    })
}

/// Chains `0 ← 1 ← … ← k-1` closed into a ring by making step 0 depend
/// on the last step. Every member sits on the one cycle.
fn ring_playbook_strategy() -> impl Strategy<Value = (Playbook, usize)> {
    (2usize..8).prop_map(|k| {
        let steps = (0..k)
            .map(|i| {
                let deps = if i == 0 { vec![k - 1] } else { vec![i - 1] };
                script(i, deps)
            })
            .collect();
        (playbook(steps), k)
    })
}

proptest! {
    /// Property: every dependency edge is respected by the plan's order.
    #[test]
    fn acyclic_playbooks_resolve_consistent_with_every_edge(
        playbook in acyclic_playbook_strategy()
    ) {
        let plan = ExecutionPlan::resolve(&playbook).unwrap();
        for step in &playbook.steps {
            for dep in step.depends_on() {
                let dep_pos = plan.position(&dep.to_string()).unwrap();
                let step_pos = plan.position(step.name()).unwrap();
                prop_assert!(
                    dep_pos < step_pos,
                    "{} (at {}) must precede {} (at {})",
                    dep, dep_pos, step.name(), step_pos
                );
            }
        }
    }

    /// Property: the plan covers each top-level step exactly once, and
    /// resolving again yields the identical plan.
    #[test]
    fn plans_cover_every_step_exactly_once_and_deterministically(
        playbook in acyclic_playbook_strategy()
    ) {
        let plan = ExecutionPlan::resolve(&playbook).unwrap();
        let order = plan.total_order();
        prop_assert_eq!(order.len(), playbook.steps.len());
        let unique: HashSet<&str> = order.iter().copied().collect();
        prop_assert_eq!(unique.len(), order.len());
        for step in &playbook.steps {
            prop_assert!(unique.contains(step.name()));
        }

        let again = ExecutionPlan::resolve(&playbook).unwrap();
        prop_assert_eq!(&plan, &again);
    }

    /// Property: rings never resolve, and the error names every member.
    #[test]
    fn rings_are_rejected_as_cycles((playbook, k) in ring_playbook_strategy()) {
        let err = ExecutionPlan::resolve(&playbook).unwrap_err();
        let is_cycle = matches!(err, ResolveError::Cycle { .. });
        prop_assert!(is_cycle);
        let message = err.to_string();
        prop_assert!(message.contains("->"));
        for i in 0..k {
            prop_assert!(
                message.contains(&step_name(i)),
                "cycle message `{}` should name {}",
                message, step_name(i)
            );
        }
    }
}
