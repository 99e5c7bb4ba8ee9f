//! # Dependency Resolver
//!
//! Turns a validated playbook into an [`ExecutionPlan`]: an ordered
//! sequence of ready groups in which every step appears strictly after
//! all of its dependencies. The sort is deterministic, with ties broken
//! by declaration order, so identical playbooks always produce identical
//! plans and therefore reproducible runs.
//!
//! Cycles are detected by depth-first traversal before any ordering is
//! attempted and reported with the participating step names. Resolution
//! happens synchronously at start time; a playbook that fails here never
//! reaches the execution engine.

pub mod graph;
pub mod plan;

pub use graph::DependencyGraph;
pub use plan::ExecutionPlan;

use thiserror::Error;

use crate::playbook::SequenceId;

/// Errors raised while building the graph or computing the plan. All of
/// them are fatal and non-retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("step `{step}` depends on unknown step or unit `{dependency}`")]
    UnknownDependency { step: String, dependency: String },

    #[error("step `{step}` depends on sequence {sequence}, which is declared by more than one step")]
    AmbiguousSequence { step: String, sequence: SequenceId },

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },
}

pub type ResolveResult<T> = std::result::Result<T, ResolveError>;
