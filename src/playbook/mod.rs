//! # Playbook Model & Loader
//!
//! The typed playbook model ([`model`]) and its YAML/JSON loader with
//! structural validation ([`loader`]). Everything downstream (resolver,
//! engine) consumes the validated model only.

pub mod loader;
pub mod model;

pub use loader::{LoadError, LoadResult};
pub use model::{
    ConditionalStep, DependencyRef, FailurePolicy, ParallelGroup, Playbook, RetryPolicy,
    ScriptStep, SequenceId, Step, UnitRefStep,
};
