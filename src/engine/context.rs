//! # Execution Context
//!
//! Mutable state owned by exactly one run's coordinator. Workers never
//! touch it: they receive an immutable [`Scope`] snapshot taken at their
//! ready group's boundary and hand their results back, and only the
//! coordinator merges outputs between groups. That makes the consistency
//! story trivial: no locks on the hot path, no torn reads, and every
//! member of a group sees exactly the outputs of previously completed
//! groups.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as Json;

use crate::expression::Scope;

use super::cancel::CancelToken;
use super::status::{StepResult, StepStatus};

#[derive(Debug)]
pub struct ExecutionContext {
    scope: Scope,
    results: HashMap<String, StepResult>,
    cancel: CancelToken,
}

impl ExecutionContext {
    pub fn new(variables: HashMap<String, Json>, cancel: CancelToken) -> Self {
        Self {
            scope: Scope::new(variables),
            results: HashMap::new(),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn variables(&self) -> &HashMap<String, Json> {
        self.scope.vars()
    }

    /// Immutable snapshot of the current scope for one ready group's
    /// workers.
    pub fn snapshot(&self) -> Arc<Scope> {
        Arc::new(self.scope.clone())
    }

    /// Records a step result and, when it succeeded, publishes its output
    /// for later groups. Write-once: a result already recorded for the
    /// name is kept and the new one dropped.
    pub fn record(&mut self, name: &str, result: StepResult) {
        if self.results.contains_key(name) {
            tracing::warn!(step = name, "step result recorded twice, keeping the first");
            return;
        }
        if result.status == StepStatus::Succeeded {
            self.scope.set_step_output(name, result.output.clone());
        }
        self.results.insert(name.to_string(), result);
    }

    pub fn result(&self, name: &str) -> Option<&StepResult> {
        self.results.get(name)
    }

    pub fn has_result(&self, name: &str) -> bool {
        self.results.contains_key(name)
    }

    pub fn results(&self) -> &HashMap<String, StepResult> {
        &self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            HashMap::from([("env".to_string(), json!("prod"))]),
            CancelToken::new(),
        )
    }

    #[test]
    fn succeeded_outputs_become_visible_in_snapshots() {
        let mut ctx = context();
        let before = ctx.snapshot();
        ctx.record("build", StepResult::succeeded(json!(7), 1, Utc::now()));
        let after = ctx.snapshot();

        assert!(before.step_output("build").is_none());
        assert_eq!(after.step_output("build"), Some(&json!(7)));
        assert_eq!(after.var("env"), Some(&json!("prod")));
    }

    #[test]
    fn failed_outputs_stay_absent() {
        let mut ctx = context();
        ctx.record("probe", StepResult::failed("exit code 1", 1, Utc::now()));
        assert!(ctx.snapshot().step_output("probe").is_none());
        assert_eq!(ctx.result("probe").unwrap().status, StepStatus::Failed);
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let mut ctx = context();
        let snapshot = ctx.snapshot();
        ctx.record("late", StepResult::succeeded(json!("x"), 1, Utc::now()));
        assert!(snapshot.step_output("late").is_none());
    }
}
