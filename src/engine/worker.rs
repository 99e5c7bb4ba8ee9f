//! # Step Tree Workers
//!
//! Executes one dispatched top-level step and everything nested beneath
//! it, returning results for the whole subtree. Workers own local copies
//! of the scope; the coordinator alone merges results back between ready
//! groups.
//!
//! ## Dispatch semantics
//!
//! - **Conditional**: the condition is evaluated against the group's
//!   scope snapshot; exactly one branch runs, sequentially and in
//!   declared order, with each branch member seeing the outputs of the
//!   members before it. The untaken branch is marked `Skipped` down to
//!   the leaves. A condition error fails the node and skips both
//!   branches.
//! - **Parallel**: children run concurrently under the group's throttle.
//!   `FailFast` gives the group a child cancellation token and fires it
//!   on the first hard child failure, so slow siblings stop at their next
//!   cancellation point instead of running to completion. `CollectAll`
//!   lets every child finish and aggregates afterwards.
//! - A child's `continueOnError` makes its failure soft: the enclosing
//!   node carries on and can still succeed.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::Value as Json;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventPublisher};
use crate::expression::{Expression, Scope};
use crate::playbook::{ConditionalStep, FailurePolicy, ParallelGroup, Step};

use super::cancel::CancelToken;
use super::status::{StepResult, StepStatus};
use super::step_executor::StepExecutor;

/// Results for a dispatched step and every step nested beneath it.
pub(crate) type TreeResults = Vec<(String, StepResult)>;

#[derive(Clone)]
pub(crate) struct StepWorker {
    pub run_id: Uuid,
    pub executor: StepExecutor,
    pub events: EventPublisher,
    pub config: Arc<EngineConfig>,
}

impl StepWorker {
    /// Executes a step tree. Boxed because conditionals and parallel
    /// groups recurse into their members.
    pub(crate) fn execute(
        &self,
        step: Step,
        scope: Arc<Scope>,
        cancel: CancelToken,
    ) -> BoxFuture<'static, TreeResults> {
        let worker = self.clone();
        async move {
            match step {
                Step::Script(script) => {
                    let result = worker
                        .executor
                        .execute_script(worker.run_id, &script, &scope, &cancel)
                        .await;
                    vec![(script.name, result)]
                }
                Step::UnitRef(unit) => {
                    let result = worker
                        .executor
                        .execute_unit(worker.run_id, &unit, &cancel)
                        .await;
                    vec![(unit.name, result)]
                }
                Step::Conditional(cond) => worker.execute_conditional(cond, scope, cancel).await,
                Step::Parallel(group) => worker.execute_parallel(group, scope, cancel).await,
            }
        }
        .boxed()
    }

    async fn execute_conditional(
        &self,
        cond: ConditionalStep,
        scope: Arc<Scope>,
        cancel: CancelToken,
    ) -> TreeResults {
        let started_at = Utc::now();
        self.events.publish(EngineEvent::StepStarted {
            run_id: self.run_id,
            step: cond.name.clone(),
            at: started_at,
        });

        let decision =
            Expression::parse(&cond.condition).and_then(|expr| expr.evaluate_bool(&scope));
        let take_then = match decision {
            Ok(value) => value,
            Err(err) => {
                warn!(step = %cond.name, error = %err, "condition evaluation failed");
                let mut results = TreeResults::new();
                for step in cond.then_steps.iter().chain(cond.else_steps.iter()) {
                    push_subtree(&mut results, step, StepStatus::Skipped);
                }
                results.push(self.finish_node(
                    &cond.name,
                    StepResult::failed(format!("condition evaluation failed: {err}"), 0, started_at),
                ));
                return results;
            }
        };
        debug!(step = %cond.name, take_then, "condition evaluated");

        let (taken, skipped) = if take_then {
            (cond.then_steps, cond.else_steps)
        } else {
            (cond.else_steps, cond.then_steps)
        };

        let mut results = TreeResults::new();
        for step in &skipped {
            push_subtree(&mut results, step, StepStatus::Skipped);
        }

        // Branch members run sequentially and see their predecessors'
        // outputs through a branch-local scope.
        let mut local = (*scope).clone();
        let mut node_status = StepStatus::Succeeded;
        let mut node_error: Option<String> = None;
        let mut remaining = taken.into_iter();
        while let Some(child) = remaining.next() {
            if cancel.is_cancelled() {
                push_subtree(&mut results, &child, StepStatus::Cancelled);
                for rest in remaining.by_ref() {
                    push_subtree(&mut results, &rest, StepStatus::Cancelled);
                }
                node_status = StepStatus::Cancelled;
                break;
            }

            let child_name = child.name().to_string();
            let hard = !continues_on_error(&child);
            let child_results = self
                .execute(child, Arc::new(local.clone()), cancel.clone())
                .await;
            for (name, result) in &child_results {
                if result.status == StepStatus::Succeeded {
                    local.set_step_output(name.clone(), result.output.clone());
                }
            }
            let own = child_results
                .iter()
                .find(|(name, _)| *name == child_name)
                .map(|(_, result)| (result.status, result.error.clone()));
            results.extend(child_results);

            match own {
                Some((StepStatus::Failed, error)) if hard => {
                    node_status = StepStatus::Failed;
                    node_error = Some(format!(
                        "step `{child_name}` failed: {}",
                        error.unwrap_or_else(|| "unknown error".to_string())
                    ));
                    for rest in remaining.by_ref() {
                        push_subtree(&mut results, &rest, StepStatus::Skipped);
                    }
                    break;
                }
                Some((StepStatus::Cancelled, _)) => {
                    node_status = StepStatus::Cancelled;
                    for rest in remaining.by_ref() {
                        push_subtree(&mut results, &rest, StepStatus::Cancelled);
                    }
                    break;
                }
                _ => {}
            }
        }

        let node_result = match node_status {
            StepStatus::Failed => {
                StepResult::failed(node_error.unwrap_or_default(), 0, started_at)
            }
            StepStatus::Cancelled => StepResult::cancelled(0, Some(started_at)),
            _ => StepResult::succeeded(Json::Null, 0, started_at),
        };
        results.push(self.finish_node(&cond.name, node_result));
        results
    }

    async fn execute_parallel(
        &self,
        group: ParallelGroup,
        scope: Arc<Scope>,
        cancel: CancelToken,
    ) -> TreeResults {
        let started_at = Utc::now();
        self.events.publish(EngineEvent::StepStarted {
            run_id: self.run_id,
            step: group.name.clone(),
            at: started_at,
        });

        let throttle = self.config.effective_throttle(group.throttle);
        let policy = group.failure_policy;
        let group_cancel = match policy {
            FailurePolicy::FailFast => cancel.child(),
            FailurePolicy::CollectAll => cancel.clone(),
        };
        let semaphore = Arc::new(Semaphore::new(throttle));
        let hard_children: HashMap<String, bool> = group
            .children
            .iter()
            .map(|child| (child.name().to_string(), !continues_on_error(child)))
            .collect();
        let total = group.children.len();
        debug!(
            step = %group.name,
            children = total,
            throttle,
            policy = %policy,
            "dispatching parallel group"
        );

        let mut in_flight = FuturesUnordered::new();
        for child in group.children {
            let worker = self.clone();
            let scope = scope.clone();
            let token = group_cancel.clone();
            let semaphore = semaphore.clone();
            let child_name = child.name().to_string();
            in_flight.push(tokio::spawn(async move {
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok(),
                    _ = token.cancelled() => None,
                };
                let Some(_permit) = permit else {
                    let mut results = TreeResults::new();
                    push_subtree(&mut results, &child, StepStatus::Cancelled);
                    return (child_name, results);
                };
                let results = AssertUnwindSafe(worker.execute(child, scope, token))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        vec![(
                            child_name.clone(),
                            StepResult::failed("step worker panicked", 0, Utc::now()),
                        )]
                    });
                (child_name, results)
            }));
        }

        let mut all = TreeResults::new();
        let mut hard_failures: Vec<(String, String)> = Vec::new();
        let mut cancelled_children = 0usize;
        while let Some(joined) = in_flight.next().await {
            let Ok((child_name, child_results)) = joined else {
                warn!(step = %group.name, "parallel child task aborted");
                continue;
            };
            if let Some((_, result)) = child_results.iter().find(|(name, _)| *name == child_name) {
                let hard = hard_children.get(&child_name).copied().unwrap_or(true);
                match result.status {
                    StepStatus::Failed if hard => {
                        let error = result
                            .error
                            .clone()
                            .unwrap_or_else(|| "unknown error".to_string());
                        hard_failures.push((child_name.clone(), error));
                        if policy == FailurePolicy::FailFast && hard_failures.len() == 1 {
                            debug!(step = %group.name, child = %child_name, "fail-fast: cancelling siblings");
                            group_cancel.cancel();
                        }
                    }
                    StepStatus::Cancelled => cancelled_children += 1,
                    _ => {}
                }
            }
            all.extend(child_results);
        }

        let node_result = if let Some((first_child, first_error)) = hard_failures.first() {
            let message = if hard_failures.len() == 1 {
                format!("child `{first_child}` failed: {first_error}")
            } else {
                format!(
                    "{} of {total} children failed; first: child `{first_child}` failed: {first_error}",
                    hard_failures.len()
                )
            };
            StepResult::failed(message, 0, started_at)
        } else if cancelled_children > 0 {
            StepResult::cancelled(0, Some(started_at))
        } else {
            StepResult::succeeded(Json::Null, 0, started_at)
        };
        all.push(self.finish_node(&group.name, node_result));
        all
    }

    fn finish_node(&self, name: &str, result: StepResult) -> (String, StepResult) {
        self.events.publish(EngineEvent::StepFinished {
            run_id: self.run_id,
            step: name.to_string(),
            status: result.status,
            attempts: result.attempts,
            at: Utc::now(),
        });
        (name.to_string(), result)
    }
}

/// Whether a failure of this step is tolerated by its surroundings.
/// Composite steps never continue on error; their status is derived from
/// their members.
pub(crate) fn continues_on_error(step: &Step) -> bool {
    match step {
        Step::Script(script) => script.continue_on_error,
        Step::UnitRef(unit) => unit.continue_on_error,
        Step::Conditional(_) | Step::Parallel(_) => false,
    }
}

/// Records `status` for a step and its whole subtree, used for branches
/// and children that never run.
pub(crate) fn push_subtree(results: &mut TreeResults, step: &Step, status: StepStatus) {
    let result = match status {
        StepStatus::Cancelled => StepResult::cancelled(0, None),
        _ => StepResult::skipped(),
    };
    results.push((step.name().to_string(), result));
    for nested in step.nested() {
        push_subtree(results, nested, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CommandExecutor, CommandOutcome};
    use crate::playbook::{Playbook, SequenceId};
    use async_trait::async_trait;
    use serde_json::json;

    /// Test executor: succeeds unless the step name appears in the fail
    /// list.
    struct ScriptedExecutor {
        failing: Vec<String>,
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn run_command(&self, step: &str, _command: &str) -> CommandOutcome {
            if self.failing.iter().any(|f| f == step) {
                CommandOutcome::failure(1, format!("{step} exploded"))
            } else {
                CommandOutcome::success(json!(format!("{step} done")))
            }
        }

        async fn run_unit(&self, step: &str, _sequence: SequenceId) -> CommandOutcome {
            self.run_command(step, "").await
        }
    }

    fn worker(failing: &[&str]) -> StepWorker {
        let config = Arc::new(EngineConfig::for_testing());
        let events = EventPublisher::new(config.event_capacity);
        let executor = Arc::new(ScriptedExecutor {
            failing: failing.iter().map(|s| s.to_string()).collect(),
        });
        StepWorker {
            run_id: Uuid::new_v4(),
            executor: StepExecutor::new(executor, events.clone(), config.clone()),
            events,
            config,
        }
    }

    fn single_step(yaml: &str) -> Step {
        let playbook: Playbook =
            serde_yaml::from_str(&format!("name: t\nsteps:\n{yaml}")).expect("step should parse");
        playbook.steps.into_iter().next().expect("one step")
    }

    fn status_of<'a>(results: &'a TreeResults, name: &str) -> &'a StepResult {
        &results
            .iter()
            .find(|(n, _)| n == name)
            .unwrap_or_else(|| panic!("no result for {name}"))
            .1
    }

    #[tokio::test]
    async fn conditional_takes_else_and_skips_then() {
        let step = single_step(
            r#"
  - type: conditional
    name: gate
    condition: "vars.env == 'prod'"
    thenSteps:
      - type: script
        name: prod-path
        command: "p"
    elseSteps:
      - type: script
        name: dev-path
        command: "d"
"#,
        );
        let w = worker(&[]);
        let scope = Arc::new(Scope::new(HashMap::from([(
            "env".to_string(),
            json!("dev"),
        )])));
        let results = w.execute(step, scope, CancelToken::new()).await;

        assert_eq!(status_of(&results, "gate").status, StepStatus::Succeeded);
        assert_eq!(status_of(&results, "dev-path").status, StepStatus::Succeeded);
        assert_eq!(status_of(&results, "prod-path").status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn condition_error_fails_the_node_and_skips_both_branches() {
        let step = single_step(
            r#"
  - type: conditional
    name: gate
    condition: "vars.missing == 'x'"
    thenSteps:
      - type: script
        name: yes-path
        command: "y"
    elseSteps:
      - type: script
        name: no-path
        command: "n"
"#,
        );
        let w = worker(&[]);
        let results = w
            .execute(step, Arc::new(Scope::default()), CancelToken::new())
            .await;

        let gate = status_of(&results, "gate");
        assert_eq!(gate.status, StepStatus::Failed);
        assert!(gate.error.as_deref().unwrap().contains("unresolved reference"));
        assert_eq!(status_of(&results, "yes-path").status, StepStatus::Skipped);
        assert_eq!(status_of(&results, "no-path").status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn branch_failure_skips_later_branch_members() {
        let step = single_step(
            r#"
  - type: conditional
    name: gate
    condition: "true"
    thenSteps:
      - type: script
        name: first
        command: "a"
      - type: script
        name: second
        command: "b"
      - type: script
        name: third
        command: "c"
"#,
        );
        let w = worker(&["second"]);
        let results = w
            .execute(step, Arc::new(Scope::default()), CancelToken::new())
            .await;

        assert_eq!(status_of(&results, "first").status, StepStatus::Succeeded);
        assert_eq!(status_of(&results, "second").status, StepStatus::Failed);
        assert_eq!(status_of(&results, "third").status, StepStatus::Skipped);
        let gate = status_of(&results, "gate");
        assert_eq!(gate.status, StepStatus::Failed);
        assert!(gate.error.as_deref().unwrap().contains("second"));
    }

    #[tokio::test]
    async fn collect_all_lets_siblings_finish() {
        let step = single_step(
            r#"
  - type: parallel
    name: fan-out
    failurePolicy: collectAll
    children:
      - type: script
        name: ok-a
        command: "a"
      - type: script
        name: bad
        command: "b"
      - type: script
        name: ok-b
        command: "c"
"#,
        );
        let w = worker(&["bad"]);
        let results = w
            .execute(step, Arc::new(Scope::default()), CancelToken::new())
            .await;

        assert_eq!(status_of(&results, "ok-a").status, StepStatus::Succeeded);
        assert_eq!(status_of(&results, "ok-b").status, StepStatus::Succeeded);
        assert_eq!(status_of(&results, "bad").status, StepStatus::Failed);
        let group = status_of(&results, "fan-out");
        assert_eq!(group.status, StepStatus::Failed);
        assert!(group.error.as_deref().unwrap().contains("bad"));
    }

    #[tokio::test]
    async fn soft_failures_do_not_fail_the_group() {
        let step = single_step(
            r#"
  - type: parallel
    name: fan-out
    failurePolicy: collectAll
    children:
      - type: script
        name: tolerated
        command: "a"
        continueOnError: true
      - type: script
        name: fine
        command: "b"
"#,
        );
        let w = worker(&["tolerated"]);
        let results = w
            .execute(step, Arc::new(Scope::default()), CancelToken::new())
            .await;

        assert_eq!(status_of(&results, "tolerated").status, StepStatus::Failed);
        assert_eq!(status_of(&results, "fan-out").status, StepStatus::Succeeded);
    }

    #[test]
    fn push_subtree_reaches_the_leaves() {
        let step = single_step(
            r#"
  - type: conditional
    name: outer
    condition: "true"
    thenSteps:
      - type: parallel
        name: inner
        children:
          - type: script
            name: leaf
            command: "x"
"#,
        );
        let mut results = TreeResults::new();
        push_subtree(&mut results, &step, StepStatus::Skipped);
        let names: Vec<&str> = results.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["outer", "inner", "leaf"]);
        assert!(results.iter().all(|(_, r)| r.status == StepStatus::Skipped));
    }
}
