//! # Run Coordinator
//!
//! Drives one playbook run from `Running` to its terminal status. The
//! coordinator owns the run's [`ExecutionContext`] and walks the
//! resolved plan group by group: snapshot the scope, dispatch every
//! member of the ready group onto the runtime, collect whole-subtree
//! results, merge outputs, repeat.
//!
//! ## Completion rules
//!
//! - A hard member failure (no `continueOnError`) stops dispatch after
//!   the current group; draining members still finish and their results
//!   are kept. Steps never dispatched are marked `Skipped`.
//! - Cooperative cancellation stops dispatch the same way, marking the
//!   remainder `Cancelled`. A cancel that lands after the last step
//!   finished changes nothing: natural completion wins.
//! - Soft failures are recorded but never stop the run or fail it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value as Json;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::events::{EngineEvent, EventPublisher};
use crate::playbook::Playbook;
use crate::resolver::ExecutionPlan;

use super::context::ExecutionContext;
use super::run::RunHandle;
use super::status::{StepResult, StepStatus};
use super::worker::{continues_on_error, StepWorker};

/// Why dispatch stopped before the plan was exhausted.
enum StopReason {
    Failure { step: String, error: String },
    Cancelled,
}

pub(crate) struct RunCoordinator {
    run_id: Uuid,
    playbook: Arc<Playbook>,
    plan: ExecutionPlan,
    handle: Arc<RunHandle>,
    worker: StepWorker,
    events: EventPublisher,
}

impl RunCoordinator {
    pub(crate) fn new(
        run_id: Uuid,
        playbook: Arc<Playbook>,
        plan: ExecutionPlan,
        handle: Arc<RunHandle>,
        worker: StepWorker,
        events: EventPublisher,
    ) -> Self {
        Self {
            run_id,
            playbook,
            plan,
            handle,
            worker,
            events,
        }
    }

    /// Runs the playbook to completion. Consumes the coordinator; the
    /// terminal status is visible through the run handle afterwards.
    #[instrument(skip(self), fields(run_id = %self.run_id, playbook = %self.playbook.name))]
    pub(crate) async fn execute(self, variables: HashMap<String, Json>) {
        info!("🚀 Starting playbook run");
        self.handle.set_running();
        self.events.publish(EngineEvent::RunStarted {
            run_id: self.run_id,
            playbook: self.playbook.name.clone(),
            at: Utc::now(),
        });

        let mut context = ExecutionContext::new(variables, self.handle.cancel_token());
        let mut stop: Option<StopReason> = None;

        for (index, group) in self.plan.groups().iter().enumerate() {
            if context.cancel_token().is_cancelled() {
                stop = Some(StopReason::Cancelled);
                break;
            }
            debug!(group = index, members = group.len(), "dispatching ready group");
            self.handle.mark_steps_running(group);

            let results = self.dispatch_group(group, &context).await;
            for (name, result) in &results {
                self.handle.record_step(name, result.clone());
            }
            for (name, result) in results {
                context.record(&name, result);
            }

            stop = self.evaluate_group(group, &context);
            if stop.is_some() {
                break;
            }
        }

        self.finalize(stop, &context);
    }

    /// Spawns every member of one ready group and collects subtree
    /// results. Members run concurrently; a member task that panics
    /// outside its own containment is recorded as a hard failure.
    async fn dispatch_group(
        &self,
        group: &[String],
        context: &ExecutionContext,
    ) -> Vec<(String, StepResult)> {
        let scope = context.snapshot();
        let cancel = context.cancel_token().clone();

        let mut names = Vec::with_capacity(group.len());
        let mut tasks = Vec::with_capacity(group.len());
        for name in group {
            let Some(step) = self.playbook.top_level(name) else {
                // Plan members always come from the playbook; a miss here
                // is a resolver defect, surfaced as a failed step.
                warn!(step = %name, "plan member missing from playbook");
                continue;
            };
            let future = self.worker.execute(step.clone(), scope.clone(), cancel.clone());
            names.push(name.clone());
            tasks.push(tokio::spawn(future));
        }

        let mut results = Vec::new();
        for (name, joined) in names.into_iter().zip(join_all(tasks).await) {
            match joined {
                Ok(subtree) => results.extend(subtree),
                Err(join_err) => {
                    error!(step = %name, error = %join_err, "step task aborted");
                    results.push((
                        name,
                        StepResult::failed("step worker panicked", 0, Utc::now()),
                    ));
                }
            }
        }
        results
    }

    /// Picks the stop reason after a group completes, if any. Failures
    /// take precedence over cancellations; within one group the first
    /// decisive member in declaration order wins.
    fn evaluate_group(&self, group: &[String], context: &ExecutionContext) -> Option<StopReason> {
        let mut cancelled = false;
        for name in group {
            let Some(result) = context.result(name) else {
                continue;
            };
            match result.status {
                StepStatus::Failed => {
                    let hard = self
                        .playbook
                        .top_level(name)
                        .map(|step| !continues_on_error(step))
                        .unwrap_or(true);
                    if hard {
                        return Some(StopReason::Failure {
                            step: name.clone(),
                            error: result
                                .error
                                .clone()
                                .unwrap_or_else(|| "unknown error".to_string()),
                        });
                    }
                    debug!(step = %name, "tolerating failure, continueOnError is set");
                }
                StepStatus::Cancelled => cancelled = true,
                _ => {}
            }
        }
        cancelled.then_some(StopReason::Cancelled)
    }

    /// Marks never-dispatched steps, settles the overall status, and
    /// publishes the terminal transition.
    fn finalize(self, stop: Option<StopReason>, context: &ExecutionContext) {
        let leftover_status = match stop {
            Some(StopReason::Failure { .. }) => StepStatus::Skipped,
            Some(StopReason::Cancelled) => StepStatus::Cancelled,
            None => StepStatus::Skipped,
        };
        for step in self.playbook.all_steps() {
            if !context.has_result(step.name()) {
                let result = match leftover_status {
                    StepStatus::Cancelled => StepResult::cancelled(0, None),
                    _ => StepResult::skipped(),
                };
                self.handle.record_step(step.name(), result);
            }
        }

        let (status, run_error) = match stop {
            Some(StopReason::Failure { step, error }) => (
                StepStatus::Failed,
                Some(format!("step `{step}` failed: {error}")),
            ),
            Some(StopReason::Cancelled) => (StepStatus::Cancelled, None),
            None => (StepStatus::Succeeded, None),
        };

        match status {
            StepStatus::Failed => {
                error!(error = %run_error.as_deref().unwrap_or(""), "❌ Playbook run failed")
            }
            StepStatus::Cancelled => warn!("🛑 Playbook run cancelled"),
            _ => info!("✅ Playbook run completed"),
        }
        self.events.publish(EngineEvent::RunFinished {
            run_id: self.run_id,
            playbook: self.playbook.name.clone(),
            status,
            at: Utc::now(),
        });
        self.handle.finalize(status, run_error);
    }
}
