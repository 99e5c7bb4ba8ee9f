//! # Leaf Step Execution
//!
//! Runs a single script or unit-reference step through the external
//! executor, applying the retry policy, the optional per-attempt timeout,
//! and cooperative cancellation.
//!
//! ## Key behaviors
//!
//! - `max_attempts` counts total attempts: a step that fails twice and
//!   then succeeds under `maxAttempts: 3` finishes `Succeeded` with
//!   `attempts == 3`.
//! - Backoff grows exponentially from `baseDelayMs`, capped at
//!   `maxDelayMs`, with optional jitter to avoid thundering herds.
//! - A configured timeout bounds each attempt; a timed-out attempt counts
//!   as a failed one and is retried like any other failure.
//! - Cancellation is honored between attempts, during backoff sleeps, and
//!   while an attempt is in flight: the engine stops waiting for the
//!   executor and records `Cancelled`, leaving process termination to the
//!   executor collaborator.
//!
//! An engine-wide semaphore bounds how many external calls run at once,
//! across every run sharing this executor.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventPublisher};
use crate::executor::CommandExecutor;
use crate::expression::{Scope, Template};
use crate::playbook::{RetryPolicy, ScriptStep, SequenceId, UnitRefStep};

use super::cancel::CancelToken;
use super::status::StepResult;

enum LeafCall {
    Command(String),
    Unit(SequenceId),
}

#[derive(Clone)]
pub struct StepExecutor {
    executor: Arc<dyn CommandExecutor>,
    events: EventPublisher,
    config: Arc<EngineConfig>,
    permits: Arc<Semaphore>,
}

impl StepExecutor {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        events: EventPublisher,
        config: Arc<EngineConfig>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_steps.max(1)));
        Self {
            executor,
            events,
            config,
            permits,
        }
    }

    /// Interpolates the command against the scope snapshot and runs it.
    /// An interpolation failure (most commonly an unresolved reference)
    /// fails the step without consuming an executor attempt.
    pub async fn execute_script(
        &self,
        run_id: Uuid,
        step: &ScriptStep,
        scope: &Scope,
        cancel: &CancelToken,
    ) -> StepResult {
        let started_at = Utc::now();
        self.events.publish(EngineEvent::StepStarted {
            run_id,
            step: step.name.clone(),
            at: started_at,
        });
        let policy = step.retry.as_ref().unwrap_or(&self.config.default_retry);
        match Template::parse(&step.command).and_then(|t| t.render(scope)) {
            Ok(command) => {
                self.execute_leaf(
                    run_id,
                    &step.name,
                    LeafCall::Command(command),
                    policy,
                    cancel,
                    started_at,
                )
                .await
            }
            Err(err) => {
                warn!(step = %step.name, error = %err, "command interpolation failed");
                self.finish(
                    run_id,
                    &step.name,
                    StepResult::failed(format!("command interpolation failed: {err}"), 0, started_at),
                )
            }
        }
    }

    /// Runs an externally numbered automation unit.
    pub async fn execute_unit(
        &self,
        run_id: Uuid,
        step: &UnitRefStep,
        cancel: &CancelToken,
    ) -> StepResult {
        let started_at = Utc::now();
        self.events.publish(EngineEvent::StepStarted {
            run_id,
            step: step.name.clone(),
            at: started_at,
        });
        let policy = step.retry.as_ref().unwrap_or(&self.config.default_retry);
        self.execute_leaf(
            run_id,
            &step.name,
            LeafCall::Unit(step.sequence),
            policy,
            cancel,
            started_at,
        )
        .await
    }

    #[instrument(skip(self, call, policy, cancel, started_at), fields(step = %name))]
    async fn execute_leaf(
        &self,
        run_id: Uuid,
        name: &str,
        call: LeafCall,
        policy: &RetryPolicy,
        cancel: &CancelToken,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> StepResult {
        let max_attempts = policy.max_attempts.max(1);
        debug!(max_attempts, "executing leaf step");
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return self.finish(
                    run_id,
                    name,
                    StepResult::cancelled(attempt, Some(started_at)),
                );
            }

            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        return self.finish(
                            run_id,
                            name,
                            StepResult::cancelled(attempt, Some(started_at)),
                        );
                    }
                },
                _ = cancel.cancelled() => {
                    return self.finish(
                        run_id,
                        name,
                        StepResult::cancelled(attempt, Some(started_at)),
                    );
                }
            };

            attempt += 1;
            let outcome = tokio::select! {
                outcome = self.attempt(name, &call, policy.timeout()) => outcome,
                _ = cancel.cancelled() => {
                    drop(permit);
                    debug!(attempt, "attempt abandoned on cancellation");
                    return self.finish(
                        run_id,
                        name,
                        StepResult::cancelled(attempt, Some(started_at)),
                    );
                }
            };
            drop(permit);

            let error = match outcome {
                Some(outcome) if outcome.succeeded() => {
                    debug!(attempt, "step succeeded");
                    return self.finish(
                        run_id,
                        name,
                        StepResult::succeeded(outcome.output, attempt, started_at),
                    );
                }
                Some(outcome) => outcome.failure_message(),
                None => format!(
                    "timed out after {}ms",
                    policy.timeout_ms.unwrap_or_default()
                ),
            };

            if attempt >= max_attempts {
                error!(attempts = attempt, error = %error, "step failed");
                return self.finish(
                    run_id,
                    name,
                    StepResult::failed(error, attempt, started_at),
                );
            }

            let delay = retry_delay(policy, attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "step attempt failed, retrying"
            );
            self.events.publish(EngineEvent::StepRetried {
                run_id,
                step: name.to_string(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                at: Utc::now(),
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return self.finish(
                        run_id,
                        name,
                        StepResult::cancelled(attempt, Some(started_at)),
                    );
                }
            }
        }
    }

    async fn attempt(
        &self,
        name: &str,
        call: &LeafCall,
        limit: Option<Duration>,
    ) -> Option<crate::executor::CommandOutcome> {
        let invocation = async {
            match call {
                LeafCall::Command(command) => self.executor.run_command(name, command).await,
                LeafCall::Unit(sequence) => self.executor.run_unit(name, *sequence).await,
            }
        };
        match limit {
            Some(limit) => tokio::time::timeout(limit, invocation).await.ok(),
            None => Some(invocation.await),
        }
    }

    fn finish(&self, run_id: Uuid, name: &str, result: StepResult) -> StepResult {
        self.events.publish(EngineEvent::StepFinished {
            run_id,
            step: name.to_string(),
            status: result.status,
            attempts: result.attempts,
            at: Utc::now(),
        });
        result
    }
}

/// Exponential backoff with a cap and optional jitter in `[0.8, 1.2)`.
fn retry_delay(policy: &RetryPolicy, completed_attempts: u32) -> Duration {
    let cap_ms = policy.max_delay_ms.max(policy.base_delay_ms) as f64;
    let exponent = completed_attempts.saturating_sub(1).min(16) as i32;
    let multiplier = policy.backoff_multiplier.clamp(1.0, 64.0);
    let exponential = (policy.base_delay_ms as f64) * multiplier.powi(exponent);
    let mut delay_ms = if exponential.is_finite() {
        exponential.min(cap_ms)
    } else {
        cap_ms
    };
    if policy.jitter {
        delay_ms = (delay_ms * (0.8 + fastrand::f64() * 0.4)).min(cap_ms);
    }
    Duration::from_millis(delay_ms as u64)
}
