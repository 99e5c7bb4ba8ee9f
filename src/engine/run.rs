//! # Run State
//!
//! [`JobRun`] is the serializable record of one playbook execution:
//! overall status, timing, and a per-step result map prepopulated with
//! `Pending` entries for every step in the tree, nested ones included.
//!
//! [`RunHandle`] wraps a run for shared access between the coordinator
//! task and API callers. Status reads never block on execution; they
//! just lock a snapshot. Once a run reaches a terminal status the handle
//! refuses further mutation, so a cancel acknowledged after natural
//! completion cannot rewrite history.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::playbook::Playbook;

use super::cancel::CancelToken;
use super::status::{StepResult, StepStatus};

/// Record of a single playbook execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub run_id: Uuid,
    pub playbook_name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Message from the first hard failure, when the run failed.
    pub error: Option<String>,
    pub variables: HashMap<String, Json>,
    /// Results keyed by step name, covering every step in the playbook
    /// tree. Steps that never ran keep their `Pending`/`Skipped` entry.
    pub step_results: BTreeMap<String, StepResult>,
}

impl JobRun {
    pub fn new(run_id: Uuid, playbook: &Playbook, variables: HashMap<String, Json>) -> Self {
        let step_results = playbook
            .all_steps()
            .into_iter()
            .map(|step| (step.name().to_string(), StepResult::pending()))
            .collect();
        Self {
            run_id,
            playbook_name: playbook.name.clone(),
            status: StepStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            variables,
            step_results,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step_status(&self, name: &str) -> Option<StepStatus> {
        self.step_results.get(name).map(|result| result.status)
    }

    /// Wall-clock duration, up to now for a run still in flight.
    pub fn duration_ms(&self) -> i64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds()
    }
}

/// Shared view of a run used by the coordinator and by API callers.
pub struct RunHandle {
    run: RwLock<JobRun>,
    cancel: CancelToken,
    status_tx: watch::Sender<StepStatus>,
}

impl RunHandle {
    pub fn new(run: JobRun, cancel: CancelToken) -> Self {
        let (status_tx, _) = watch::channel(run.status);
        Self {
            run: RwLock::new(run),
            cancel,
            status_tx,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run.read().run_id
    }

    pub fn status(&self) -> StepStatus {
        self.run.read().status
    }

    /// Clones the current run record. Never blocks on execution.
    pub fn snapshot(&self) -> JobRun {
        self.run.read().clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Receiver that observes every overall-status transition.
    pub fn watch_status(&self) -> watch::Receiver<StepStatus> {
        self.status_tx.subscribe()
    }

    /// Requests cooperative cancellation. Returns whether the request
    /// was accepted; a run already in a terminal status ignores it.
    pub fn request_cancel(&self) -> bool {
        if self.run.read().is_terminal() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub(crate) fn set_running(&self) {
        self.mutate(|run| {
            run.status = StepStatus::Running;
        });
    }

    /// Marks steps as running ahead of dispatch so status queries see
    /// them in flight.
    pub(crate) fn mark_steps_running(&self, names: &[String]) {
        self.mutate(|run| {
            let now = Utc::now();
            for name in names {
                run.step_results
                    .insert(name.clone(), StepResult::running(now));
            }
        });
    }

    pub(crate) fn record_step(&self, name: &str, result: StepResult) {
        self.mutate(|run| {
            run.step_results.insert(name.to_string(), result.clone());
        });
    }

    pub(crate) fn finalize(&self, status: StepStatus, error: Option<String>) {
        self.mutate(|run| {
            run.status = status;
            run.error = error;
            run.finished_at = Some(Utc::now());
        });
    }

    /// Applies a mutation unless the run is already terminal, then
    /// publishes the (possibly updated) overall status.
    fn mutate(&self, apply: impl FnOnce(&mut JobRun)) {
        let status = {
            let mut run = self.run.write();
            if run.is_terminal() {
                debug!(run_id = %run.run_id, "ignoring update to terminal run");
                return;
            }
            apply(&mut run);
            run.status
        };
        self.status_tx.send_replace(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playbook() -> Playbook {
        Playbook::from_yaml(
            r#"
name: deploy
steps:
  - type: script
    name: build
    command: "make"
  - type: conditional
    name: gate
    condition: "true"
    thenSteps:
      - type: script
        name: ship
        command: "ship"
"#,
        )
        .expect("valid playbook")
    }

    #[test]
    fn new_run_prepopulates_pending_for_nested_steps() {
        let run = JobRun::new(Uuid::new_v4(), &playbook(), HashMap::new());
        assert_eq!(run.status, StepStatus::Pending);
        for name in ["build", "gate", "ship"] {
            assert_eq!(run.step_status(name), Some(StepStatus::Pending), "{name}");
        }
        assert_eq!(run.step_results.len(), 3);
    }

    #[test]
    fn terminal_runs_ignore_further_updates() {
        let handle = RunHandle::new(
            JobRun::new(Uuid::new_v4(), &playbook(), HashMap::new()),
            CancelToken::new(),
        );
        handle.set_running();
        handle.record_step("build", StepResult::skipped());
        handle.finalize(StepStatus::Failed, Some("boom".to_string()));

        handle.finalize(StepStatus::Succeeded, None);
        handle.record_step("ship", StepResult::skipped());

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.status, StepStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("boom"));
        assert_eq!(snapshot.step_status("ship"), Some(StepStatus::Pending));
    }

    #[test]
    fn cancel_requests_are_rejected_after_completion() {
        let handle = RunHandle::new(
            JobRun::new(Uuid::new_v4(), &playbook(), HashMap::new()),
            CancelToken::new(),
        );
        assert!(handle.request_cancel());
        assert!(handle.cancel_token().is_cancelled());

        handle.finalize(StepStatus::Cancelled, None);
        assert!(!handle.request_cancel());
    }

    #[test]
    fn watch_receives_status_transitions() {
        let handle = RunHandle::new(
            JobRun::new(Uuid::new_v4(), &playbook(), HashMap::new()),
            CancelToken::new(),
        );
        let status = handle.watch_status();
        assert_eq!(*status.borrow(), StepStatus::Pending);

        handle.set_running();
        assert_eq!(*status.borrow(), StepStatus::Running);

        handle.finalize(StepStatus::Succeeded, None);
        assert_eq!(*status.borrow(), StepStatus::Succeeded);
    }
}
