//! # Run Control API
//!
//! Entry point of the engine: registers playbooks, starts runs, and
//! answers status and cancellation requests. Loading and dependency
//! resolution happen synchronously inside `start`, so a malformed or
//! cyclic playbook is rejected before anything executes; accepted runs
//! are handed to a coordinator task and tracked until the caller
//! discards them.
//!
//! ## Usage
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use playbook_core::control::RunControl;
//! use playbook_core::executor::ShellExecutor;
//!
//! # async fn example() -> playbook_core::Result<()> {
//! let control = RunControl::new(Arc::new(ShellExecutor::default()));
//! let run_id = control.start_from_yaml(
//!     "name: hello\nsteps:\n  - type: script\n    name: greet\n    command: \"echo hi\"\n",
//!     HashMap::new(),
//! )?;
//! let run = control.wait_for_completion(run_id, Duration::from_secs(60)).await?;
//! println!("{}: {:?}", run.playbook_name, run.status);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value as Json;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::cancel::CancelToken;
use crate::engine::coordinator::RunCoordinator;
use crate::engine::run::{JobRun, RunHandle};
use crate::engine::step_executor::StepExecutor;
use crate::engine::worker::StepWorker;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventPublisher};
use crate::executor::CommandExecutor;
use crate::playbook::Playbook;
use crate::resolver::ExecutionPlan;

/// Orchestration engine front door. Cheap to share: clone an `Arc` of it
/// across API surfaces.
pub struct RunControl {
    playbooks: DashMap<String, Arc<Playbook>>,
    runs: DashMap<Uuid, Arc<RunHandle>>,
    step_executor: StepExecutor,
    events: EventPublisher,
    config: Arc<EngineConfig>,
}

impl RunControl {
    /// Creates a control surface with default configuration.
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        // The default configuration always passes validation.
        Self::assemble(executor, EngineConfig::default())
    }

    /// Creates a control surface with explicit configuration, rejecting
    /// invalid settings up front.
    pub fn with_config(executor: Arc<dyn CommandExecutor>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(executor, config))
    }

    fn assemble(executor: Arc<dyn CommandExecutor>, config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let events = EventPublisher::new(config.event_capacity);
        // One executor shared by every run keeps the concurrency cap
        // engine-wide rather than per run.
        let step_executor = StepExecutor::new(executor, events.clone(), config.clone());
        Self {
            playbooks: DashMap::new(),
            runs: DashMap::new(),
            step_executor,
            events,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribes to the engine event stream. Slow subscribers may lag
    /// and miss events; state queries go through [`Self::run_status`].
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Validates and registers a playbook for starting by name.
    /// Re-registering a name replaces the earlier definition; runs
    /// already started keep the version they were started with.
    pub fn register_playbook(&self, playbook: Playbook) -> Result<()> {
        playbook.validate()?;
        let name = playbook.name.clone();
        let replaced = self
            .playbooks
            .insert(name.clone(), Arc::new(playbook))
            .is_some();
        info!(playbook = %name, replaced, "📘 Playbook registered");
        Ok(())
    }

    /// Names of all registered playbooks, unordered.
    pub fn playbook_names(&self) -> Vec<String> {
        self.playbooks.iter().map(|e| e.key().clone()).collect()
    }

    /// Starts a registered playbook by name.
    pub fn start_by_name(
        &self,
        name: &str,
        variables: HashMap<String, Json>,
    ) -> Result<Uuid> {
        let playbook = self
            .playbooks
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::unknown_playbook(name))?;
        self.start_resolved(playbook, variables)
    }

    /// Validates and starts an in-memory playbook without registering it.
    pub fn start(&self, playbook: Playbook, variables: HashMap<String, Json>) -> Result<Uuid> {
        playbook.validate()?;
        self.start_resolved(Arc::new(playbook), variables)
    }

    /// Parses, validates, and starts a YAML playbook document.
    pub fn start_from_yaml(
        &self,
        source: &str,
        variables: HashMap<String, Json>,
    ) -> Result<Uuid> {
        let playbook = Playbook::from_yaml(source)?;
        self.start_resolved(Arc::new(playbook), variables)
    }

    /// Resolves the plan synchronously and hands the run to a
    /// coordinator task. Returns as soon as the run is accepted.
    #[instrument(skip(self, playbook, variables), fields(playbook = %playbook.name))]
    fn start_resolved(
        &self,
        playbook: Arc<Playbook>,
        variables: HashMap<String, Json>,
    ) -> Result<Uuid> {
        let plan = ExecutionPlan::resolve(&playbook)?;
        let run_id = Uuid::new_v4();
        let cancel = CancelToken::new();
        let run = JobRun::new(run_id, &playbook, variables.clone());
        let handle = Arc::new(RunHandle::new(run, cancel));
        self.runs.insert(run_id, handle.clone());

        let worker = StepWorker {
            run_id,
            executor: self.step_executor.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        };
        let coordinator = RunCoordinator::new(
            run_id,
            playbook,
            plan,
            handle,
            worker,
            self.events.clone(),
        );
        tokio::spawn(coordinator.execute(variables));

        info!(run_id = %run_id, "run accepted");
        Ok(run_id)
    }

    /// Snapshot of a run's current state. Never blocks on execution.
    pub fn run_status(&self, run_id: Uuid) -> Result<JobRun> {
        self.runs
            .get(&run_id)
            .map(|entry| entry.value().snapshot())
            .ok_or_else(|| EngineError::unknown_run(run_id))
    }

    /// Requests cooperative cancellation of a run. Returns `true` when
    /// the request was accepted, `false` when the run had already
    /// reached a terminal status.
    pub fn request_cancel(&self, run_id: Uuid) -> Result<bool> {
        let handle = self
            .runs
            .get(&run_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::unknown_run(run_id))?;
        let accepted = handle.request_cancel();
        debug!(run_id = %run_id, accepted, "cancellation requested");
        Ok(accepted)
    }

    /// Snapshots of every tracked run, unordered.
    pub fn list_runs(&self) -> Vec<JobRun> {
        self.runs.iter().map(|entry| entry.value().snapshot()).collect()
    }

    /// Drops a finished run from tracking and returns its final record.
    /// Active runs are refused; cancel first and wait for the terminal
    /// status.
    pub fn discard_run(&self, run_id: Uuid) -> Result<JobRun> {
        let status = self
            .runs
            .get(&run_id)
            .map(|entry| entry.value().status())
            .ok_or_else(|| EngineError::unknown_run(run_id))?;
        if !status.is_terminal() {
            return Err(EngineError::RunStillActive { run_id });
        }
        self.runs
            .remove(&run_id)
            .map(|(_, handle)| handle.snapshot())
            .ok_or_else(|| EngineError::unknown_run(run_id))
    }

    /// Waits until a run reaches a terminal status and returns its final
    /// record, or fails with a timeout error.
    pub async fn wait_for_completion(&self, run_id: Uuid, timeout: Duration) -> Result<JobRun> {
        let handle = self
            .runs
            .get(&run_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::unknown_run(run_id))?;
        let mut status = handle.watch_status();
        let waited = tokio::time::timeout(timeout, status.wait_for(|s| s.is_terminal())).await;
        match waited {
            Ok(_) => Ok(handle.snapshot()),
            Err(_) => Err(EngineError::WaitTimeout {
                run_id,
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StepStatus;
    use crate::executor::CommandOutcome;
    use crate::playbook::SequenceId;
    use async_trait::async_trait;
    use serde_json::json;

    struct AlwaysSucceeds;

    #[async_trait]
    impl CommandExecutor for AlwaysSucceeds {
        async fn run_command(&self, _step: &str, command: &str) -> CommandOutcome {
            CommandOutcome::success(json!(command))
        }

        async fn run_unit(&self, _step: &str, sequence: SequenceId) -> CommandOutcome {
            CommandOutcome::success(json!(sequence.to_string()))
        }
    }

    /// Parks every call until cancellation interrupts it.
    struct Stalls;

    #[async_trait]
    impl CommandExecutor for Stalls {
        async fn run_command(&self, _step: &str, _command: &str) -> CommandOutcome {
            tokio::time::sleep(Duration::from_secs(30)).await;
            CommandOutcome::success(json!(null))
        }

        async fn run_unit(&self, _step: &str, _sequence: SequenceId) -> CommandOutcome {
            tokio::time::sleep(Duration::from_secs(30)).await;
            CommandOutcome::success(json!(null))
        }
    }

    fn control() -> RunControl {
        RunControl::with_config(Arc::new(AlwaysSucceeds), EngineConfig::for_testing())
            .expect("test config is valid")
    }

    const SIMPLE: &str = r#"
name: simple
steps:
  - type: script
    name: only
    command: "run"
"#;

    #[tokio::test]
    async fn start_runs_to_completion_and_status_is_queryable() {
        let control = control();
        let run_id = control
            .start_from_yaml(SIMPLE, HashMap::new())
            .expect("start should accept");
        let run = control
            .wait_for_completion(run_id, Duration::from_secs(5))
            .await
            .expect("run should finish");
        assert_eq!(run.status, StepStatus::Succeeded);
        assert_eq!(run.step_status("only"), Some(StepStatus::Succeeded));

        let snapshot = control.run_status(run_id).expect("still tracked");
        assert_eq!(snapshot.status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn start_rejects_cycles_before_executing() {
        let control = control();
        let err = control
            .start_from_yaml(
                r#"
name: cyclic
steps:
  - type: script
    name: a
    command: "x"
    dependsOn: [b]
  - type: script
    name: b
    command: "x"
    dependsOn: [a]
"#,
                HashMap::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("cycle"));
        assert!(control.list_runs().is_empty());
    }

    #[tokio::test]
    async fn start_by_name_requires_registration() {
        let control = control();
        let err = control
            .start_by_name("missing", HashMap::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownPlaybook { .. }));

        let playbook = Playbook::from_yaml(SIMPLE).unwrap();
        control.register_playbook(playbook).unwrap();
        let run_id = control.start_by_name("simple", HashMap::new()).unwrap();
        let run = control
            .wait_for_completion(run_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn discard_removes_finished_runs() {
        let control = control();
        let run_id = control.start_from_yaml(SIMPLE, HashMap::new()).unwrap();
        control
            .wait_for_completion(run_id, Duration::from_secs(5))
            .await
            .unwrap();

        let discarded = control.discard_run(run_id).expect("terminal run discards");
        assert_eq!(discarded.run_id, run_id);
        assert!(matches!(
            control.run_status(run_id),
            Err(EngineError::UnknownRun { .. })
        ));
        assert!(matches!(
            control.discard_run(run_id),
            Err(EngineError::UnknownRun { .. })
        ));
    }

    #[tokio::test]
    async fn discard_refuses_active_runs() {
        let control =
            RunControl::with_config(Arc::new(Stalls), EngineConfig::for_testing()).unwrap();
        let run_id = control.start_from_yaml(SIMPLE, HashMap::new()).unwrap();

        // The only step is parked inside the executor, so the run cannot
        // be terminal yet.
        assert!(matches!(
            control.discard_run(run_id),
            Err(EngineError::RunStillActive { .. })
        ));

        assert!(control.request_cancel(run_id).unwrap());
        let run = control
            .wait_for_completion(run_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, StepStatus::Cancelled);
        control.discard_run(run_id).expect("terminal run discards");
    }

    #[tokio::test]
    async fn unknown_run_queries_fail_cleanly() {
        let control = control();
        let missing = Uuid::new_v4();
        assert!(matches!(
            control.run_status(missing),
            Err(EngineError::UnknownRun { .. })
        ));
        assert!(matches!(
            control.request_cancel(missing),
            Err(EngineError::UnknownRun { .. })
        ));
    }
}
