#![allow(clippy::doc_markdown)] // Allow technical terms like YAML, JSON in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Playbook Core
//!
//! Orchestration engine for declarative playbooks: ordered collections of
//! script, conditional, and parallel steps, some referencing externally
//! numbered automation units, executed with dependency ordering, variable
//! interpolation, retries, and cooperative cancellation.
//!
//! ## Overview
//!
//! A playbook is loaded from YAML or JSON, its step dependencies are
//! resolved into ready groups (steps whose prerequisites are all
//! satisfied), and a per-run coordinator walks the groups in order,
//! dispatching members concurrently onto the async runtime. Actual
//! command execution stays behind the [`executor::CommandExecutor`] seam,
//! so the engine is testable without touching a shell.
//!
//! ## Architecture
//!
//! ```text
//! Loader (playbook) → Resolver (plan) → Execution Engine → Run Control API
//!                          ↑ consults
//!                     Expression Evaluator (conditions, ${{ }} templates)
//! ```
//!
//! ## Module Organization
//!
//! - [`playbook`] - Typed playbook model, YAML/JSON loading, validation
//! - [`resolver`] - Dependency graph, cycle detection, ready groups
//! - [`expression`] - Condition and interpolation expression language
//! - [`engine`] - Run state, cancellation, retries, step dispatch
//! - [`events`] - Broadcast stream of run and step lifecycle events
//! - [`executor`] - External executor seam and the shell implementation
//! - [`control`] - Run Control API: start, status, cancel, discard
//! - [`config`] - Engine tuning knobs with environment overrides
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use playbook_core::{RunControl, ShellExecutor};
//!
//! # async fn example() -> playbook_core::Result<()> {
//! playbook_core::logging::init_structured_logging();
//!
//! let control = RunControl::new(Arc::new(ShellExecutor::default()));
//! let run_id = control.start_from_yaml(
//!     r#"
//! name: release
//! steps:
//!   - type: script
//!     name: build
//!     command: "make build"
//!   - type: script
//!     name: publish
//!     command: "make publish"
//!     dependsOn: [build]
//! "#,
//!     HashMap::new(),
//! )?;
//!
//! let run = control
//!     .wait_for_completion(run_id, Duration::from_secs(300))
//!     .await?;
//! println!("{} finished: {}", run.playbook_name, run.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod expression;
pub mod logging;
pub mod playbook;
pub mod resolver;

pub use config::EngineConfig;
pub use control::RunControl;
pub use engine::{CancelToken, JobRun, StepResult, StepStatus};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventPublisher};
pub use executor::{CommandExecutor, CommandOutcome, ShellExecutor};
pub use playbook::{Playbook, Step};
pub use resolver::ExecutionPlan;
