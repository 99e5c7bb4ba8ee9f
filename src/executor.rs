//! # External Executor Seam
//!
//! The engine never runs commands itself. Every script command and every
//! numbered automation unit goes through a [`CommandExecutor`], an opaque,
//! potentially slow, potentially side-effecting collaborator. The engine
//! does not inspect its internals and does not kill it; forceful
//! termination of the underlying process, if wanted, belongs to the
//! executor implementation.
//!
//! Failures are in-band: a non-zero exit code or a populated `error` field
//! marks the attempt failed and drives the retry policy.
//!
//! [`ShellExecutor`] is the batteries-included implementation: it spawns
//! interpolated commands through the system shell and waits for them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

use crate::playbook::SequenceId;

/// What came back from one executor attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub exit_code: i32,
    #[serde(default)]
    pub output: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn success(output: Json) -> Self {
        Self {
            exit_code: 0,
            output,
            error: None,
        }
    }

    pub fn failure(exit_code: i32, error: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: Json::Null,
            error: Some(error.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }

    /// Message recorded on the failed step when this outcome was the last
    /// attempt.
    pub fn failure_message(&self) -> String {
        match &self.error {
            Some(error) => error.clone(),
            None => format!("exit code {}", self.exit_code),
        }
    }
}

/// External execution collaborator.
///
/// Implementations must be cheap to share behind an `Arc` and safe to
/// call concurrently; the engine bounds concurrency on its side.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs an already-interpolated script command.
    async fn run_command(&self, step: &str, command: &str) -> CommandOutcome;

    /// Runs an externally numbered automation unit.
    async fn run_unit(&self, step: &str, sequence: SequenceId) -> CommandOutcome;
}

/// Runs script commands through the system shell (`sh -c`), capturing
/// stdout as the step output. Stdout that parses as JSON becomes
/// structured output; anything else is kept as a trimmed string.
///
/// Automation units are dispatched as `<unit_command> <sequence>`, for
/// installations that expose their numbered units behind a single
/// launcher binary.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    unit_command: String,
}

impl ShellExecutor {
    pub fn new(shell: impl Into<String>, unit_command: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            unit_command: unit_command.into(),
        }
    }

    async fn run(&self, step: &str, program: &str, args: &[&str]) -> CommandOutcome {
        debug!(step, program, "spawning external command");
        let output = match tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                return CommandOutcome::failure(-1, format!("failed to spawn `{program}`: {err}"))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            let message = if detail.is_empty() {
                format!("exit code {exit_code}")
            } else {
                format!("exit code {exit_code}: {detail}")
            };
            return CommandOutcome::failure(exit_code, message);
        }

        let parsed = serde_json::from_str::<Json>(stdout.trim())
            .unwrap_or_else(|_| Json::String(stdout.trim().to_string()));
        CommandOutcome::success(parsed)
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new("sh", "run-unit")
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run_command(&self, step: &str, command: &str) -> CommandOutcome {
        self.run(step, &self.shell, &["-c", command]).await
    }

    async fn run_unit(&self, step: &str, sequence: SequenceId) -> CommandOutcome {
        let sequence = sequence.to_string();
        self.run(step, &self.unit_command, &[&sequence]).await
    }
}
