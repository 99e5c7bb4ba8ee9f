//! # Step and Run Status
//!
//! One status enum shared by steps and runs, with the lifecycle:
//!
//! ```text
//! Pending → Running → {Succeeded, Failed, Skipped, Cancelled}
//! ```
//!
//! `Skipped` is terminal for steps on an untaken conditional branch and
//! for dependents of a hard-failed step; `Cancelled` is terminal for steps
//! that had not started (or were stopped) when cancellation was observed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Status of a step or of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether a dependent of a step in this status may be dispatched.
    /// Only success satisfies; skipped and cancelled dependencies
    /// propagate their non-execution downstream.
    pub fn satisfies_dependencies(&self) -> bool {
        matches!(self, StepStatus::Succeeded)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "succeeded" => Ok(StepStatus::Succeeded),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            "cancelled" => Ok(StepStatus::Cancelled),
            _ => Err(format!("invalid step status: {s}")),
        }
    }
}

/// Outcome of one step, recorded once and queryable for the lifetime of
/// the run. `error` is present exactly when the status is `Failed`;
/// `attempts` counts executor attempts actually made, so a skipped or
/// never-started step reports zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default)]
    pub output: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            output: Json::Null,
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn running(started_at: DateTime<Utc>) -> Self {
        Self {
            status: StepStatus::Running,
            started_at: Some(started_at),
            ..Self::pending()
        }
    }

    pub fn succeeded(output: Json, attempts: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            status: StepStatus::Succeeded,
            output,
            attempts,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            ..Self::pending()
        }
    }

    pub fn failed(error: impl Into<String>, attempts: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            status: StepStatus::Failed,
            error: Some(error.into()),
            attempts,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            ..Self::pending()
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            ..Self::pending()
        }
    }

    pub fn cancelled(attempts: u32, started_at: Option<DateTime<Utc>>) -> Self {
        Self {
            status: StepStatus::Cancelled,
            attempts,
            started_at,
            finished_at: started_at.map(|_| Utc::now()),
            ..Self::pending()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
