//! # Engine Events
//!
//! Structured lifecycle events emitted while a run executes. Formatting
//! and persistence are an observer's responsibility; the engine only
//! publishes. Events are broadcast, so any number of observers can
//! subscribe, and publishing with no subscribers is a no-op rather than
//! an error.
//!
//! Events are emitted for dispatched steps only: a step marked `Skipped`
//! or `Cancelled` before it started produces no events but is fully
//! visible in run snapshots.

pub mod publisher;

pub use publisher::EventPublisher;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::status::StepStatus;

/// One structured lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: Uuid,
        playbook: String,
        at: DateTime<Utc>,
    },
    StepStarted {
        run_id: Uuid,
        step: String,
        at: DateTime<Utc>,
    },
    StepRetried {
        run_id: Uuid,
        step: String,
        /// The attempt that just failed; the next one starts after the delay.
        attempt: u32,
        delay_ms: u64,
        at: DateTime<Utc>,
    },
    StepFinished {
        run_id: Uuid,
        step: String,
        status: StepStatus,
        attempts: u32,
        at: DateTime<Utc>,
    },
    RunFinished {
        run_id: Uuid,
        playbook: String,
        status: StepStatus,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            EngineEvent::RunStarted { run_id, .. }
            | EngineEvent::StepStarted { run_id, .. }
            | EngineEvent::StepRetried { run_id, .. }
            | EngineEvent::StepFinished { run_id, .. }
            | EngineEvent::RunFinished { run_id, .. } => *run_id,
        }
    }

    /// Step name for step-scoped events, `None` for run-scoped ones.
    pub fn step(&self) -> Option<&str> {
        match self {
            EngineEvent::StepStarted { step, .. }
            | EngineEvent::StepRetried { step, .. }
            | EngineEvent::StepFinished { step, .. } => Some(step),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_a_tag() {
        let event = EngineEvent::StepFinished {
            run_id: Uuid::nil(),
            step: "build".to_string(),
            status: StepStatus::Succeeded,
            attempts: 1,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "step_finished");
        assert_eq!(json["step"], "build");
        assert_eq!(json["status"], "succeeded");
    }

    #[test]
    fn step_accessor_covers_step_scoped_events() {
        let started = EngineEvent::RunStarted {
            run_id: Uuid::nil(),
            playbook: "p".to_string(),
            at: Utc::now(),
        };
        assert_eq!(started.step(), None);
        let retried = EngineEvent::StepRetried {
            run_id: Uuid::nil(),
            step: "probe".to_string(),
            attempt: 1,
            delay_ms: 250,
            at: Utc::now(),
        };
        assert_eq!(retried.step(), Some("probe"));
    }
}
