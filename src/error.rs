//! Crate-level error type and result alias.
//!
//! Component errors (`LoadError`, `ResolveError`, `ExpressionError`) keep
//! their own types at module boundaries; this umbrella wraps them where a
//! single error surface is more convenient, chiefly the run control API.

use thiserror::Error;
use uuid::Uuid;

use crate::expression::ExpressionError;
use crate::playbook::LoadError;
use crate::resolver::ResolveError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("unknown playbook `{name}`")]
    UnknownPlaybook { name: String },

    #[error("unknown run {run_id}")]
    UnknownRun { run_id: Uuid },

    #[error("run {run_id} is still active and cannot be discarded")]
    RunStillActive { run_id: Uuid },

    #[error("timed out after {waited_ms}ms waiting for run {run_id}")]
    WaitTimeout { run_id: Uuid, waited_ms: u64 },

    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl EngineError {
    pub fn unknown_playbook(name: impl Into<String>) -> Self {
        Self::UnknownPlaybook { name: name.into() }
    }

    pub fn unknown_run(run_id: Uuid) -> Self {
        Self::UnknownRun { run_id }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_errors_convert_transparently() {
        let resolve = ResolveError::Cycle {
            cycle: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        let wrapped: EngineError = resolve.into();
        assert_eq!(wrapped.to_string(), "dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn messages_name_the_subject() {
        let run_id = Uuid::nil();
        assert!(EngineError::unknown_run(run_id).to_string().contains(&run_id.to_string()));
        assert!(EngineError::unknown_playbook("deploy")
            .to_string()
            .contains("deploy"));
    }
}
