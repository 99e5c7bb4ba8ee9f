//! # Playbook Loader
//!
//! Parses YAML or JSON playbook documents into the typed model and
//! validates structural well-formedness before anything executes:
//!
//! - playbook and step names are non-empty, step names unique at any depth
//! - every parallel group has at least one child
//! - every condition and command template parses (syntax only; free
//!   variables are a run-time concern since they may be populated by
//!   earlier steps)
//!
//! Dependency existence and acyclicity are the resolver's job; the loader
//! guarantees only that the document's own shape is sound. A playbook that
//! fails any check here never begins executing.

use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::expression::{Expression, ExpressionError, Template};

use super::model::{Playbook, Step};

/// Errors raised while parsing or validating a playbook document.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to parse YAML playbook: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse JSON playbook: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read playbook file: {0}")]
    Io(#[from] std::io::Error),

    #[error("playbook name must not be empty")]
    EmptyPlaybookName,

    #[error("a step in playbook `{playbook}` has an empty name")]
    EmptyStepName { playbook: String },

    #[error("duplicate step name `{step}`")]
    DuplicateStepName { step: String },

    #[error("parallel group `{step}` has no children")]
    EmptyParallelGroup { step: String },

    #[error("invalid condition in step `{step}`: {source}")]
    InvalidCondition {
        step: String,
        #[source]
        source: ExpressionError,
    },

    #[error("invalid command in step `{step}`: {source}")]
    InvalidCommand {
        step: String,
        #[source]
        source: ExpressionError,
    },
}

impl LoadError {
    pub fn duplicate_step(step: impl Into<String>) -> Self {
        Self::DuplicateStepName { step: step.into() }
    }

    pub fn empty_parallel_group(step: impl Into<String>) -> Self {
        Self::EmptyParallelGroup { step: step.into() }
    }
}

pub type LoadResult<T> = std::result::Result<T, LoadError>;

impl Playbook {
    /// Parses and validates a YAML playbook document.
    pub fn from_yaml(source: &str) -> LoadResult<Self> {
        let playbook: Playbook = serde_yaml::from_str(source)?;
        playbook.validate()?;
        debug!(
            playbook = %playbook.name,
            steps = playbook.steps.len(),
            "loaded playbook from YAML"
        );
        Ok(playbook)
    }

    /// Parses and validates a JSON playbook document.
    pub fn from_json(source: &str) -> LoadResult<Self> {
        let playbook: Playbook = serde_json::from_str(source)?;
        playbook.validate()?;
        debug!(
            playbook = %playbook.name,
            steps = playbook.steps.len(),
            "loaded playbook from JSON"
        );
        Ok(playbook)
    }

    /// Loads a playbook from a file, dispatching on the extension
    /// (`.json` parses as JSON, anything else as YAML).
    pub fn from_file(path: impl AsRef<Path>) -> LoadResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    /// Structural validation of the loaded model. Called by every `from_*`
    /// constructor; public so hand-built playbooks can be checked too.
    pub fn validate(&self) -> LoadResult<()> {
        if self.name.trim().is_empty() {
            return Err(LoadError::EmptyPlaybookName);
        }

        let mut seen = HashSet::new();
        for step in self.all_steps() {
            let name = step.name();
            if name.trim().is_empty() {
                return Err(LoadError::EmptyStepName {
                    playbook: self.name.clone(),
                });
            }
            if !seen.insert(name.to_string()) {
                return Err(LoadError::duplicate_step(name));
            }
            self.validate_step(step)?;
        }
        Ok(())
    }

    fn validate_step(&self, step: &Step) -> LoadResult<()> {
        match step {
            Step::Script(script) => {
                Template::parse(&script.command).map_err(|source| LoadError::InvalidCommand {
                    step: script.name.clone(),
                    source,
                })?;
            }
            Step::Conditional(cond) => {
                Expression::parse(&cond.condition).map_err(|source| {
                    LoadError::InvalidCondition {
                        step: cond.name.clone(),
                        source,
                    }
                })?;
            }
            Step::Parallel(group) => {
                if group.children.is_empty() {
                    return Err(LoadError::empty_parallel_group(&group.name));
                }
            }
            Step::UnitRef(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_YAML: &str = r#"
name: patch-fleet
description: Apply security patches across the fleet
variables:
  env: staging
steps:
  - type: script
    name: inventory
    command: "fleet list --env ${{ vars.env }}"
  - type: conditional
    name: gate
    condition: "vars.env == 'prod'"
    dependsOn: [inventory]
    thenSteps:
      - type: script
        name: notify
        command: "notify oncall"
    elseSteps:
      - type: script
        name: log-only
        command: "echo staging run"
  - type: parallel
    name: patch
    dependsOn: [gate]
    throttle: 2
    failurePolicy: collectAll
    children:
      - type: unitRef
        name: patch-web
        sequence: 410
      - type: unitRef
        name: patch-db
        sequence: 411
externals:
  - change-window-open
"#;

    #[test]
    fn loads_a_valid_yaml_playbook() {
        let playbook = Playbook::from_yaml(VALID_YAML).unwrap();
        assert_eq!(playbook.name, "patch-fleet");
        assert_eq!(playbook.steps.len(), 3);
        assert_eq!(playbook.externals, vec!["change-window-open"]);
        assert_eq!(playbook.unit_refs().len(), 2);
    }

    #[test]
    fn loads_the_same_playbook_from_json() {
        let yaml = Playbook::from_yaml(VALID_YAML).unwrap();
        let json = serde_json::to_string(&yaml).unwrap();
        let reloaded = Playbook::from_json(&json).unwrap();
        assert_eq!(yaml, reloaded);
    }

    #[test]
    fn rejects_malformed_documents() {
        let err = Playbook::from_yaml("steps: [").unwrap_err();
        assert!(matches!(err, LoadError::Yaml(_)));
        let err = Playbook::from_json("{\"name\":").unwrap_err();
        assert!(matches!(err, LoadError::Json(_)));
    }

    #[test]
    fn rejects_empty_playbook_name() {
        let err = Playbook::from_yaml("name: \"  \"\nsteps: []").unwrap_err();
        assert!(matches!(err, LoadError::EmptyPlaybookName));
    }

    #[test]
    fn rejects_duplicate_step_names_across_nesting() {
        let yaml = r#"
name: dupes
steps:
  - type: script
    name: build
    command: "make"
  - type: conditional
    name: gate
    condition: "true"
    thenSteps:
      - type: script
        name: build
        command: "make again"
"#;
        let err = Playbook::from_yaml(yaml).unwrap_err();
        match err {
            LoadError::DuplicateStepName { step } => assert_eq!(step, "build"),
            other => panic!("expected duplicate step error, got {other}"),
        }
    }

    #[test]
    fn rejects_empty_parallel_group() {
        let yaml = r#"
name: empty-group
steps:
  - type: parallel
    name: fan-out
    children: []
"#;
        let err = Playbook::from_yaml(yaml).unwrap_err();
        match err {
            LoadError::EmptyParallelGroup { step } => assert_eq!(step, "fan-out"),
            other => panic!("expected empty group error, got {other}"),
        }
    }

    #[test]
    fn rejects_malformed_condition_at_load_time() {
        let yaml = r#"
name: bad-condition
steps:
  - type: conditional
    name: gate
    condition: "vars.env =="
    thenSteps:
      - type: script
        name: noop
        command: "true"
"#;
        let err = Playbook::from_yaml(yaml).unwrap_err();
        match err {
            LoadError::InvalidCondition { step, .. } => assert_eq!(step, "gate"),
            other => panic!("expected condition error, got {other}"),
        }
    }

    #[test]
    fn rejects_malformed_command_template_at_load_time() {
        let yaml = r#"
name: bad-command
steps:
  - type: script
    name: deploy
    command: "deploy ${{ vars.region"
"#;
        let err = Playbook::from_yaml(yaml).unwrap_err();
        match err {
            LoadError::InvalidCommand { step, .. } => assert_eq!(step, "deploy"),
            other => panic!("expected command error, got {other}"),
        }
    }

    #[test]
    fn free_variables_are_not_checked_at_load_time() {
        let yaml = r#"
name: free-vars
steps:
  - type: script
    name: deploy
    command: "deploy ${{ vars.populated_later }}"
"#;
        assert!(Playbook::from_yaml(yaml).is_ok());
    }

    #[test]
    fn from_file_dispatches_on_extension() {
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.path().join("playbook.yaml");
        std::fs::write(&yaml_path, VALID_YAML).unwrap();
        let from_yaml = Playbook::from_file(&yaml_path).unwrap();

        let json_path = dir.path().join("playbook.json");
        std::fs::write(&json_path, serde_json::to_string(&from_yaml).unwrap()).unwrap();
        let from_json = Playbook::from_file(&json_path).unwrap();
        assert_eq!(from_yaml, from_json);
    }
}
