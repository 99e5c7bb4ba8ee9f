//! # Playbook Data Model
//!
//! Typed, closed model of a playbook document. Steps form a tagged union
//! over the four variants the engine knows how to run; every consumer
//! matches exhaustively, so adding a variant is a compile-time event, not
//! a runtime surprise.
//!
//! A playbook is immutable once loaded. The loader (see
//! [`super::loader`]) is the only constructor used in production paths;
//! tests build models directly.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Four-digit identifier of an externally numbered automation unit.
///
/// Accepts both numeric (`420`) and string (`"0420"`) forms in playbook
/// documents; displays zero-padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceId(u16);

impl SequenceId {
    pub const MAX: u16 = 9999;

    pub fn new(raw: u16) -> Option<Self> {
        (raw <= Self::MAX).then_some(Self(raw))
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

impl FromStr for SequenceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid sequence id `{s}`: expected up to 4 digits"));
        }
        let raw: u32 = s
            .parse()
            .map_err(|_| format!("invalid sequence id `{s}`"))?;
        u16::try_from(raw)
            .ok()
            .and_then(SequenceId::new)
            .ok_or_else(|| format!("sequence id {raw} is out of range [0, {}]", Self::MAX))
    }
}

impl Serialize for SequenceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SequenceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SequenceVisitor;

        impl Visitor<'_> for SequenceVisitor {
            type Value = SequenceId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a sequence id in [0, 9999] as a number or digit string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<SequenceId, E> {
                u16::try_from(v)
                    .ok()
                    .and_then(SequenceId::new)
                    .ok_or_else(|| E::custom(format!("sequence id {v} is out of range")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<SequenceId, E> {
                u64::try_from(v)
                    .map_err(|_| E::custom(format!("sequence id {v} is out of range")))
                    .and_then(|v| self.visit_u64(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<SequenceId, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SequenceVisitor)
    }
}

/// One entry in a `dependsOn` list: a step name or a unit sequence id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependencyRef {
    Name(String),
    Sequence(SequenceId),
}

impl fmt::Display for DependencyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyRef::Name(name) => f.write_str(name),
            DependencyRef::Sequence(seq) => write!(f, "{seq}"),
        }
    }
}

impl Serialize for DependencyRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DependencyRef::Name(name) => serializer.serialize_str(name),
            DependencyRef::Sequence(seq) => serializer.serialize_str(&seq.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for DependencyRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RefVisitor;

        impl Visitor<'_> for RefVisitor {
            type Value = DependencyRef;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a step name or a numeric sequence id")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<DependencyRef, E> {
                u16::try_from(v)
                    .ok()
                    .and_then(SequenceId::new)
                    .map(DependencyRef::Sequence)
                    .ok_or_else(|| E::custom(format!("sequence id {v} is out of range")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<DependencyRef, E> {
                u64::try_from(v)
                    .map_err(|_| E::custom(format!("sequence id {v} is out of range")))
                    .and_then(|v| self.visit_u64(v))
            }

            // String deps stay names even when they look numeric; the
            // resolver falls back to sequence lookup when no step name
            // matches, so `"0420"` works either way.
            fn visit_str<E: de::Error>(self, v: &str) -> Result<DependencyRef, E> {
                Ok(DependencyRef::Name(v.to_string()))
            }
        }

        deserializer.deserialize_any(RefVisitor)
    }
}

/// Backoff and attempt limits for leaf steps.
///
/// `max_attempts` counts total attempts, not retries after the first; the
/// default of 1 means a single attempt with no retry. `timeout_ms`, when
/// set, bounds each attempt and records a timeout as a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub timeout_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
            timeout_ms: None,
        }
    }
}

impl RetryPolicy {
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_ms.map(std::time::Duration::from_millis)
    }
}

/// How a parallel group reacts to a failing child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    /// First child failure cancels the siblings still running.
    #[default]
    FailFast,
    /// All children run to completion; the group fails if any child failed.
    CollectAll,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::FailFast => f.write_str("failFast"),
            FailurePolicy::CollectAll => f.write_str("collectAll"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptStep {
    pub name: String,
    /// Opaque command payload, possibly containing `${{ ... }}` markers.
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependencyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalStep {
    pub name: String,
    /// Boolean expression deciding which branch runs.
    pub condition: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub then_steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub else_steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependencyRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelGroup {
    pub name: String,
    pub children: Vec<Step>,
    /// Max concurrent children; defaults from engine configuration and is
    /// always clamped to the configured ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<usize>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependencyRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitRefStep {
    pub name: String,
    pub sequence: SequenceId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependencyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub continue_on_error: bool,
}

/// A playbook step. The `type` discriminator in the source document picks
/// the variant: `script`, `conditional`, `parallel`, or `unitRef`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Step {
    #[serde(rename = "script")]
    Script(ScriptStep),
    #[serde(rename = "conditional")]
    Conditional(ConditionalStep),
    #[serde(rename = "parallel")]
    Parallel(ParallelGroup),
    #[serde(rename = "unitRef")]
    UnitRef(UnitRefStep),
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::Script(s) => &s.name,
            Step::Conditional(s) => &s.name,
            Step::Parallel(s) => &s.name,
            Step::UnitRef(s) => &s.name,
        }
    }

    pub fn depends_on(&self) -> &[DependencyRef] {
        match self {
            Step::Script(s) => &s.depends_on,
            Step::Conditional(s) => &s.depends_on,
            Step::Parallel(s) => &s.depends_on,
            Step::UnitRef(s) => &s.depends_on,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Step::Script(_) => "script",
            Step::Conditional(_) => "conditional",
            Step::Parallel(_) => "parallel",
            Step::UnitRef(_) => "unitRef",
        }
    }

    /// Direct nested steps: branch members for conditionals, children for
    /// parallel groups, empty for leaves.
    pub fn nested(&self) -> Vec<&Step> {
        match self {
            Step::Conditional(c) => c.then_steps.iter().chain(c.else_steps.iter()).collect(),
            Step::Parallel(p) => p.children.iter().collect(),
            _ => Vec::new(),
        }
    }
}

/// A loaded playbook. Immutable after validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playbook {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Default variables, shadowed by the initial variables a caller
    /// supplies at start time.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, Json>,
    pub steps: Vec<Step>,
    /// Names of prerequisites satisfied outside this playbook. Depending
    /// on an external imposes no ordering edge.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub externals: Vec<String>,
}

impl Playbook {
    /// Looks up a top-level step by name.
    pub fn top_level(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name() == name)
    }

    /// All steps in document order, nested ones included (preorder).
    pub fn all_steps(&self) -> Vec<&Step> {
        let mut out = Vec::new();
        let mut stack: Vec<&Step> = self.steps.iter().rev().collect();
        while let Some(step) = stack.pop() {
            out.push(step);
            for nested in step.nested().into_iter().rev() {
                stack.push(nested);
            }
        }
        out
    }

    /// Map from each step name (any depth) to its enclosing top-level
    /// step's name. Top-level steps map to themselves.
    pub fn top_level_ancestors(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        for top in &self.steps {
            let mut stack = vec![top];
            while let Some(step) = stack.pop() {
                out.insert(step.name().to_string(), top.name().to_string());
                stack.extend(step.nested());
            }
        }
        out
    }

    /// All unit references in document order, any depth.
    pub fn unit_refs(&self) -> Vec<&UnitRefStep> {
        self.all_steps()
            .into_iter()
            .filter_map(|s| match s {
                Step::UnitRef(u) => Some(u),
                _ => None,
            })
            .collect()
    }
}
