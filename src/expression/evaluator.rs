//! Pure evaluation of parsed expressions against a read-only scope.
//!
//! Evaluation never performs I/O and never mutates the scope, so the same
//! expression and scope always produce the same result. Unresolved
//! references and type mismatches surface as errors rather than defaulting,
//! which keeps condition bugs loud instead of silently false.

use std::collections::HashMap;

use serde_json::Value as Json;

use super::ast::{BinaryOp, Expr, Value, VarRef};
use super::ExpressionError;

/// Read-only evaluation scope: run variables plus the outputs of steps that
/// have already succeeded. Workers receive an immutable snapshot, so holding
/// one across an await point is always safe.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: HashMap<String, Json>,
    step_outputs: HashMap<String, Json>,
}

impl Scope {
    pub fn new(vars: HashMap<String, Json>) -> Self {
        Self {
            vars,
            step_outputs: HashMap::new(),
        }
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: Json) {
        self.vars.insert(name.into(), value);
    }

    /// Records a step output. Only succeeded steps are merged in; a failed
    /// step's output stays absent so references to it fail visibly.
    pub fn set_step_output(&mut self, step: impl Into<String>, output: Json) {
        self.step_outputs.insert(step.into(), output);
    }

    pub fn var(&self, name: &str) -> Option<&Json> {
        self.vars.get(name)
    }

    pub fn step_output(&self, step: &str) -> Option<&Json> {
        self.step_outputs.get(step)
    }

    pub fn vars(&self) -> &HashMap<String, Json> {
        &self.vars
    }
}

/// Resolves a reference against the scope.
fn resolve(reference: &VarRef, scope: &Scope) -> Result<Value, ExpressionError> {
    match reference {
        VarRef::Var(name) => scope
            .var(name)
            .map(Value::from_json)
            .ok_or_else(|| ExpressionError::unresolved(reference.to_string())),
        VarRef::StepOutput(step) => scope
            .step_output(step)
            .map(Value::from_json)
            .ok_or_else(|| ExpressionError::unresolved(reference.to_string())),
    }
}

pub(super) fn evaluate(expr: &Expr, scope: &Scope) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Reference(reference) => resolve(reference, scope),
        Expr::Not(inner) => {
            let value = evaluate(inner, scope)?;
            match value {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(ExpressionError::type_mismatch(
                    "!",
                    other.type_name(),
                    "boolean",
                )),
            }
        }
        Expr::Binary { op, left, right } => match op {
            BinaryOp::And | BinaryOp::Or => evaluate_logical(*op, left, right, scope),
            _ => {
                let lhs = evaluate(left, scope)?;
                let rhs = evaluate(right, scope)?;
                compare(*op, &lhs, &rhs)
            }
        },
    }
}

/// `&&` and `||` short-circuit: the right side is not evaluated (and so
/// cannot raise an unresolved-reference error) when the left side decides.
fn evaluate_logical(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    scope: &Scope,
) -> Result<Value, ExpressionError> {
    let lhs = evaluate(left, scope)?;
    let lhs = lhs.as_bool().ok_or_else(|| {
        ExpressionError::type_mismatch(op.symbol(), lhs.type_name(), "boolean")
    })?;
    match (op, lhs) {
        (BinaryOp::And, false) => return Ok(Value::Bool(false)),
        (BinaryOp::Or, true) => return Ok(Value::Bool(true)),
        _ => {}
    }
    let rhs = evaluate(right, scope)?;
    let rhs = rhs.as_bool().ok_or_else(|| {
        ExpressionError::type_mismatch(op.symbol(), rhs.type_name(), "boolean")
    })?;
    Ok(Value::Bool(rhs))
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExpressionError> {
    let result = match (op, lhs, rhs) {
        (BinaryOp::Eq, Value::Null, Value::Null) => true,
        (BinaryOp::Ne, Value::Null, Value::Null) => false,
        (BinaryOp::Eq, Value::Bool(a), Value::Bool(b)) => a == b,
        (BinaryOp::Ne, Value::Bool(a), Value::Bool(b)) => a != b,
        (BinaryOp::Eq, Value::Number(a), Value::Number(b)) => a == b,
        (BinaryOp::Ne, Value::Number(a), Value::Number(b)) => a != b,
        (BinaryOp::Lt, Value::Number(a), Value::Number(b)) => a < b,
        (BinaryOp::Le, Value::Number(a), Value::Number(b)) => a <= b,
        (BinaryOp::Gt, Value::Number(a), Value::Number(b)) => a > b,
        (BinaryOp::Ge, Value::Number(a), Value::Number(b)) => a >= b,
        (BinaryOp::Eq, Value::Str(a), Value::Str(b)) => a == b,
        (BinaryOp::Ne, Value::Str(a), Value::Str(b)) => a != b,
        (BinaryOp::Lt, Value::Str(a), Value::Str(b)) => a < b,
        (BinaryOp::Le, Value::Str(a), Value::Str(b)) => a <= b,
        (BinaryOp::Gt, Value::Str(a), Value::Str(b)) => a > b,
        (BinaryOp::Ge, Value::Str(a), Value::Str(b)) => a >= b,
        _ => {
            return Err(ExpressionError::type_mismatch(
                op.symbol(),
                lhs.type_name(),
                rhs.type_name(),
            ));
        }
    };
    Ok(Value::Bool(result))
}
