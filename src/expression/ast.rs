//! Abstract syntax tree for the condition and interpolation language.
//!
//! The language is intentionally closed: literals, `vars.<name>` /
//! `steps.<name>.output` references, comparisons, and boolean combinators.
//! There are no loops, no function calls, and no user-defined bindings, so
//! evaluation always terminates in time proportional to the tree size.

use std::fmt;

/// A value produced by evaluating an expression.
///
/// Step outputs arrive as `serde_json::Value`; structured outputs (arrays,
/// objects) are carried as their canonical JSON text so the comparison rules
/// stay closed over the four scalar shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Value {
    /// Bridge from a JSON value in the evaluation scope.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::Str(s.clone()),
            other => Value::Str(other.to_string()),
        }
    }

    /// Human-readable name of the value's type, used in mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
        }
    }

    /// Truthiness for condition results: only booleans are accepted, so this
    /// is used exclusively after the evaluator has checked the type.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{n}")
                }
            }
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

/// A variable reference, one of the two forms the grammar admits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarRef {
    /// `vars.<name>`
    Var(String),
    /// `steps.<name>.output`
    StepOutput(String),
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarRef::Var(name) => write!(f, "vars.{name}"),
            VarRef::StepOutput(name) => write!(f, "steps.{name}.output"),
        }
    }
}

/// Comparison and boolean operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// Expression tree. Evaluation is a pure function over a [`super::Scope`].
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Reference(VarRef),
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_from_json_scalars() {
        assert_eq!(Value::from_json(&serde_json::json!(null)), Value::Null);
        assert_eq!(Value::from_json(&serde_json::json!(true)), Value::Bool(true));
        assert_eq!(Value::from_json(&serde_json::json!(3.5)), Value::Number(3.5));
        assert_eq!(
            Value::from_json(&serde_json::json!("ok")),
            Value::Str("ok".to_string())
        );
    }

    #[test]
    fn value_from_json_structured_becomes_text() {
        let v = Value::from_json(&serde_json::json!({"a": 1}));
        assert_eq!(v, Value::Str("{\"a\":1}".to_string()));
    }

    #[test]
    fn display_renders_integers_without_fraction() {
        assert_eq!(Value::Number(4.0).to_string(), "4");
        assert_eq!(Value::Number(4.5).to_string(), "4.5");
    }
}
