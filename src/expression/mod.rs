//! # Expression Language
//!
//! A closed expression language for step conditions and command
//! interpolation. Conditions decide which branch of a conditional step
//! runs; `${{ ... }}` markers inside command strings are replaced at
//! dispatch time with values from the run scope.
//!
//! ## Architecture
//!
//! - **AST** ([`ast`]): literals, references, unary not, comparisons, and
//!   boolean combinators. Nothing else, so evaluation always terminates.
//! - **Parser** ([`parser`]): hand-written lexer plus recursive descent,
//!   run once at load time.
//! - **Evaluator** ([`evaluator`]): pure function from AST and [`Scope`] to
//!   a [`Value`]. No I/O, no mutation.
//! - **Templates** ([`template`]): literal/expression segmentation of
//!   command strings.
//!
//! ## Usage
//!
//! ```
//! use playbook_core::expression::{Expression, Scope, Value};
//! use std::collections::HashMap;
//!
//! let scope = Scope::new(HashMap::from([
//!     ("env".to_string(), serde_json::json!("prod")),
//! ]));
//! let expr = Expression::parse("vars.env == 'prod'").unwrap();
//! assert_eq!(expr.evaluate(&scope), Ok(Value::Bool(true)));
//! ```

pub mod ast;
pub mod evaluator;
pub mod parser;
pub mod template;

pub use ast::{BinaryOp, Expr, Value, VarRef};
pub use evaluator::Scope;
pub use template::Template;

use thiserror::Error;

/// Errors raised while parsing or evaluating expressions.
///
/// Syntax errors surface at load time; unresolved references and type
/// mismatches surface at evaluation time and are fatal for the evaluating
/// step only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("syntax error at offset {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unresolved reference `{reference}`")]
    UnresolvedReference { reference: String },

    #[error("type mismatch: `{op}` cannot combine {left} and {right}")]
    TypeMismatch {
        op: String,
        left: String,
        right: String,
    },
}

impl ExpressionError {
    pub fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            position,
            message: message.into(),
        }
    }

    pub fn unresolved(reference: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            reference: reference.into(),
        }
    }

    pub fn type_mismatch(
        op: impl Into<String>,
        left: impl Into<String>,
        right: impl Into<String>,
    ) -> Self {
        Self::TypeMismatch {
            op: op.into(),
            left: left.into(),
            right: right.into(),
        }
    }

    /// Shifts a syntax error's position by `base`, used when the expression
    /// was embedded inside a larger string such as a command template.
    pub(crate) fn offset(self, base: usize) -> Self {
        match self {
            Self::Syntax { position, message } => Self::Syntax {
                position: base + position,
                message,
            },
            other => other,
        }
    }
}

pub type ExpressionResult<T> = std::result::Result<T, ExpressionError>;

/// A parsed expression, ready for repeated evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    expr: Expr,
}

impl Expression {
    /// Parses `source` into an expression tree.
    pub fn parse(source: &str) -> ExpressionResult<Self> {
        let expr = parser::Parser::new(source)?.parse_complete()?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Evaluates against a scope. Pure: no side effects, deterministic for
    /// a given scope.
    pub fn evaluate(&self, scope: &Scope) -> ExpressionResult<Value> {
        evaluator::evaluate(&self.expr, scope)
    }

    /// Evaluates and requires a boolean result, as conditions do.
    pub fn evaluate_bool(&self, scope: &Scope) -> ExpressionResult<bool> {
        let value = self.evaluate(scope)?;
        value.as_bool().ok_or_else(|| {
            ExpressionError::type_mismatch("condition", value.type_name(), "boolean")
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    #[cfg(test)]
    pub(crate) fn into_expr(self) -> Expr {
        self.expr
    }
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}
