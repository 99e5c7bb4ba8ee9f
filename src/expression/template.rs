//! Command-string interpolation.
//!
//! Command fields may embed expressions inside `${{ ... }}` markers. The
//! template is split into literal and expression segments at load time so
//! that malformed markers are rejected before a run starts; rendering at
//! dispatch time only evaluates and concatenates.

use std::fmt;

use super::evaluator::Scope;
use super::{Expression, ExpressionError};

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Expr(Expression),
}

/// A parsed command template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parses a template, validating every embedded expression.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;
        while let Some(open) = rest.find("${{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after_open = &rest[open + 3..];
            let close = after_open.find("}}").ok_or_else(|| {
                ExpressionError::syntax(offset + open, "unterminated `${{` marker")
            })?;
            let inner = &after_open[..close];
            let expr = Expression::parse(inner).map_err(|err| err.offset(offset + open + 3))?;
            segments.push(Segment::Expr(expr));
            let consumed = open + 3 + close + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Renders the template against a scope. Any embedded expression error
    /// (most commonly an unresolved reference) aborts the render.
    pub fn render(&self, scope: &Scope) -> Result<String, ExpressionError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expr(expr) => {
                    let value = expr.evaluate(scope)?;
                    out.push_str(&value.to_string());
                }
            }
        }
        Ok(out)
    }

    /// The raw template text as written in the playbook.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the template contains no embedded expressions.
    pub fn is_literal(&self) -> bool {
        !self
            .segments
            .iter()
            .any(|s| matches!(s, Segment::Expr(_)))
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
