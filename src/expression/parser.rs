//! # Expression Parser
//!
//! Hand-written lexer and recursive-descent parser for the condition
//! language. The grammar is small enough that a parser generator would be
//! more weight than win:
//!
//! ```text
//! expr        := or_expr
//! or_expr     := and_expr ( "||" and_expr )*
//! and_expr    := cmp_expr ( "&&" cmp_expr )*
//! cmp_expr    := unary_expr ( ("==" | "!=" | "<" | "<=" | ">" | ">=") unary_expr )?
//! unary_expr  := "!" unary_expr | primary
//! primary     := literal | reference | "(" expr ")"
//! reference   := "vars" "." ident | "steps" "." ident "." "output"
//! literal     := string | number | "true" | "false" | "null"
//! ```
//!
//! Comparison is non-associative: `a == b == c` is a syntax error rather
//! than a surprising chain.

use super::ast::{BinaryOp, Expr, Value, VarRef};
use super::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Number(f64),
    Ident(String),
    Dot,
    LParen,
    RParen,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Str(s) => format!("string {s:?}"),
            Token::Number(n) => format!("number {n}"),
            Token::Ident(name) => format!("identifier `{name}`"),
            Token::Dot => "`.`".to_string(),
            Token::LParen => "`(`".to_string(),
            Token::RParen => "`)`".to_string(),
            Token::Bang => "`!`".to_string(),
            Token::EqEq => "`==`".to_string(),
            Token::NotEq => "`!=`".to_string(),
            Token::Lt => "`<`".to_string(),
            Token::Le => "`<=`".to_string(),
            Token::Gt => "`>`".to_string(),
            Token::Ge => "`>=`".to_string(),
            Token::AndAnd => "`&&`".to_string(),
            Token::OrOr => "`||`".to_string(),
        }
    }
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn tokenize(mut self) -> Result<Vec<(usize, Token)>, ExpressionError> {
        let mut tokens = Vec::new();
        while let Some(&byte) = self.src.get(self.pos) {
            let start = self.pos;
            match byte {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.pos += 1;
                }
                b'.' => {
                    self.pos += 1;
                    tokens.push((start, Token::Dot));
                }
                b'(' => {
                    self.pos += 1;
                    tokens.push((start, Token::LParen));
                }
                b')' => {
                    self.pos += 1;
                    tokens.push((start, Token::RParen));
                }
                b'=' => {
                    if self.src.get(self.pos + 1) == Some(&b'=') {
                        self.pos += 2;
                        tokens.push((start, Token::EqEq));
                    } else {
                        return Err(ExpressionError::syntax(start, "expected `==`"));
                    }
                }
                b'!' => {
                    if self.src.get(self.pos + 1) == Some(&b'=') {
                        self.pos += 2;
                        tokens.push((start, Token::NotEq));
                    } else {
                        self.pos += 1;
                        tokens.push((start, Token::Bang));
                    }
                }
                b'<' => {
                    if self.src.get(self.pos + 1) == Some(&b'=') {
                        self.pos += 2;
                        tokens.push((start, Token::Le));
                    } else {
                        self.pos += 1;
                        tokens.push((start, Token::Lt));
                    }
                }
                b'>' => {
                    if self.src.get(self.pos + 1) == Some(&b'=') {
                        self.pos += 2;
                        tokens.push((start, Token::Ge));
                    } else {
                        self.pos += 1;
                        tokens.push((start, Token::Gt));
                    }
                }
                b'&' => {
                    if self.src.get(self.pos + 1) == Some(&b'&') {
                        self.pos += 2;
                        tokens.push((start, Token::AndAnd));
                    } else {
                        return Err(ExpressionError::syntax(start, "expected `&&`"));
                    }
                }
                b'|' => {
                    if self.src.get(self.pos + 1) == Some(&b'|') {
                        self.pos += 2;
                        tokens.push((start, Token::OrOr));
                    } else {
                        return Err(ExpressionError::syntax(start, "expected `||`"));
                    }
                }
                b'\'' | b'"' => {
                    let token = self.lex_string(byte)?;
                    tokens.push((start, token));
                }
                b'0'..=b'9' => {
                    let token = self.lex_number(false)?;
                    tokens.push((start, token));
                }
                b'-' => {
                    self.pos += 1;
                    let token = self.lex_number(true)?;
                    tokens.push((start, token));
                }
                b if b.is_ascii_alphabetic() || b == b'_' => {
                    let token = self.lex_ident();
                    tokens.push((start, token));
                }
                other => {
                    return Err(ExpressionError::syntax(
                        start,
                        format!("unexpected character `{}`", other as char),
                    ));
                }
            }
        }
        Ok(tokens)
    }

    fn lex_string(&mut self, quote: u8) -> Result<Token, ExpressionError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        while let Some(&byte) = self.src.get(self.pos) {
            if byte == quote {
                self.pos += 1;
                return Ok(Token::Str(out));
            }
            out.push(byte as char);
            self.pos += 1;
        }
        Err(ExpressionError::syntax(start, "unterminated string literal"))
    }

    fn lex_number(&mut self, negative: bool) -> Result<Token, ExpressionError> {
        let start = self.pos;
        let mut seen_dot = false;
        while let Some(&byte) = self.src.get(self.pos) {
            match byte {
                b'0'..=b'9' => self.pos += 1,
                // Only consume a dot when a digit follows, so that
                // `steps.build.output` style paths never eat into numbers.
                b'.' if !seen_dot
                    && self
                        .src
                        .get(self.pos + 1)
                        .is_some_and(|b| b.is_ascii_digit()) =>
                {
                    seen_dot = true;
                    self.pos += 1;
                }
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
        if text.is_empty() {
            return Err(ExpressionError::syntax(start, "expected digits"));
        }
        let mut value: f64 = text
            .parse()
            .map_err(|_| ExpressionError::syntax(start, format!("invalid number `{text}`")))?;
        if negative {
            value = -value;
        }
        Ok(Token::Number(value))
    }

    fn lex_ident(&mut self) -> Token {
        let start = self.pos;
        while let Some(&byte) = self.src.get(self.pos) {
            if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .unwrap_or("")
            .to_string();
        Token::Ident(text)
    }
}

pub(super) struct Parser {
    tokens: Vec<(usize, Token)>,
    cursor: usize,
    len: usize,
}

impl Parser {
    pub(super) fn new(source: &str) -> Result<Self, ExpressionError> {
        let tokens = Lexer::new(source).tokenize()?;
        Ok(Self {
            tokens,
            cursor: 0,
            len: source.len(),
        })
    }

    pub(super) fn parse_complete(mut self) -> Result<Expr, ExpressionError> {
        let expr = self.parse_or()?;
        if let Some((pos, token)) = self.tokens.get(self.cursor) {
            return Err(ExpressionError::syntax(
                *pos,
                format!("unexpected {} after expression", token.describe()),
            ));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Option<(usize, Token)> {
        let item = self.tokens.get(self.cursor).cloned();
        if item.is_some() {
            self.cursor += 1;
        }
        item
    }

    fn here(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .map(|(pos, _)| *pos)
            .unwrap_or(self.len)
    }

    fn expect_dot(&mut self, context: &str) -> Result<(), ExpressionError> {
        match self.advance() {
            Some((_, Token::Dot)) => Ok(()),
            Some((pos, token)) => Err(ExpressionError::syntax(
                pos,
                format!("expected `.` {context}, found {}", token.describe()),
            )),
            None => Err(ExpressionError::syntax(
                self.len,
                format!("expected `.` {context}, found end of input"),
            )),
        }
    }

    fn expect_ident(&mut self, context: &str) -> Result<String, ExpressionError> {
        match self.advance() {
            Some((_, Token::Ident(name))) => Ok(name),
            Some((pos, token)) => Err(ExpressionError::syntax(
                pos,
                format!("expected {context}, found {}", token.describe()),
            )),
            None => Err(ExpressionError::syntax(
                self.len,
                format!("expected {context}, found end of input"),
            )),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::OrOr)) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        while matches!(self.peek(), Some(Token::AndAnd)) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_unary()?;
        // Reject chained comparisons outright.
        if let Some(token @ (Token::EqEq
        | Token::NotEq
        | Token::Lt
        | Token::Le
        | Token::Gt
        | Token::Ge)) = self.peek()
        {
            return Err(ExpressionError::syntax(
                self.here(),
                format!("comparisons cannot be chained ({})", token.describe()),
            ));
        }
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if matches!(self.peek(), Some(Token::Bang)) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            Some((_, Token::Str(s))) => Ok(Expr::Literal(Value::Str(s))),
            Some((_, Token::Number(n))) => Ok(Expr::Literal(Value::Number(n))),
            Some((_, Token::LParen)) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some((_, Token::RParen)) => Ok(inner),
                    Some((pos, token)) => Err(ExpressionError::syntax(
                        pos,
                        format!("expected `)`, found {}", token.describe()),
                    )),
                    None => Err(ExpressionError::syntax(
                        self.len,
                        "expected `)`, found end of input",
                    )),
                }
            }
            Some((pos, Token::Ident(name))) => self.parse_ident(pos, name),
            Some((pos, token)) => Err(ExpressionError::syntax(
                pos,
                format!("expected a value, found {}", token.describe()),
            )),
            None => Err(ExpressionError::syntax(
                self.len,
                "expected a value, found end of input",
            )),
        }
    }

    fn parse_ident(&mut self, pos: usize, name: String) -> Result<Expr, ExpressionError> {
        match name.as_str() {
            "true" => Ok(Expr::Literal(Value::Bool(true))),
            "false" => Ok(Expr::Literal(Value::Bool(false))),
            "null" => Ok(Expr::Literal(Value::Null)),
            "vars" => {
                self.expect_dot("after `vars`")?;
                let var = self.expect_ident("a variable name after `vars.`")?;
                Ok(Expr::Reference(VarRef::Var(var)))
            }
            "steps" => {
                self.expect_dot("after `steps`")?;
                let step = self.expect_ident("a step name after `steps.`")?;
                self.expect_dot("after the step name")?;
                let field = self.expect_ident("`output` after the step name")?;
                if field != "output" {
                    return Err(ExpressionError::syntax(
                        pos,
                        format!("steps references support only `.output`, found `.{field}`"),
                    ));
                }
                Ok(Expr::Reference(VarRef::StepOutput(step)))
            }
            other => Err(ExpressionError::syntax(
                pos,
                format!("unknown identifier `{other}` (expected `vars.*` or `steps.*.output`)"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::Expression;
    use super::*;

    fn parse(src: &str) -> Expr {
        Expression::parse(src).expect("should parse").into_expr()
    }

    #[test]
    fn parses_literals() {
        assert_eq!(parse("true"), Expr::Literal(Value::Bool(true)));
        assert_eq!(parse("42"), Expr::Literal(Value::Number(42.0)));
        assert_eq!(parse("-3.5"), Expr::Literal(Value::Number(-3.5)));
        assert_eq!(parse("'ok'"), Expr::Literal(Value::Str("ok".to_string())));
        assert_eq!(parse("\"ok\""), Expr::Literal(Value::Str("ok".to_string())));
        assert_eq!(parse("null"), Expr::Literal(Value::Null));
    }

    #[test]
    fn parses_references() {
        assert_eq!(
            parse("vars.region"),
            Expr::Reference(VarRef::Var("region".to_string()))
        );
        assert_eq!(
            parse("steps.build-image.output"),
            Expr::Reference(VarRef::StepOutput("build-image".to_string()))
        );
    }

    #[test]
    fn rejects_unknown_reference_roots() {
        let err = Expression::parse("env.HOME").unwrap_err();
        assert!(matches!(err, ExpressionError::Syntax { .. }));
        assert!(err.to_string().contains("unknown identifier"));
    }

    #[test]
    fn rejects_non_output_step_field() {
        let err = Expression::parse("steps.build.status").unwrap_err();
        assert!(err.to_string().contains("only `.output`"));
    }

    #[test]
    fn precedence_not_binds_tighter_than_and_then_or() {
        // !a && b || c  parses as  ((!a) && b) || c
        let expr = parse("!vars.a && vars.b || vars.c");
        match expr {
            Expr::Binary {
                op: BinaryOp::Or,
                left,
                ..
            } => match *left {
                Expr::Binary {
                    op: BinaryOp::And,
                    left,
                    ..
                } => assert!(matches!(*left, Expr::Not(_))),
                other => panic!("expected `&&` on the left, got {other:?}"),
            },
            other => panic!("expected `||` at the root, got {other:?}"),
        }
    }

    #[test]
    fn parentheses_override_precedence() {
        let expr = parse("vars.a && (vars.b || vars.c)");
        match expr {
            Expr::Binary {
                op: BinaryOp::And,
                right,
                ..
            } => assert!(matches!(
                *right,
                Expr::Binary {
                    op: BinaryOp::Or,
                    ..
                }
            )),
            other => panic!("expected `&&` at the root, got {other:?}"),
        }
    }

    #[test]
    fn rejects_chained_comparisons() {
        let err = Expression::parse("1 < 2 < 3").unwrap_err();
        assert!(err.to_string().contains("cannot be chained"));
    }

    #[test]
    fn rejects_trailing_tokens() {
        let err = Expression::parse("vars.a vars.b").unwrap_err();
        assert!(err.to_string().contains("after expression"));
    }

    #[test]
    fn rejects_unterminated_string() {
        let err = Expression::parse("'oops").unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn reports_error_position() {
        match Expression::parse("vars.a &&").unwrap_err() {
            ExpressionError::Syntax { position, .. } => assert_eq!(position, 9),
            other => panic!("expected syntax error, got {other}"),
        }
    }
}
