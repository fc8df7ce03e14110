//! Whitelisted boolean expression language for `depends_on` strings.
//!
//! Grammar (nothing else is accepted):
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | "(" expr ")" | compare
//! compare := operand ( ( "==" | "===" | "!=" | "!==" ) operand )?
//! operand := identifier | "doc." identifier | string | number | true | false | null
//! ```
//!
//! A bare operand is a truthiness test. A leading `eval:` prefix is stripped.
//! `==`/`!=` compare loosely (`"1" == 1`, blank equals null); `===`/`!==`
//! only match values of the same type, numbers by value.
//! Nesting is capped at [`MAX_DEPTH`] and input at [`MAX_TOKENS`] tokens;
//! anything larger is a parse error. Expressions are parsed once at schema registration and evaluated against a
//! [`ValueAccessor`] snapshot; they never execute code.

use serde_json::Value;

use crate::value::{is_truthy, loose_eq, ValueAccessor};

/// Deepest allowed nesting of `!` and parentheses.
pub const MAX_DEPTH: usize = 64;

/// Longest accepted expression, in tokens.
pub const MAX_TOKENS: usize = 1024;

/// Error produced while parsing an expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at offset {offset}")]
pub struct ParseError {
    /// Byte offset into the (prefix-stripped) source where parsing failed.
    pub offset: usize,
    /// What went wrong.
    pub message: String,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `a || b`
    Or(Box<Expr>, Box<Expr>),
    /// `a && b`
    And(Box<Expr>, Box<Expr>),
    /// `!a`
    Not(Box<Expr>),
    /// `a == b`
    Eq(Operand, Operand),
    /// `a != b`
    Ne(Operand, Operand),
    /// `a === b`
    StrictEq(Operand, Operand),
    /// `a !== b`
    StrictNe(Operand, Operand),
    /// Bare operand, tested for truthiness.
    Truthy(Operand),
}

/// Leaf of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Reference to a field in the snapshot.
    Field(String),
    /// Literal JSON value.
    Literal(Value),
}

impl Operand {
    fn resolve<'a>(&'a self, values: &'a dyn ValueAccessor) -> &'a Value {
        match self {
            Operand::Field(name) => values.get(name).unwrap_or(&Value::Null),
            Operand::Literal(v) => v,
        }
    }
}

impl Expr {
    /// Evaluates the expression against a snapshot.
    #[must_use]
    pub fn eval(&self, values: &dyn ValueAccessor) -> bool {
        match self {
            Expr::Or(a, b) => a.eval(values) || b.eval(values),
            Expr::And(a, b) => a.eval(values) && b.eval(values),
            Expr::Not(a) => !a.eval(values),
            Expr::Eq(a, b) => operands_eq(a.resolve(values), b.resolve(values)),
            Expr::Ne(a, b) => !operands_eq(a.resolve(values), b.resolve(values)),
            Expr::StrictEq(a, b) => strict_eq(a.resolve(values), b.resolve(values)),
            Expr::StrictNe(a, b) => !strict_eq(a.resolve(values), b.resolve(values)),
            Expr::Truthy(a) => is_truthy(a.resolve(values)),
        }
    }

    /// Names of every field the expression reads.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Or(a, b) | Expr::And(a, b) => {
                a.collect_fields(out);
                b.collect_fields(out);
            }
            Expr::Not(a) => a.collect_fields(out),
            Expr::Eq(a, b) | Expr::Ne(a, b) | Expr::StrictEq(a, b) | Expr::StrictNe(a, b) => {
                for op in [a, b] {
                    if let Operand::Field(name) = op {
                        out.push(name);
                    }
                }
            }
            Expr::Truthy(Operand::Field(name)) => out.push(name),
            Expr::Truthy(Operand::Literal(_)) => {}
        }
    }
}

/// Missing fields compare equal to `null` and to the empty string.
fn operands_eq(a: &Value, b: &Value) -> bool {
    let blank = |v: &Value| v.is_null() || v.as_str() == Some("");
    if blank(a) && blank(b) {
        return true;
    }
    loose_eq(a, b)
}

/// Same type only; a missing field is `null`.
fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Parses an expression string.
///
/// # Errors
///
/// Returns [`ParseError`] for anything outside the grammar, including empty
/// input and trailing tokens.
pub fn parse(source: &str) -> Result<Expr, ParseError> {
    let trimmed = source.trim();
    let body = trimmed.strip_prefix("eval:").unwrap_or(trimmed);
    let tokens = tokenize(body)?;
    if let Some((offset, _)) = tokens.get(MAX_TOKENS) {
        return Err(err(*offset, "expression too long"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: body.len(),
        depth: 0,
    };
    let expr = parser.expr()?;
    match parser.peek() {
        None => Ok(expr),
        Some((offset, tok)) => Err(ParseError {
            offset: *offset,
            message: format!("unexpected {tok:?}"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    EqEq,
    NotEq,
    StrictEq,
    StrictNe,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'(' => {
                out.push((start, Token::LParen));
                i += 1;
            }
            b')' => {
                out.push((start, Token::RParen));
                i += 1;
            }
            b'=' => {
                if bytes.get(i + 1) != Some(&b'=') {
                    return Err(err(start, "assignment is not allowed"));
                }
                if bytes.get(i + 2) == Some(&b'=') {
                    i += 3;
                    out.push((start, Token::StrictEq));
                } else {
                    i += 2;
                    out.push((start, Token::EqEq));
                }
            }
            b'!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    if bytes.get(i + 2) == Some(&b'=') {
                        i += 3;
                        out.push((start, Token::StrictNe));
                    } else {
                        i += 2;
                        out.push((start, Token::NotEq));
                    }
                } else {
                    i += 1;
                    out.push((start, Token::Bang));
                }
            }
            b'&' => {
                if bytes.get(i + 1) != Some(&b'&') {
                    return Err(err(start, "expected '&&'"));
                }
                i += 2;
                out.push((start, Token::AndAnd));
            }
            b'|' => {
                if bytes.get(i + 1) != Some(&b'|') {
                    return Err(err(start, "expected '||'"));
                }
                i += 2;
                out.push((start, Token::OrOr));
            }
            b'\'' | b'"' => {
                let quote = c;
                i += 1;
                let mut text = String::new();
                loop {
                    let Some(&b) = bytes.get(i) else {
                        return Err(err(start, "unterminated string"));
                    };
                    if b == quote {
                        i += 1;
                        break;
                    }
                    if b == b'\\' {
                        if let Some(&next) = bytes.get(i + 1).filter(|b| b.is_ascii()) {
                            text.push(char::from(next));
                            i += 2;
                            continue;
                        }
                    }
                    // Copy the full UTF-8 sequence starting at `i`.
                    let ch = src[i..].chars().next().unwrap_or('\u{fffd}');
                    text.push(ch);
                    i += ch.len_utf8();
                }
                out.push((start, Token::Str(text)));
            }
            b'0'..=b'9' | b'-' => {
                i += 1;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let text = &src[start..i];
                let num = text
                    .parse::<f64>()
                    .map_err(|_| err(start, &format!("invalid number '{text}'")))?;
                out.push((start, Token::Num(num)));
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.')
                {
                    i += 1;
                }
                let word = &src[start..i];
                let tok = match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" | "undefined" => Token::Null,
                    _ => {
                        let name = word.strip_prefix("doc.").unwrap_or(word);
                        if name.is_empty() || name.contains('.') {
                            return Err(err(start, &format!("unsupported reference '{word}'")));
                        }
                        Token::Ident(name.to_string())
                    }
                };
                out.push((start, tok));
            }
            _ => {
                return Err(err(start, &format!("unexpected character '{}'", char::from(c))));
            }
        }
    }
    Ok(out)
}

fn err(offset: usize, message: &str) -> ParseError {
    ParseError {
        offset,
        message: message.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&(usize, Token)> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, want: &Token) -> bool {
        if self.peek().is_some_and(|(_, t)| t == want) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn offset(&self) -> usize {
        self.peek().map_or(self.end, |(o, _)| *o)
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.and()?;
        while self.eat(&Token::OrOr) {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.unary()?;
        while self.eat(&Token::AndAnd) {
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.depth >= MAX_DEPTH {
            return Err(err(self.offset(), "expression nested too deeply"));
        }
        self.depth += 1;
        let result = self.nested();
        self.depth -= 1;
        result
    }

    fn nested(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Bang) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat(&Token::LParen) {
            let inner = self.expr()?;
            if !self.eat(&Token::RParen) {
                return Err(err(self.offset(), "expected ')'"));
            }
            return Ok(inner);
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, ParseError> {
        let left = self.operand()?;
        if self.eat(&Token::EqEq) {
            return Ok(Expr::Eq(left, self.operand()?));
        }
        if self.eat(&Token::NotEq) {
            return Ok(Expr::Ne(left, self.operand()?));
        }
        if self.eat(&Token::StrictEq) {
            return Ok(Expr::StrictEq(left, self.operand()?));
        }
        if self.eat(&Token::StrictNe) {
            return Ok(Expr::StrictNe(left, self.operand()?));
        }
        Ok(Expr::Truthy(left))
    }

    fn operand(&mut self) -> Result<Operand, ParseError> {
        let offset = self.offset();
        let Some((_, tok)) = self.tokens.get(self.pos).cloned() else {
            return Err(err(offset, "unexpected end of expression"));
        };
        self.pos += 1;
        Ok(match tok {
            Token::Ident(name) => Operand::Field(name),
            Token::Str(s) => Operand::Literal(Value::String(s)),
            Token::Num(n) => Operand::Literal(crate::value::number_value(n)),
            Token::True => Operand::Literal(Value::Bool(true)),
            Token::False => Operand::Literal(Value::Bool(false)),
            Token::Null => Operand::Literal(Value::Null),
            other => return Err(err(offset, &format!("expected a value, found {other:?}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::value::Values;

    fn snapshot(pairs: &[(&str, Value)]) -> Values {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn equality_against_literal() {
        let expr = parse("which_asset_to_interchange=='Motor'").unwrap();
        assert!(expr.eval(&snapshot(&[("which_asset_to_interchange", json!("Motor"))])));
        assert!(!expr.eval(&snapshot(&[("which_asset_to_interchange", json!("Pump"))])));
        assert!(!expr.eval(&Values::new()));
    }

    #[test]
    fn eval_prefix_and_doc_references() {
        let expr = parse("eval:doc.status == \"Open\" && doc.qty").unwrap();
        assert!(expr.eval(&snapshot(&[("status", json!("Open")), ("qty", json!(2))])));
        assert!(!expr.eval(&snapshot(&[("status", json!("Open")), ("qty", json!(0))])));
    }

    #[test]
    fn or_binds_looser_than_and() {
        let expr = parse("a=='1' || b=='1' && c=='1'").unwrap();
        assert!(expr.eval(&snapshot(&[("a", json!("1"))])));
        assert!(!expr.eval(&snapshot(&[("b", json!("1"))])));
        assert!(expr.eval(&snapshot(&[("b", json!("1")), ("c", json!("1"))])));
    }

    #[test]
    fn field_to_field_and_numeric_comparison() {
        let expr = parse("planned == actual && count == 3").unwrap();
        let values = snapshot(&[
            ("planned", json!("x")),
            ("actual", json!("x")),
            ("count", json!("3")),
        ]);
        assert!(expr.eval(&values));
    }

    #[test]
    fn negation_and_parentheses() {
        let expr = parse("!(status == 'Closed') && status != ''").unwrap();
        assert!(expr.eval(&snapshot(&[("status", json!("Open"))])));
        assert!(!expr.eval(&snapshot(&[("status", json!("Closed"))])));
        assert!(!expr.eval(&Values::new()));
    }

    #[test]
    fn collects_referenced_fields() {
        let expr = parse("a == b || !c").unwrap();
        assert_eq!(expr.fields(), vec!["a", "b", "c"]);
    }

    #[test]
    fn rejects_code_like_input() {
        for bad in [
            "",
            "a = 1",
            "a == ",
            "alert(1)",
            "a.b.c == 1",
            "a == 'x' ;",
            "a & b",
            "(a == 1",
            "'unterminated",
            "frappe.user == 'x'",
        ] {
            assert!(parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn triple_equals_does_not_coerce() {
        let strict = parse("qty === 1").unwrap();
        assert!(strict.eval(&snapshot(&[("qty", json!(1))])));
        assert!(strict.eval(&snapshot(&[("qty", json!(1.0))])));
        assert!(!strict.eval(&snapshot(&[("qty", json!("1"))])));
        assert!(parse("qty == 1").unwrap().eval(&snapshot(&[("qty", json!("1"))])));

        let blank = parse("remarks === ''").unwrap();
        assert!(blank.eval(&snapshot(&[("remarks", json!(""))])));
        assert!(!blank.eval(&Values::new()));
        assert!(parse("remarks !== ''").unwrap().eval(&Values::new()));
        assert!(parse("remarks === null").unwrap().eval(&Values::new()));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let bangs = format!("{}a", "!".repeat(100_000));
        assert!(parse(&bangs).is_err());
        let parens = format!("{}a{}", "(".repeat(MAX_DEPTH + 1), ")".repeat(MAX_DEPTH + 1));
        let error = parse(&parens).unwrap_err();
        assert_eq!(error.message, "expression nested too deeply");

        let shallow = format!("{}a{}", "(".repeat(MAX_DEPTH - 1), ")".repeat(MAX_DEPTH - 1));
        assert!(parse(&shallow).is_ok());
    }

    #[test]
    fn long_chains_are_rejected() {
        let chain = vec!["a"; 200_000].join(" && ");
        assert_eq!(parse(&chain).unwrap_err().message, "expression too long");
    }

    #[test]
    fn unicode_literals_survive() {
        let expr = parse("label == 'पंप'").unwrap();
        assert!(expr.eval(&snapshot(&[("label", json!("पंप"))])));
    }
}
