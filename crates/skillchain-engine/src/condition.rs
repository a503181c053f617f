//! Edge condition language.
//!
//! A closed expression grammar over context keys, parsed when the chain is
//! loaded and interpreted by the engine:
//!
//! ```text
//! expr    := or
//! or      := and ( ("or" | "||") and )*
//! and     := unary ( ("and" | "&&") unary )*
//! unary   := ("not" | "!") unary | cmp
//! cmp     := primary ( ("==" | "!=" | "<" | "<=" | ">" | ">=" | "contains") primary )?
//! primary := literal | path | "(" expr ")"
//! literal := number | "string" | 'string' | true | false | null
//! path    := ident ("." ident)*
//! ```
//!
//! Paths name context keys. A missing key evaluates to `null`.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;

/// A parsed edge condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

/// Syntax error in a condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionError {
    pub message: String,
    /// Byte offset into the source expression.
    pub position: usize,
}

impl std::fmt::Display for ConditionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at offset {}", self.message, self.position)
    }
}

impl std::error::Error for ConditionError {}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(Value),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Op(CmpOp),
    LParen,
    RParen,
}

impl Condition {
    /// Parse a condition expression.
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
        };
        if parser.tokens.is_empty() {
            return Err(ConditionError {
                message: "empty condition".into(),
                position: 0,
            });
        }
        let expr = parser.parse_or()?;
        if let Some((_, offset)) = parser.tokens.get(parser.pos) {
            return Err(ConditionError {
                message: "unexpected trailing input".into(),
                position: *offset,
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// The expression as written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against context data.
    pub fn evaluate(&self, data: &HashMap<String, Value>) -> bool {
        truthy(&eval(&self.expr, data))
    }

    /// Context keys referenced by the expression.
    pub fn referenced_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        collect_paths(&self.expr, &mut keys);
        keys.sort();
        keys.dedup();
        keys
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn collect_paths(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Path(p) => out.push(p.clone()),
        Expr::Not(e) => collect_paths(e, out),
        Expr::And(a, b) | Expr::Or(a, b) | Expr::Cmp(_, a, b) => {
            collect_paths(a, out);
            collect_paths(b, out);
        }
    }
}

// ── Lexer ───────────────────────────────────────────────────────────

fn tokenize(src: &str) -> Result<Vec<(Token, usize)>, ConditionError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    let err = |message: &str, position: usize| ConditionError {
        message: message.to_string(),
        position,
    };

    while i < bytes.len() {
        let c = bytes[i] as char;
        let start = i;
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
                continue;
            }
            '(' => {
                tokens.push((Token::LParen, start));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, start));
                i += 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((Token::Op(CmpOp::Eq), start));
                    i += 2;
                } else {
                    return Err(err("expected '=='", start));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((Token::Op(CmpOp::Ne), start));
                    i += 2;
                } else {
                    tokens.push((Token::Not, start));
                    i += 1;
                }
            }
            '<' | '>' => {
                let eq = bytes.get(i + 1) == Some(&b'=');
                let op = match (c, eq) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    ('>', false) => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                tokens.push((Token::Op(op), start));
                i += if eq { 2 } else { 1 };
            }
            '&' | '|' => {
                if bytes.get(i + 1) == Some(&bytes[i]) {
                    let tok = if c == '&' { Token::And } else { Token::Or };
                    tokens.push((tok, start));
                    i += 2;
                } else {
                    return Err(err(&format!("expected '{}{}'", c, c), start));
                }
            }
            '"' | '\'' => {
                let (s, next) = lex_string(src, i)?;
                tokens.push((Token::Str(s), start));
                i = next;
            }
            c if c.is_ascii_digit()
                || (c == '-' && bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit())) =>
            {
                i += 1;
                while i < bytes.len() {
                    let d = bytes[i];
                    let exp_sign = (d == b'+' || d == b'-') && matches!(bytes[i - 1], b'e' | b'E');
                    if d.is_ascii_digit() || d == b'.' || d == b'e' || d == b'E' || exp_sign {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text = &src[start..i];
                let value = if let Ok(n) = text.parse::<i64>() {
                    Value::from(n)
                } else {
                    text.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                        .ok_or_else(|| err(&format!("invalid number '{}'", text), start))?
                };
                tokens.push((Token::Num(value), start));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'_' | b'-' | b'.'))
                {
                    i += 1;
                }
                let word = &src[start..i];
                if word.ends_with('.') || word.contains("..") {
                    return Err(err(&format!("invalid key '{}'", word), start));
                }
                let tok = match word {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "contains" => Token::Op(CmpOp::Contains),
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push((tok, start));
            }
            other => {
                return Err(err(&format!("unexpected character '{}'", other), start));
            }
        }
    }

    Ok(tokens)
}

/// Lex a quoted string starting at `start`; returns the value and the index
/// after the closing quote.
fn lex_string(src: &str, start: usize) -> Result<(String, usize), ConditionError> {
    let mut chars = src[start..].char_indices();
    let (_, quote) = chars.next().unwrap_or((0, '"'));
    let mut out = String::new();

    while let Some((offset, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, other)) => out.push(other),
                None => break,
            },
            c if c == quote => return Ok((out, start + offset + c.len_utf8())),
            c => out.push(c),
        }
    }

    Err(ConditionError {
        message: "unterminated string".into(),
        position: start,
    })
}

// ── Parser ──────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, o)| *o).unwrap_or(self.end)
    }

    fn error(&self, message: &str) -> ConditionError {
        ConditionError {
            message: message.to_string(),
            position: self.offset(),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Cmp(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        let token = match self.tokens.get(self.pos) {
            Some((t, _)) => t.clone(),
            None => return Err(self.error("unexpected end of expression")),
        };
        let expr = match token {
            Token::Ident(name) => Expr::Path(name),
            Token::Str(s) => Expr::Literal(Value::String(s)),
            Token::Num(n) => Expr::Literal(n),
            Token::True => Expr::Literal(Value::Bool(true)),
            Token::False => Expr::Literal(Value::Bool(false)),
            Token::Null => Expr::Literal(Value::Null),
            Token::LParen => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(self.error("expected ')'"));
                }
                inner
            }
            _ => return Err(self.error("expected a value, key, or '('")),
        };
        self.pos += 1;
        Ok(expr)
    }
}

// ── Interpreter ─────────────────────────────────────────────────────

fn eval(expr: &Expr, data: &HashMap<String, Value>) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path(p) => lookup(p, data).cloned().unwrap_or(Value::Null),
        Expr::Not(e) => Value::Bool(!truthy(&eval(e, data))),
        Expr::And(a, b) => Value::Bool(truthy(&eval(a, data)) && truthy(&eval(b, data))),
        Expr::Or(a, b) => Value::Bool(truthy(&eval(a, data)) || truthy(&eval(b, data))),
        Expr::Cmp(op, a, b) => Value::Bool(compare(*op, &eval(a, data), &eval(b, data))),
    }
}

/// Resolve a dotted path: an exact context key wins; otherwise the longest
/// key prefix is looked up and the remaining segments index into its object.
fn lookup<'a>(path: &str, data: &'a HashMap<String, Value>) -> Option<&'a Value> {
    if let Some(v) = data.get(path) {
        return Some(v);
    }
    let mut split = path.len();
    while let Some(dot) = path[..split].rfind('.') {
        if let Some(root) = data.get(&path[..dot]) {
            return path[dot + 1..]
                .split('.')
                .try_fold(root, |v, seg| v.get(seg));
        }
        split = dot;
    }
    None
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(a, b),
        CmpOp::Ne => !values_equal(a, b),
        CmpOp::Lt => order(a, b) == Some(Ordering::Less),
        CmpOp::Le => matches!(order(a, b), Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => order(a, b) == Some(Ordering::Greater),
        CmpOp::Ge => matches!(order(a, b), Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::Contains => match (a, b) {
            (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| values_equal(i, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn eval_str(expr: &str, data: &HashMap<String, Value>) -> bool {
        Condition::parse(expr).unwrap().evaluate(data)
    }

    #[test]
    fn test_not_valid() {
        assert!(eval_str("not valid", &ctx(&[("valid", json!(false))])));
        assert!(!eval_str("not valid", &ctx(&[("valid", json!(true))])));
        assert!(eval_str("!valid", &ctx(&[])));
    }

    #[test]
    fn test_equality() {
        let data = ctx(&[("status", json!("success")), ("count", json!(3))]);
        assert!(eval_str(r#"status == "success""#, &data));
        assert!(eval_str("status != 'failure'", &data));
        assert!(eval_str("count == 3.0", &data));
        assert!(!eval_str("count == 4", &data));
    }

    #[test]
    fn test_ordering() {
        let data = ctx(&[("score", json!(0.82)), ("name", json!("beta"))]);
        assert!(eval_str("score >= 0.8", &data));
        assert!(eval_str("score < 1", &data));
        assert!(!eval_str("score > 0.9", &data));
        assert!(eval_str(r#"name > "alpha""#, &data));
        // mixed types never order
        assert!(!eval_str("name < 5", &data));
        assert!(!eval_str("name >= 5", &data));
    }

    #[test]
    fn test_contains() {
        let data = ctx(&[
            ("output", json!("The file was created successfully.")),
            ("tags", json!(["coal", "gas"])),
            ("report", json!({"errors": 0})),
        ]);
        assert!(eval_str(r#"output contains "created""#, &data));
        assert!(!eval_str(r#"output contains "deleted""#, &data));
        assert!(eval_str("tags contains 'gas'", &data));
        assert!(eval_str("report contains 'errors'", &data));
    }

    #[test]
    fn test_boolean_precedence() {
        let data = ctx(&[("a", json!(true)), ("b", json!(false)), ("c", json!(true))]);
        // and binds tighter than or
        assert!(eval_str("b and c or a", &data));
        assert!(!eval_str("b and (c or a)", &data));
        assert!(eval_str("a && !b || false", &data));
        assert!(eval_str("not (a and b)", &data));
    }

    #[test]
    fn test_missing_key_is_null() {
        let data = ctx(&[]);
        assert!(!eval_str(r#"missing == "value""#, &data));
        assert!(eval_str("missing == null", &data));
        assert!(!eval_str("missing", &data));
    }

    #[test]
    fn test_dotted_keys() {
        let data = ctx(&[
            ("validate.valid", json!(true)),
            ("report", json!({"summary": {"errors": 2}})),
        ]);
        assert!(eval_str("validate.valid", &data));
        assert!(eval_str("report.summary.errors == 2", &data));
        assert!(!eval_str("report.summary.missing", &data));
    }

    #[test]
    fn test_truthiness() {
        let data = ctx(&[
            ("zero", json!(0)),
            ("empty", json!("")),
            ("list", json!([1])),
            ("obj", json!({})),
        ]);
        assert!(!eval_str("zero", &data));
        assert!(!eval_str("empty", &data));
        assert!(eval_str("list", &data));
        assert!(!eval_str("obj", &data));
    }

    #[test]
    fn test_string_escapes() {
        let data = ctx(&[("q", json!("say \"hi\""))]);
        assert!(eval_str(r#"q == "say \"hi\"""#, &data));
    }

    #[test]
    fn test_negative_numbers() {
        let data = ctx(&[("delta", json!(-2))]);
        assert!(eval_str("delta < -1", &data));
        assert!(eval_str("delta == -2", &data));
    }

    #[test]
    fn test_referenced_keys() {
        let cond = Condition::parse("not valid and (score > 0.5 or validate.retry)").unwrap();
        assert_eq!(cond.referenced_keys(), vec!["score", "valid", "validate.retry"]);
        assert_eq!(cond.source(), "not valid and (score > 0.5 or validate.retry)");
    }

    #[test]
    fn test_syntax_errors() {
        for bad in [
            "",
            "a ==",
            "a = b",
            "(a or b",
            "a b",
            "\"unterminated",
            "a & b",
            "a..b",
            "a $ b",
            "and",
        ] {
            assert!(Condition::parse(bad).is_err(), "expected error for {:?}", bad);
        }
    }

    #[test]
    fn test_error_position() {
        let err = Condition::parse("valid and )").unwrap_err();
        assert_eq!(err.position, 10);
    }
}
