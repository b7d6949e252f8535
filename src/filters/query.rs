//! Line-oriented JSON query subset used for entry projection.
//!
//! Supported: identity `.`, field paths `.a.b` and `.["k"]`, pipes,
//! `select(expr)`, `contains(expr)`, `and`/`or`/`not`, `==`/`!=` on scalars,
//! string/number/boolean/null literals, parentheses. Anything else is
//! rejected at compile time with the offending token and byte offset.

use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct QueryError {
    pub offset: usize,
    pub token: String,
    pub message: String,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at byte {}: '{}'",
            self.message, self.offset, self.token
        )
    }
}

impl std::error::Error for QueryError {}

fn unsupported(offset: usize, token: impl Into<String>) -> QueryError {
    QueryError {
        offset,
        token: token.into(),
        message: "unsupported construct".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Dot,
    Pipe,
    LParen,
    RParen,
    LBracket,
    RBracket,
    EqEq,
    NotEq,
    Ident(String),
    Str(String),
    Num(f64),
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    offset: usize,
}

fn lex(source: &str) -> Result<Vec<Spanned>, QueryError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' => i += 1,
            '.' => {
                tokens.push(Spanned {
                    token: Token::Dot,
                    offset: i,
                });
                i += 1;
            }
            '|' => {
                tokens.push(Spanned {
                    token: Token::Pipe,
                    offset: i,
                });
                i += 1;
            }
            '(' => {
                tokens.push(Spanned {
                    token: Token::LParen,
                    offset: i,
                });
                i += 1;
            }
            ')' => {
                tokens.push(Spanned {
                    token: Token::RParen,
                    offset: i,
                });
                i += 1;
            }
            '[' => {
                tokens.push(Spanned {
                    token: Token::LBracket,
                    offset: i,
                });
                i += 1;
            }
            ']' => {
                tokens.push(Spanned {
                    token: Token::RBracket,
                    offset: i,
                });
                i += 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Spanned {
                        token: Token::EqEq,
                        offset: i,
                    });
                    i += 2;
                } else {
                    return Err(unsupported(i, "="));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Spanned {
                        token: Token::NotEq,
                        offset: i,
                    });
                    i += 2;
                } else {
                    return Err(unsupported(i, "!"));
                }
            }
            '"' => {
                let start = i;
                i += 1;
                let mut raw = Vec::new();
                loop {
                    match bytes.get(i) {
                        None => {
                            return Err(QueryError {
                                offset: start,
                                token: "\"".to_string(),
                                message: "unterminated string".to_string(),
                            });
                        }
                        Some(b'"') => {
                            i += 1;
                            break;
                        }
                        Some(b'\\') => {
                            match bytes.get(i + 1) {
                                Some(b'"') => raw.push(b'"'),
                                Some(b'\\') => raw.push(b'\\'),
                                Some(b'n') => raw.push(b'\n'),
                                Some(b't') => raw.push(b'\t'),
                                other => {
                                    return Err(unsupported(
                                        i,
                                        format!("\\{}", other.map(|b| *b as char).unwrap_or(' ')),
                                    ));
                                }
                            }
                            i += 2;
                        }
                        Some(b) => {
                            raw.push(*b);
                            i += 1;
                        }
                    }
                }
                let text = String::from_utf8(raw)
                    .map_err(|_| unsupported(start, "non-UTF-8 string"))?;
                tokens.push(Spanned {
                    token: Token::Str(text),
                    offset: start,
                });
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                {
                    i += 1;
                }
                let text = &source[start..i];
                let value: f64 = text
                    .parse()
                    .map_err(|_| unsupported(start, text.to_string()))?;
                tokens.push(Spanned {
                    token: Token::Num(value),
                    offset: start,
                });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Spanned {
                    token: Token::Ident(source[start..i].to_string()),
                    offset: start,
                });
            }
            other => return Err(unsupported(i, other.to_string())),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Identity,
    Path(Vec<String>),
    Literal(Value),
    Pipe(Box<Expr>, Box<Expr>),
    Select(Box<Expr>),
    Contains(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not,
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    source_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let spanned = self.tokens.get(self.pos).cloned();
        if spanned.is_some() {
            self.pos += 1;
        }
        spanned
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), QueryError> {
        match self.advance() {
            Some(s) if s.token == token => Ok(()),
            Some(s) => Err(QueryError {
                offset: s.offset,
                token: describe(&s.token),
                message: format!("expected {what}"),
            }),
            None => Err(QueryError {
                offset: self.source_len,
                token: "end of input".to_string(),
                message: format!("expected {what}"),
            }),
        }
    }

    fn parse_pipe(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.parse_or()?;
        while matches!(self.peek().map(|s| &s.token), Some(Token::Pipe)) {
            self.advance();
            let right = self.parse_or()?;
            left = Expr::Pipe(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek().map(|s| &s.token), Some(Token::Ident(id)) if id == "or") {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.parse_comparison()?;
        while matches!(self.peek().map(|s| &s.token), Some(Token::Ident(id)) if id == "and") {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, QueryError> {
        let left = self.parse_primary()?;
        match self.peek().map(|s| &s.token) {
            Some(Token::EqEq) => {
                self.advance();
                let right = self.parse_primary()?;
                Ok(Expr::Eq(Box::new(left), Box::new(right)))
            }
            Some(Token::NotEq) => {
                self.advance();
                let right = self.parse_primary()?;
                Ok(Expr::Ne(Box::new(left), Box::new(right)))
            }
            _ => Ok(left),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, QueryError> {
        let Some(spanned) = self.advance() else {
            return Err(QueryError {
                offset: self.source_len,
                token: "end of input".to_string(),
                message: "expected an expression".to_string(),
            });
        };

        match spanned.token {
            Token::Dot => self.parse_path(),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Num(n) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Token::LParen => {
                let inner = self.parse_pipe()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Ident(id) => match id.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "not" => Ok(Expr::Not),
                "select" => {
                    self.expect(Token::LParen, "'(' after select")?;
                    let inner = self.parse_pipe()?;
                    self.expect(Token::RParen, "')'")?;
                    Ok(Expr::Select(Box::new(inner)))
                }
                "contains" => {
                    self.expect(Token::LParen, "'(' after contains")?;
                    let inner = self.parse_pipe()?;
                    self.expect(Token::RParen, "')'")?;
                    Ok(Expr::Contains(Box::new(inner)))
                }
                _ => Err(unsupported(spanned.offset, id)),
            },
            other => Err(unsupported(spanned.offset, describe(&other))),
        }
    }

    /// Called with the leading dot consumed: `.a.b`, `.["k"]`, or bare `.`.
    fn parse_path(&mut self) -> Result<Expr, QueryError> {
        let mut segments = Vec::new();
        loop {
            match self.peek().map(|s| s.token.clone()) {
                Some(Token::Ident(id)) => {
                    self.advance();
                    segments.push(id);
                    if matches!(self.peek().map(|s| &s.token), Some(Token::Dot)) {
                        self.advance();
                        continue;
                    }
                    break;
                }
                Some(Token::LBracket) => {
                    self.advance();
                    match self.advance() {
                        Some(Spanned {
                            token: Token::Str(key),
                            ..
                        }) => {
                            self.expect(Token::RBracket, "']'")?;
                            segments.push(key);
                            if matches!(self.peek().map(|s| &s.token), Some(Token::Dot)) {
                                self.advance();
                                continue;
                            }
                            break;
                        }
                        Some(s) => {
                            return Err(unsupported(s.offset, describe(&s.token)));
                        }
                        None => {
                            return Err(QueryError {
                                offset: self.source_len,
                                token: "end of input".to_string(),
                                message: "expected a string index".to_string(),
                            });
                        }
                    }
                }
                _ => break,
            }
        }
        if segments.is_empty() {
            Ok(Expr::Identity)
        } else {
            Ok(Expr::Path(segments))
        }
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Dot => ".".into(),
        Token::Pipe => "|".into(),
        Token::LParen => "(".into(),
        Token::RParen => ")".into(),
        Token::LBracket => "[".into(),
        Token::RBracket => "]".into(),
        Token::EqEq => "==".into(),
        Token::NotEq => "!=".into(),
        Token::Ident(id) => id.clone(),
        Token::Str(s) => format!("\"{s}\""),
        Token::Num(n) => n.to_string(),
    }
}

/// A compiled query, ready to run against entry JSON.
#[derive(Debug, Clone)]
pub struct Program {
    ast: Expr,
}

pub fn compile(source: &str) -> Result<Program, QueryError> {
    let tokens = lex(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        source_len: source.len(),
    };
    let ast = parser.parse_pipe()?;
    if let Some(trailing) = parser.peek() {
        return Err(QueryError {
            offset: trailing.offset,
            token: describe(&trailing.token),
            message: "trailing input".to_string(),
        });
    }
    Ok(Program { ast })
}

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

fn walk<'a>(value: &'a Value, segments: &[String]) -> &'a Value {
    let mut current = value;
    for segment in segments {
        match current.get(segment) {
            Some(next) => current = next,
            None => return &Value::Null,
        }
    }
    current
}

impl Program {
    /// Runs the query. `Ok(None)` means the entry was dropped by `select`.
    pub fn apply(&self, input: &Value) -> Result<Option<Value>, String> {
        eval(&self.ast, input)
    }
}

fn eval(expr: &Expr, input: &Value) -> Result<Option<Value>, String> {
    match expr {
        Expr::Identity => Ok(Some(input.clone())),
        Expr::Path(segments) => Ok(Some(walk(input, segments).clone())),
        Expr::Literal(value) => Ok(Some(value.clone())),
        Expr::Pipe(left, right) => match eval(left, input)? {
            None => Ok(None),
            Some(mid) => eval(right, &mid),
        },
        Expr::Select(cond) => match eval(cond, input)? {
            Some(v) if truthy(&v) => Ok(Some(input.clone())),
            _ => Ok(None),
        },
        Expr::Contains(arg) => {
            let needle = match eval(arg, input)? {
                Some(Value::String(s)) => s,
                Some(other) => {
                    return Err(format!("contains() needs a string, got {other}"));
                }
                None => return Ok(None),
            };
            match input {
                Value::String(haystack) => Ok(Some(Value::Bool(haystack.contains(&needle)))),
                other => Err(format!("contains() applied to non-string {other}")),
            }
        }
        Expr::And(left, right) => {
            let l = eval(left, input)?.map(|v| truthy(&v)).unwrap_or(false);
            let r = eval(right, input)?.map(|v| truthy(&v)).unwrap_or(false);
            Ok(Some(Value::Bool(l && r)))
        }
        Expr::Or(left, right) => {
            let l = eval(left, input)?.map(|v| truthy(&v)).unwrap_or(false);
            let r = eval(right, input)?.map(|v| truthy(&v)).unwrap_or(false);
            Ok(Some(Value::Bool(l || r)))
        }
        Expr::Not => Ok(Some(Value::Bool(!truthy(input)))),
        Expr::Eq(left, right) => compare(left, right, input).map(|b| Some(Value::Bool(b))),
        Expr::Ne(left, right) => compare(left, right, input).map(|b| Some(Value::Bool(!b))),
    }
}

fn compare(left: &Expr, right: &Expr, input: &Value) -> Result<bool, String> {
    let l = eval(left, input)?;
    let r = eval(right, input)?;
    let (Some(l), Some(r)) = (l, r) else {
        return Ok(false);
    };
    for side in [&l, &r] {
        if side.is_object() || side.is_array() {
            return Err(format!("equality is only defined on scalars, got {side}"));
        }
    }
    // Literals lex as f64, so 200 and 200.0 must compare equal.
    if let (Value::Number(ln), Value::Number(rn)) = (&l, &r) {
        return Ok(ln.as_f64() == rn.as_f64());
    }
    Ok(l == r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry() -> Value {
        json!({
            "request": {"method": "GET", "url": "http://example.com/api/items.json"},
            "response": {"status": 200, "content": {"text": "hello world"}},
        })
    }

    #[test]
    fn identity_passes_through() {
        let program = compile(".").unwrap();
        assert_eq!(program.apply(&entry()).unwrap(), Some(entry()));
    }

    #[test]
    fn field_projection() {
        let program = compile(".request.url").unwrap();
        assert_eq!(
            program.apply(&entry()).unwrap(),
            Some(json!("http://example.com/api/items.json"))
        );
    }

    #[test]
    fn bracket_index() {
        let program = compile(r#".["request"].method"#).unwrap();
        assert_eq!(program.apply(&entry()).unwrap(), Some(json!("GET")));
    }

    #[test]
    fn missing_field_is_null() {
        let program = compile(".request.missing.deeper").unwrap();
        assert_eq!(program.apply(&entry()).unwrap(), Some(Value::Null));
    }

    #[test]
    fn select_keeps_matching_input() {
        let program = compile("select(.response.status == 200)").unwrap();
        assert_eq!(program.apply(&entry()).unwrap(), Some(entry()));
    }

    #[test]
    fn select_drops_non_matching_input() {
        let program = compile("select(.response.status == 404)").unwrap();
        assert_eq!(program.apply(&entry()).unwrap(), None);
    }

    #[test]
    fn pipe_select_then_project() {
        let program = compile("select(.request.method == \"GET\") | .request.url").unwrap();
        assert_eq!(
            program.apply(&entry()).unwrap(),
            Some(json!("http://example.com/api/items.json"))
        );
    }

    #[test]
    fn contains_on_projected_string() {
        let program = compile(".request.url | contains(\".json\")").unwrap();
        assert_eq!(program.apply(&entry()).unwrap(), Some(json!(true)));
    }

    #[test]
    fn boolean_composition_and_not() {
        let program = compile(
            "select((.request.method == \"GET\") and (.response.status == 200)) | .request.method",
        )
        .unwrap();
        assert_eq!(program.apply(&entry()).unwrap(), Some(json!("GET")));

        let program = compile(".response.status == 404 | not").unwrap();
        assert_eq!(program.apply(&entry()).unwrap(), Some(json!(true)));
    }

    #[test]
    fn unsupported_construct_is_rejected_with_offset() {
        let err = compile(".request | map(.url)").unwrap_err();
        assert_eq!(err.token, "map");
        assert_eq!(err.offset, 11);
        assert!(err.to_string().contains("unsupported construct"));

        assert!(compile(".a + .b").is_err());
        assert!(compile(".items[]").is_err());
        assert!(compile("select(.x").is_err());
    }

    #[test]
    fn equality_rejects_composites_at_runtime() {
        let program = compile(".request == .response").unwrap();
        assert!(program.apply(&entry()).is_err());
    }
}
