//! Text-template projection: literal text with `{{.path.to.field}}`
//! placeholders resolved against the entry's JSON form.

use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateError {
    pub offset: usize,
    pub message: String,
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at byte {}", self.message, self.offset)
    }
}

impl std::error::Error for TemplateError {}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Field(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

pub fn compile(source: &str) -> Result<Template, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = source;
    let mut offset = 0;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Text(rest[..open].to_string()));
        }
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            return Err(TemplateError {
                offset: offset + open,
                message: "unclosed '{{' placeholder".to_string(),
            });
        };
        let raw_path = after_open[..close].trim();
        if raw_path.is_empty() {
            return Err(TemplateError {
                offset: offset + open,
                message: "empty placeholder".to_string(),
            });
        }
        let path: Vec<String> = raw_path
            .trim_start_matches('.')
            .split('.')
            .map(str::to_string)
            .collect();
        if path.iter().any(String::is_empty) {
            return Err(TemplateError {
                offset: offset + open,
                message: format!("malformed field path '{raw_path}'"),
            });
        }
        segments.push(Segment::Field(path));
        let consumed = open + 2 + close + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }

    Ok(Template { segments })
}

impl Template {
    /// Renders against the entry JSON. Missing fields render empty; composite
    /// values render as compact JSON.
    pub fn render(&self, input: &Value) -> Result<String, String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Field(path) => {
                    let mut current = input;
                    for key in path {
                        current = current.get(key).unwrap_or(&Value::Null);
                    }
                    match current {
                        Value::Null => {}
                        Value::String(s) => out.push_str(s),
                        Value::Number(n) => out.push_str(&n.to_string()),
                        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
                        composite => {
                            let json = serde_json::to_string(composite)
                                .map_err(|e| format!("placeholder render failed: {e}"))?;
                            out.push_str(&json);
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}
