//! Capture- and emit-time predicates compiled once per session.

pub mod query;
pub mod template;

use regex::Regex;

use crate::har::{Content, Entry};
use crate::{HarError, Result};

/// Raw pattern strings as they arrive from the CLI. Each field name doubles
/// as the option reported on compile failure.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    pub url_include: Option<String>,
    pub block: Option<String>,
    pub omit: Option<String>,
    pub cookie_name: Option<String>,
    /// JSON-query projection; mutually exclusive with `template`.
    pub query: Option<String>,
    /// Text-template projection; mutually exclusive with `query`.
    pub template: Option<String>,
}

#[derive(Debug, Clone)]
enum Projection {
    Query(query::Program),
    Template(template::Template),
}

/// Result of running the projection over one entry.
#[derive(Debug, Clone)]
pub enum Projected {
    Entry(Entry),
    Raw(Vec<u8>),
    Drop,
}

#[derive(Debug, Clone, Default)]
pub struct Filters {
    url_include: Option<Regex>,
    block: Option<Regex>,
    omit: Option<Regex>,
    cookie_name: Option<Regex>,
    projection: Option<Projection>,
}

fn compile_regex(option: &str, pattern: &Option<String>) -> Result<Option<Regex>> {
    match pattern {
        None => Ok(None),
        Some(raw) => Regex::new(raw)
            .map(Some)
            .map_err(|e| HarError::config(option, e.to_string())),
    }
}

impl Filters {
    pub fn compile(spec: &FilterSpec) -> Result<Self> {
        if spec.query.is_some() && spec.template.is_some() {
            return Err(HarError::config(
                "--template",
                "cannot be combined with --filter",
            ));
        }

        let projection = if let Some(source) = &spec.query {
            Some(Projection::Query(
                query::compile(source).map_err(|e| HarError::config("--filter", e.to_string()))?,
            ))
        } else if let Some(source) = &spec.template {
            Some(Projection::Template(
                template::compile(source)
                    .map_err(|e| HarError::config("--template", e.to_string()))?,
            ))
        } else {
            None
        };

        Ok(Self {
            url_include: compile_regex("--url-pattern", &spec.url_include)?,
            block: compile_regex("--block-pattern", &spec.block)?,
            omit: compile_regex("--omit-pattern", &spec.omit)?,
            cookie_name: compile_regex("--cookie-pattern", &spec.cookie_name)?,
            projection,
        })
    }

    /// Whether a request should enter the tables at all.
    pub fn should_capture(&self, url: &str) -> bool {
        self.url_include
            .as_ref()
            .map(|re| re.is_match(url))
            .unwrap_or(true)
    }

    /// Whether the browser should be told to block this URL.
    pub fn should_block(&self, url: &str) -> bool {
        self.block
            .as_ref()
            .map(|re| re.is_match(url))
            .unwrap_or(false)
    }

    /// Whether a completed entry survives into the output.
    pub fn should_emit(&self, url: &str) -> bool {
        !self
            .omit
            .as_ref()
            .map(|re| re.is_match(url))
            .unwrap_or(false)
    }

    pub fn cookie_matches(&self, name: &str) -> bool {
        self.cookie_name
            .as_ref()
            .map(|re| re.is_match(name))
            .unwrap_or(true)
    }

    pub fn has_projection(&self) -> bool {
        self.projection.is_some()
    }

    /// Runs the configured projection over one entry.
    ///
    /// A query returning the entry unchanged passes it through; any other
    /// value is re-shaped into an entry shell whose response body carries the
    /// projected payload. A template renders to raw bytes.
    pub fn apply_projection(&self, entry: &Entry) -> Result<Projected> {
        let Some(projection) = &self.projection else {
            return Ok(Projected::Entry(entry.clone()));
        };

        let as_json =
            serde_json::to_value(entry).map_err(|e| HarError::Projection(e.to_string()))?;

        match projection {
            Projection::Query(program) => {
                match program.apply(&as_json).map_err(HarError::Projection)? {
                    None => Ok(Projected::Drop),
                    Some(value) if value == as_json => Ok(Projected::Entry(entry.clone())),
                    Some(value) => {
                        let (text, mime_type) = match value {
                            serde_json::Value::String(s) => (s, "text/plain".to_string()),
                            other => (
                                serde_json::to_string(&other)
                                    .map_err(|e| HarError::Projection(e.to_string()))?,
                                "application/json".to_string(),
                            ),
                        };
                        let mut shell = entry.clone();
                        shell.response.content = Content {
                            size: text.len() as i64,
                            mime_type,
                            text: Some(text),
                            encoding: None,
                        };
                        Ok(Projected::Entry(shell))
                    }
                }
            }
            Projection::Template(template) => {
                let rendered = template.render(&as_json).map_err(HarError::Projection)?;
                Ok(Projected::Raw(rendered.into_bytes()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::har::{Cache, Request, Response, Timings};

    fn entry(url: &str, status: i64) -> Entry {
        let mut response = Response::empty();
        response.status = status;
        response.status_text = "OK".into();
        Entry {
            pageref: None,
            started_date_time: "2026-01-01T00:00:00.000Z".into(),
            time: 1.0,
            request: Request::new("GET", url),
            response,
            cache: Cache::default(),
            timings: Timings::wait_only(1.0),
            websocket_id: None,
        }
    }

    #[test]
    fn url_include_gates_capture() {
        let filters = Filters::compile(&FilterSpec {
            url_include: Some(r".*\.json$".into()),
            ..Default::default()
        })
        .unwrap();
        assert!(filters.should_capture("http://x/a.json"));
        assert!(!filters.should_capture("http://x/b.html"));
        assert!(filters.should_emit("http://x/b.html"));
    }

    #[test]
    fn block_and_omit_are_opt_in() {
        let filters = Filters::compile(&FilterSpec::default()).unwrap();
        assert!(!filters.should_block("http://ads.doubleclick.net/x"));
        assert!(filters.should_emit("http://x/a"));
        assert!(filters.cookie_matches("session"));

        let filters = Filters::compile(&FilterSpec {
            block: Some(".*doubleclick.*".into()),
            omit: Some(r".*\.png$".into()),
            ..Default::default()
        })
        .unwrap();
        assert!(filters.should_block("http://ads.doubleclick.net/x"));
        assert!(!filters.should_emit("http://x/logo.png"));
    }

    #[test]
    fn compile_errors_name_the_option() {
        let err = Filters::compile(&FilterSpec {
            url_include: Some("(".into()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("--url-pattern"));

        let err = Filters::compile(&FilterSpec {
            query: Some(".a | map(.b)".into()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("--filter"));
        assert!(err.to_string().contains("map"));
    }

    #[test]
    fn query_passthrough_drop_and_reshape() {
        let filters = Filters::compile(&FilterSpec {
            query: Some("select(.response.status == 200)".into()),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            filters.apply_projection(&entry("http://x/a", 200)).unwrap(),
            Projected::Entry(_)
        ));
        assert!(matches!(
            filters.apply_projection(&entry("http://x/a", 404)).unwrap(),
            Projected::Drop
        ));

        let filters = Filters::compile(&FilterSpec {
            query: Some(".request.url".into()),
            ..Default::default()
        })
        .unwrap();
        match filters.apply_projection(&entry("http://x/a", 200)).unwrap() {
            Projected::Entry(shell) => {
                assert_eq!(shell.response.content.text.as_deref(), Some("http://x/a"));
                assert_eq!(shell.response.content.mime_type, "text/plain");
            }
            other => panic!("expected reshaped entry, got {other:?}"),
        }
    }

    #[test]
    fn template_projects_raw_bytes() {
        let filters = Filters::compile(&FilterSpec {
            template: Some("{{.request.method}} {{.request.url}}".into()),
            ..Default::default()
        })
        .unwrap();
        match filters.apply_projection(&entry("http://x/a", 200)).unwrap() {
            Projected::Raw(bytes) => assert_eq!(bytes, b"GET http://x/a"),
            other => panic!("expected raw bytes, got {other:?}"),
        }
    }
}
