//! HAR 1.2 document model and the two emit paths: batch assembly at stop
//! time, and per-entry line-delimited streaming.

use std::io::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{HarError, Result};

pub const HAR_VERSION: &str = "1.2";
pub const CREATOR_NAME: &str = "chrome-har-cli";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Har {
    pub log: Log,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Log {
    pub version: String,
    pub creator: Creator,
    pub pages: Vec<Page>,
    pub entries: Vec<Entry>,
    /// Custom extension: WebSocket connections recorded during the session.
    #[serde(rename = "_websockets", skip_serializing_if = "Option::is_none")]
    pub websockets: Option<Vec<WebSocketExport>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Creator {
    pub name: String,
    pub version: String,
}

impl Creator {
    pub fn this_tool() -> Self {
        Self {
            name: CREATOR_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page {
    #[serde(rename = "startedDateTime")]
    pub started_date_time: String,
    pub id: String,
    pub title: String,
    #[serde(rename = "pageTimings")]
    pub page_timings: PageTimings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PageTimings {
    #[serde(rename = "onContentLoad", skip_serializing_if = "Option::is_none")]
    pub on_content_load: Option<f64>,
    #[serde(rename = "onLoad", skip_serializing_if = "Option::is_none")]
    pub on_load: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    #[serde(rename = "pageref", skip_serializing_if = "Option::is_none")]
    pub pageref: Option<String>,
    #[serde(rename = "startedDateTime")]
    pub started_date_time: String,
    /// Total elapsed milliseconds.
    pub time: f64,
    pub request: Request,
    pub response: Response,
    pub cache: Cache,
    pub timings: Timings,
    /// Custom extension: ties a synthesized WebSocket entry back to its
    /// connection in `log._websockets`.
    #[serde(
        rename = "_webSocketId",
        skip_serializing_if = "Option::is_none"
    )]
    pub websocket_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub method: String,
    pub url: String,
    #[serde(rename = "httpVersion")]
    pub http_version: String,
    pub cookies: Vec<Cookie>,
    pub headers: Vec<Header>,
    #[serde(rename = "queryString")]
    pub query_string: Vec<QueryStringPair>,
    #[serde(rename = "postData", skip_serializing_if = "Option::is_none")]
    pub post_data: Option<PostData>,
    #[serde(rename = "headersSize")]
    pub headers_size: i64,
    #[serde(rename = "bodySize")]
    pub body_size: i64,
}

impl Request {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        let query_string = parse_query_string(&url);
        Self {
            method: method.into(),
            url,
            http_version: "HTTP/1.1".to_string(),
            cookies: Vec::new(),
            headers: Vec::new(),
            query_string,
            post_data: None,
            headers_size: -1,
            body_size: -1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub status: i64,
    #[serde(rename = "statusText")]
    pub status_text: String,
    #[serde(rename = "httpVersion")]
    pub http_version: String,
    pub cookies: Vec<Cookie>,
    pub headers: Vec<Header>,
    pub content: Content,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    #[serde(rename = "headersSize")]
    pub headers_size: i64,
    #[serde(rename = "bodySize")]
    pub body_size: i64,
}

impl Response {
    pub fn empty() -> Self {
        Self {
            status: 0,
            status_text: String::new(),
            http_version: "HTTP/1.1".to_string(),
            cookies: Vec::new(),
            headers: Vec::new(),
            content: Content::default(),
            redirect_url: String::new(),
            headers_size: -1,
            body_size: -1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Content {
    pub size: i64,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(rename = "httpOnly", skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(rename = "sameSite", skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

impl Cookie {
    pub fn pair(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            expires: None,
            http_only: None,
            secure: None,
            same_site: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryStringPair {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Cache {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Timings {
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
}

impl Timings {
    pub fn wait_only(wait: f64) -> Self {
        Self {
            send: 0.0,
            wait: wait.max(0.0),
            receive: 0.0,
        }
    }

    pub fn total(&self) -> f64 {
        self.send + self.wait + self.receive
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebSocketExport {
    pub id: String,
    pub url: String,
    pub state: String,
    #[serde(rename = "openedAt")]
    pub opened_at: String,
    #[serde(rename = "closedAt", skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<String>,
    #[serde(rename = "closeCode", skip_serializing_if = "Option::is_none")]
    pub close_code: Option<i64>,
    #[serde(rename = "closeReason", skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub extensions: Vec<String>,
    pub frames: Vec<WebSocketFrameExport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebSocketFrameExport {
    pub direction: String,
    pub opcode: u8,
    #[serde(rename = "typeTag")]
    pub type_tag: String,
    pub size: usize,
    pub timestamp: String,
    pub payload: String,
    #[serde(rename = "payloadEncoding", skip_serializing_if = "Option::is_none")]
    pub payload_encoding: Option<String>,
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_query_string(url: &str) -> Vec<QueryStringPair> {
    let Ok(parsed) = url::Url::parse(url) else {
        return Vec::new();
    };
    parsed
        .query_pairs()
        .map(|(name, value)| QueryStringPair {
            name: name.into_owned(),
            value: value.into_owned(),
        })
        .collect()
}

/// Assembles the final document from already-filtered entries.
pub fn assemble(
    pages: Vec<Page>,
    entries: Vec<Entry>,
    websockets: Option<Vec<WebSocketExport>>,
) -> Har {
    Har {
        log: Log {
            version: HAR_VERSION.to_string(),
            creator: Creator::this_tool(),
            pages,
            entries,
            websockets,
        },
    }
}

pub fn to_pretty_json(har: &Har) -> Result<String> {
    serde_json::to_string_pretty(har).map_err(|e| HarError::Serialization(e.to_string()))
}

/// Destination for streamed entries: one JSON value (or raw template output)
/// per line.
pub struct StreamSink {
    writer: Box<dyn Write + Send>,
}

impl StreamSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self { writer }
    }

    pub fn emit_entry(&mut self, entry: &Entry) -> Result<()> {
        let line =
            serde_json::to_string(entry).map_err(|e| HarError::Serialization(e.to_string()))?;
        self.writeln(line.as_bytes())
    }

    pub fn emit_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writeln(bytes)
    }

    fn writeln(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> Entry {
        let mut request = Request::new("GET", "http://example.com/a?x=1&y=2");
        request.headers.push(Header {
            name: "Accept".into(),
            value: "*/*".into(),
        });
        let mut response = Response::empty();
        response.status = 200;
        response.status_text = "OK".into();
        response.content = Content {
            size: 5,
            mime_type: "text/plain".into(),
            text: Some("hello".into()),
            encoding: None,
        };
        Entry {
            pageref: Some("page_1".into()),
            started_date_time: "2026-01-01T00:00:00.000Z".into(),
            time: 12.5,
            request,
            response,
            cache: Cache::default(),
            timings: Timings::wait_only(12.5),
            websocket_id: None,
        }
    }

    #[test]
    fn query_string_is_decomposed() {
        let request = Request::new("GET", "http://example.com/a?x=1&y=2");
        assert_eq!(request.query_string.len(), 2);
        assert_eq!(request.query_string[0].name, "x");
        assert_eq!(request.query_string[1].value, "2");
    }

    #[test]
    fn serializes_camel_case_har_fields() {
        let har = assemble(Vec::new(), vec![sample_entry()], None);
        let json = to_pretty_json(&har).unwrap();
        assert!(json.contains("\"startedDateTime\""));
        assert!(json.contains("\"httpVersion\""));
        assert!(json.contains("\"mimeType\""));
        assert!(json.contains("\"version\": \"1.2\""));
        assert!(!json.contains("_websockets"));
    }

    #[test]
    fn round_trip_is_byte_stable() {
        let har = assemble(
            Vec::new(),
            vec![sample_entry()],
            Some(vec![WebSocketExport {
                id: "ws1".into(),
                url: "ws://example.com/echo".into(),
                state: "closed".into(),
                opened_at: "2026-01-01T00:00:00.000Z".into(),
                closed_at: None,
                close_code: Some(1000),
                close_reason: None,
                protocol: None,
                extensions: Vec::new(),
                frames: vec![WebSocketFrameExport {
                    direction: "sent".into(),
                    opcode: 1,
                    type_tag: "text".into(),
                    size: 4,
                    timestamp: "2026-01-01T00:00:00.100Z".into(),
                    payload: "ping".into(),
                    payload_encoding: None,
                }],
            }]),
        );
        let first = to_pretty_json(&har).unwrap();
        let reparsed: Har = serde_json::from_str(&first).unwrap();
        let second = to_pretty_json(&reparsed).unwrap();
        assert_eq!(first, second);
        assert_eq!(har, reparsed);
    }

    #[test]
    fn stream_sink_writes_one_line_per_entry() {
        let buffer: Vec<u8> = Vec::new();
        let shared = std::sync::Arc::new(std::sync::Mutex::new(buffer));
        struct SharedWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);
        impl Write for SharedWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut sink = StreamSink::new(Box::new(SharedWriter(shared.clone())));
        sink.emit_entry(&sample_entry()).unwrap();
        sink.emit_raw(b"raw-line").unwrap();

        let written = String::from_utf8(shared.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('{'));
        assert_eq!(lines[1], "raw-line");
        let parsed: Entry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.response.status, 200);
    }
}
