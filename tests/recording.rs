//! End-to-end recording scenarios driven by synthetic CDP event streams.
//!
//! These exercise the full session pipeline (dispatch, tables, body fetch
//! pool, stability counters, HAR assembly) without a live browser. Anything
//! that needs a real Chromium run lives behind `#[ignore]`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use chrome_har_cli::HarError;
use chrome_har_cli::cdp::{
    BodyData, FrameData, HeaderList, NetworkEvent, PageCommands, ProfileCookie, ResponseData,
    SessionEvent, WebSocketEvent,
};
use chrome_har_cli::config::{RecorderOptions, StabilityConfig};
use chrome_har_cli::filters::{FilterSpec, Filters};
use chrome_har_cli::har::Har;
use chrome_har_cli::session::{RecordingSession, WaitUntil};

struct FakePage {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    blocked: Mutex<Vec<String>>,
    profile_cookies: Mutex<Vec<ProfileCookie>>,
}

impl FakePage {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bodies: Mutex::new(HashMap::new()),
            blocked: Mutex::new(Vec::new()),
            profile_cookies: Mutex::new(Vec::new()),
        })
    }

    fn with_body(self: Arc<Self>, request_id: &str, bytes: &[u8]) -> Arc<Self> {
        self.bodies
            .lock()
            .unwrap()
            .insert(request_id.to_string(), bytes.to_vec());
        self
    }

    fn with_profile_cookie(self: Arc<Self>, cookie: ProfileCookie) -> Arc<Self> {
        self.profile_cookies.lock().unwrap().push(cookie);
        self
    }
}

#[async_trait]
impl PageCommands for FakePage {
    async fn fetch_response_body(&self, request_id: &str) -> chrome_har_cli::Result<BodyData> {
        self.bodies
            .lock()
            .unwrap()
            .get(request_id)
            .map(|bytes| BodyData {
                bytes: bytes.clone(),
                was_base64: false,
            })
            .ok_or_else(|| HarError::BodyFetch {
                request_id: request_id.to_string(),
                message: "no body".to_string(),
            })
    }

    async fn block_urls(&self, patterns: Vec<String>) -> chrome_har_cli::Result<()> {
        *self.blocked.lock().unwrap() = patterns;
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> chrome_har_cli::Result<serde_json::Value> {
        if expression.contains("document.readyState") {
            return Ok(json!("complete"));
        }
        if expression.contains("__harStability") {
            return Ok(json!(0));
        }
        if expression.contains("JSON.stringify(pending)") {
            return Ok(json!("[]"));
        }
        Ok(serde_json::Value::Null)
    }

    async fn install_on_new_document(&self, _script: &str) -> chrome_har_cli::Result<()> {
        Ok(())
    }

    async fn navigate(&self, _url: &str) -> chrome_har_cli::Result<()> {
        Ok(())
    }

    async fn read_cookies(&self) -> chrome_har_cli::Result<Vec<ProfileCookie>> {
        Ok(self.profile_cookies.lock().unwrap().clone())
    }

    async fn set_cookie(&self, _cookie: ProfileCookie) -> chrome_har_cli::Result<()> {
        Ok(())
    }

    async fn set_extra_headers(&self, _headers: HeaderList) -> chrome_har_cli::Result<()> {
        Ok(())
    }

    async fn screenshot_png(&self) -> chrome_har_cli::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn page_content(&self) -> chrome_har_cli::Result<String> {
        Ok("<html></html>".to_string())
    }
}

struct Harness {
    session: Arc<RecordingSession>,
    events: tokio::sync::mpsc::UnboundedSender<SessionEvent>,
}

async fn harness(page: Arc<FakePage>, filters: FilterSpec, options: RecorderOptions) -> Harness {
    let filters = Filters::compile(&filters).unwrap();
    let stability = StabilityConfig {
        network_idle_duration: Duration::from_millis(50),
        dom_stable_duration: Duration::from_millis(50),
        max_total_wait: Duration::from_secs(2),
        ..Default::default()
    };
    let session = RecordingSession::new(page, filters, stability, options, None);
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    session.start(rx).await.unwrap();
    Harness {
        session,
        events: tx,
    }
}

fn request(id: &str, url: &str, ts: f64) -> SessionEvent {
    SessionEvent::Network(NetworkEvent::RequestWillBeSent {
        request_id: id.to_string(),
        url: url.to_string(),
        method: "GET".to_string(),
        headers: vec![("Accept".to_string(), "*/*".to_string())],
        post_data: None,
        redirect_response: None,
        timestamp: ts,
        wall_time: 1_760_000_000.0 + ts,
    })
}

fn response(id: &str, status: i64, mime: &str, ts: f64) -> SessionEvent {
    SessionEvent::Network(NetworkEvent::ResponseReceived {
        request_id: id.to_string(),
        response: ResponseData {
            status,
            status_text: match status {
                200 => "OK",
                301 => "Moved Permanently",
                _ => "",
            }
            .to_string(),
            protocol: Some("http/1.1".to_string()),
            headers: vec![("Content-Type".to_string(), mime.to_string())],
            mime_type: mime.to_string(),
            encoded_data_length: 0.0,
        },
        timestamp: ts,
    })
}

fn finished(id: &str, ts: f64, length: f64) -> SessionEvent {
    SessionEvent::Network(NetworkEvent::LoadingFinished {
        request_id: id.to_string(),
        timestamp: ts,
        encoded_data_length: length,
    })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

fn page_entries(har: &Har) -> Vec<&chrome_har_cli::har::Entry> {
    har.log
        .entries
        .iter()
        .filter(|e| e.pageref.as_deref() == Some("page_1"))
        .collect()
}

#[tokio::test]
async fn single_get_produces_one_entry() {
    let page = FakePage::new().with_body("1", b"hello");
    let h = harness(page, FilterSpec::default(), RecorderOptions::default()).await;

    h.events.send(request("1", "http://test.local/a", 1.0)).unwrap();
    h.events.send(response("1", 200, "text/plain", 1.1)).unwrap();
    h.events.send(finished("1", 1.2, 5.0)).unwrap();
    settle().await;

    let har = h.session.stop().await.unwrap();
    let entries = page_entries(&har);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].request.method, "GET");
    assert!(entries[0].request.url.ends_with("/a"));
    assert_eq!(entries[0].response.status, 200);
    assert_eq!(entries[0].response.content.text.as_deref(), Some("hello"));
    assert_eq!(har.log.version, "1.2");
}

#[tokio::test]
async fn redirect_chain_emits_both_hops_in_order() {
    let page = FakePage::new().with_body("1", b"ok");
    let h = harness(page, FilterSpec::default(), RecorderOptions::default()).await;

    h.events.send(request("1", "http://test.local/x", 1.0)).unwrap();
    h.events
        .send(SessionEvent::Network(NetworkEvent::RequestWillBeSent {
            request_id: "1".to_string(),
            url: "http://test.local/y".to_string(),
            method: "GET".to_string(),
            headers: Vec::new(),
            post_data: None,
            redirect_response: Some(ResponseData {
                status: 301,
                status_text: "Moved Permanently".to_string(),
                protocol: Some("http/1.1".to_string()),
                headers: vec![("Location".to_string(), "/y".to_string())],
                mime_type: String::new(),
                encoded_data_length: 120.0,
            }),
            timestamp: 1.5,
            wall_time: 1_760_000_001.5,
        }))
        .unwrap();
    h.events.send(response("1", 200, "text/plain", 1.6)).unwrap();
    h.events.send(finished("1", 1.7, 2.0)).unwrap();
    settle().await;

    let har = h.session.stop().await.unwrap();
    let entries = page_entries(&har);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].response.status, 301);
    assert!(entries[0].request.url.ends_with("/x"));
    assert_eq!(entries[1].response.status, 200);
    assert!(entries[1].request.url.ends_with("/y"));
    assert_eq!(entries[1].response.content.text.as_deref(), Some("ok"));
}

#[tokio::test]
async fn url_pattern_keeps_only_matching_requests() {
    let page = FakePage::new().with_body("1", b"{}").with_body("3", b"{}");
    let h = harness(
        page,
        FilterSpec {
            url_include: Some(r".*\.json$".into()),
            ..Default::default()
        },
        RecorderOptions::default(),
    )
    .await;

    for (id, url, ts) in [
        ("1", "http://test.local/a.json", 1.0),
        ("2", "http://test.local/b.html", 2.0),
        ("3", "http://test.local/c.json", 3.0),
    ] {
        h.events.send(request(id, url, ts)).unwrap();
        h.events.send(response(id, 200, "application/json", ts + 0.1)).unwrap();
        h.events.send(finished(id, ts + 0.2, 2.0)).unwrap();
    }
    settle().await;

    let har = h.session.stop().await.unwrap();
    let entries = page_entries(&har);
    assert_eq!(entries.len(), 2);
    assert!(entries[0].request.url.ends_with("/a.json"));
    assert!(entries[1].request.url.ends_with("/c.json"));
}

#[tokio::test]
async fn block_pattern_reaches_browser_and_har_stays_clean() {
    let page = FakePage::new().with_body("2", b"page");
    let h = harness(
        page.clone(),
        FilterSpec {
            block: Some(".*doubleclick.*".into()),
            ..Default::default()
        },
        RecorderOptions::default(),
    )
    .await;

    h.events
        .send(request("1", "http://ads.doubleclick.net/pixel", 1.0))
        .unwrap();
    h.events.send(request("2", "http://test.local/page", 2.0)).unwrap();
    h.events.send(response("2", 200, "text/html", 2.1)).unwrap();
    h.events.send(finished("2", 2.2, 4.0)).unwrap();
    settle().await;

    let har = h.session.stop().await.unwrap();
    let entries = page_entries(&har);
    assert_eq!(entries.len(), 1);
    assert!(!entries.iter().any(|e| e.request.url.contains("doubleclick")));
    assert!(entries[0].request.url.ends_with("/page"));
    assert_eq!(
        *page.blocked.lock().unwrap(),
        vec!["http://ads.doubleclick.net/pixel".to_string()]
    );
}

#[tokio::test]
async fn websocket_echo_records_connection_and_frames() {
    let page = FakePage::new();
    let h = harness(
        page,
        FilterSpec::default(),
        RecorderOptions {
            websockets: true,
            ..Default::default()
        },
    )
    .await;

    let ws = |event| SessionEvent::WebSocket(event);
    h.events
        .send(ws(WebSocketEvent::Created {
            request_id: "ws1".to_string(),
            url: "ws://test.local/echo".to_string(),
        }))
        .unwrap();
    h.events
        .send(ws(WebSocketEvent::HandshakeRequestSent {
            request_id: "ws1".to_string(),
            headers: vec![("Upgrade".to_string(), "websocket".to_string())],
            timestamp: 1.0,
            wall_time: 1_760_000_000.0,
        }))
        .unwrap();
    h.events
        .send(ws(WebSocketEvent::HandshakeResponseReceived {
            request_id: "ws1".to_string(),
            status: 101,
            status_text: "Switching Protocols".to_string(),
            headers: Vec::new(),
            timestamp: 1.05,
        }))
        .unwrap();
    h.events
        .send(ws(WebSocketEvent::FrameSent {
            request_id: "ws1".to_string(),
            frame: FrameData {
                opcode: 0x1,
                mask: true,
                payload_data: "ping".to_string(),
            },
            timestamp: 1.1,
        }))
        .unwrap();
    h.events
        .send(ws(WebSocketEvent::FrameReceived {
            request_id: "ws1".to_string(),
            frame: FrameData {
                opcode: 0x1,
                mask: false,
                payload_data: "ping".to_string(),
            },
            timestamp: 1.2,
        }))
        .unwrap();
    h.events
        .send(ws(WebSocketEvent::Closed {
            request_id: "ws1".to_string(),
            timestamp: 1.3,
        }))
        .unwrap();
    settle().await;

    let har = h.session.stop().await.unwrap();
    let websockets = har.log.websockets.as_ref().unwrap();
    assert_eq!(websockets.len(), 1);
    let conn = &websockets[0];
    assert_eq!(conn.state, "closed");
    assert_eq!(conn.frames.len(), 2);
    assert_eq!(conn.frames[0].direction, "sent");
    assert_eq!(conn.frames[0].type_tag, "text");
    assert_eq!(conn.frames[0].payload, "ping");
    assert_eq!(conn.frames[1].direction, "received");
    assert_eq!(conn.frames[1].payload, "ping");

    let snapshot = h.session.websocket().snapshot("ws1").unwrap();
    assert_eq!(snapshot.counters.messages_sent, 1);
    assert_eq!(snapshot.counters.messages_received, 1);

    // The synthesized entry ties back to the connection.
    let ws_entry = har
        .log
        .entries
        .iter()
        .find(|e| e.websocket_id.as_deref() == Some("ws1"))
        .unwrap();
    assert_eq!(ws_entry.response.status, 101);
}

#[tokio::test]
async fn stability_timeout_names_network_idle() {
    let page = FakePage::new();
    let filters = Filters::compile(&FilterSpec::default()).unwrap();
    let stability = StabilityConfig {
        network_idle_inflight_threshold: 0,
        network_idle_duration: Duration::from_millis(300),
        max_total_wait: Duration::from_millis(700),
        ..Default::default()
    };
    let session = RecordingSession::new(
        page.clone(),
        filters,
        stability,
        RecorderOptions::default(),
        None,
    );
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    session.start(rx).await.unwrap();

    // A request that never finishes keeps the network busy.
    tx.send(request("1", "http://test.local/poll", 1.0)).unwrap();
    settle().await;

    let err = session
        .navigate("http://test.local/", WaitUntil::Stable, Duration::from_secs(5))
        .await
        .unwrap_err();
    match err {
        HarError::StabilityTimeout(diagnostics) => {
            assert!(diagnostics.unsatisfied.contains(&"networkIdle".to_string()));
            assert!(diagnostics.in_flight_requests > 0);
        }
        other => panic!("expected stability timeout, got {other}"),
    }
}

#[tokio::test]
async fn profile_cookies_become_a_synthetic_page() {
    let page = FakePage::new().with_profile_cookie(ProfileCookie {
        name: "sid".to_string(),
        value: "abc".to_string(),
        domain: "test.local".to_string(),
        path: "/".to_string(),
        expires: None,
        http_only: true,
        secure: false,
        same_site: Some("Lax".to_string()),
    });
    let h = harness(page, FilterSpec::default(), RecorderOptions::default()).await;
    settle().await;

    let har = h.session.stop().await.unwrap();
    assert!(har.log.pages.iter().any(|p| p.id == "profile_cookies"));
    let entry = har
        .log
        .entries
        .iter()
        .find(|e| e.pageref.as_deref() == Some("profile_cookies"))
        .unwrap();
    assert_eq!(entry.request.cookies.len(), 1);
    assert_eq!(entry.request.cookies[0].name, "sid");
    assert!(entry.response.content.text.is_none());
}

#[tokio::test]
async fn stop_twice_returns_the_same_document() {
    let page = FakePage::new().with_body("1", b"hello");
    let h = harness(page, FilterSpec::default(), RecorderOptions::default()).await;

    h.events.send(request("1", "http://test.local/a", 1.0)).unwrap();
    h.events.send(response("1", 200, "text/plain", 1.1)).unwrap();
    h.events.send(finished("1", 1.2, 5.0)).unwrap();
    settle().await;

    let first = h.session.stop().await.unwrap();
    let second = h.session.stop().await.unwrap();
    assert_eq!(first, second);

    // Close from stopped state is a no-op that stays safe to repeat.
    h.session.close();
    h.session.close();
}

#[tokio::test]
async fn serialized_document_round_trips() {
    let page = FakePage::new().with_body("1", b"hello");
    let h = harness(page, FilterSpec::default(), RecorderOptions::default()).await;

    h.events.send(request("1", "http://test.local/a", 1.0)).unwrap();
    h.events.send(response("1", 200, "text/plain", 1.1)).unwrap();
    h.events.send(finished("1", 1.2, 5.0)).unwrap();
    settle().await;

    let har = h.session.stop().await.unwrap();
    let json = chrome_har_cli::har::to_pretty_json(&har).unwrap();
    let reparsed: Har = serde_json::from_str(&json).unwrap();
    let json_again = chrome_har_cli::har::to_pretty_json(&reparsed).unwrap();
    assert_eq!(json, json_again);
}

#[tokio::test]
async fn finished_document_is_written_to_an_output_path() {
    let page = FakePage::new().with_body("1", b"hello");
    let h = harness(page, FilterSpec::default(), RecorderOptions::default()).await;

    h.events.send(request("1", "http://test.local/a", 1.0)).unwrap();
    h.events.send(response("1", 200, "text/plain", 1.1)).unwrap();
    h.events.send(finished("1", 1.2, 5.0)).unwrap();
    settle().await;

    let har = h.session.stop().await.unwrap();
    let file = tempfile::NamedTempFile::new().unwrap();
    chrome_har_cli::output::write_har(&har, file.path()).unwrap();

    let raw = std::fs::read_to_string(file.path()).unwrap();
    let reparsed: Har = serde_json::from_str(&raw).unwrap();
    assert_eq!(har, reparsed);
    assert_eq!(
        reparsed.log.entries[0].response.content.text.as_deref(),
        Some("hello")
    );
}

#[tokio::test]
async fn streaming_session_lands_entries_in_the_output_file() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let sink = Arc::new(Mutex::new(
        chrome_har_cli::output::stream_sink(Some(file.path())).unwrap(),
    ));

    let page = FakePage::new().with_body("1", b"hello").with_body("2", b"world");
    let filters = Filters::compile(&FilterSpec::default()).unwrap();
    let stability = StabilityConfig::default();
    let session = RecordingSession::new(
        page,
        filters,
        stability,
        RecorderOptions {
            streaming: true,
            ..Default::default()
        },
        Some(sink),
    );
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    session.start(rx).await.unwrap();

    for (id, url, ts) in [
        ("1", "http://test.local/a", 1.0),
        ("2", "http://test.local/b", 2.0),
    ] {
        tx.send(request(id, url, ts)).unwrap();
        tx.send(response(id, 200, "text/plain", ts + 0.1)).unwrap();
        tx.send(finished(id, ts + 0.2, 5.0)).unwrap();
    }
    settle().await;
    session.stop().await.unwrap();

    let raw = std::fs::read_to_string(file.path()).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2);
    for line in lines {
        let entry: chrome_har_cli::har::Entry = serde_json::from_str(line).unwrap();
        assert_eq!(entry.response.status, 200);
    }
}

#[tokio::test]
async fn projection_reshapes_batch_entries() {
    let page = FakePage::new().with_body("1", b"{\"ok\":true}");
    let h = harness(
        page,
        FilterSpec {
            query: Some("select(.response.status == 200) | .request.url".into()),
            ..Default::default()
        },
        RecorderOptions::default(),
    )
    .await;

    h.events.send(request("1", "http://test.local/api", 1.0)).unwrap();
    h.events
        .send(response("1", 200, "application/json", 1.1))
        .unwrap();
    h.events.send(finished("1", 1.2, 11.0)).unwrap();
    settle().await;

    let har = h.session.stop().await.unwrap();
    let entries = page_entries(&har);
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].response.content.text.as_deref(),
        Some("http://test.local/api")
    );
}
