//! WebSocket connection state, frame log, and the wait primitives the
//! orchestrator exposes.
//!
//! The connection map is guarded by one lock; each connection's frame list
//! and counters sit behind their own lock so frame appends from the dispatch
//! loop never contend with exports of other connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::header_value;
use crate::cdp::{FrameData, HeaderList, WebSocketEvent};
use crate::har::{WebSocketExport, WebSocketFrameExport, format_timestamp};
use crate::{HarError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Connecting,
    Open,
    Closed,
    Errored,
}

impl WsState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Errored => "errored",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsDirection {
    Sent,
    Received,
}

impl WsDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Received => "received",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Unknown,
}

impl FrameType {
    pub fn from_opcode(opcode: u8) -> Self {
        match opcode {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continuation => "continuation",
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Unknown => "unknown",
        }
    }

    fn is_data(&self) -> bool {
        matches!(self, Self::Text | Self::Binary | Self::Continuation)
    }
}

/// Decoded frame payload.
#[derive(Debug, Clone)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, needle: &str) -> bool {
        match self {
            Self::Text(s) => s.contains(needle),
            Self::Binary(b) => String::from_utf8_lossy(b).contains(needle),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub direction: WsDirection,
    pub opcode: u8,
    pub frame_type: FrameType,
    pub payload: Payload,
    pub at: DateTime<Utc>,
    pub mono: f64,
    pub mask: bool,
    arrived: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

#[derive(Debug)]
struct Connection {
    id: String,
    url: String,
    state: WsState,
    opened_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    close_code: Option<i64>,
    close_reason: Option<String>,
    created_mono: Option<f64>,
    handshake_latency: Option<Duration>,
    protocol: Option<String>,
    extensions: Vec<String>,
    request_headers: HeaderList,
    response_headers: HeaderList,
    error_text: Option<String>,
    frames: Vec<Frame>,
    counters: WsCounters,
}

/// Cheap copy of one connection for wait-primitive results and exports.
#[derive(Debug, Clone)]
pub struct WsSnapshot {
    pub id: String,
    pub url: String,
    pub state: WsState,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_code: Option<i64>,
    pub close_reason: Option<String>,
    pub protocol: Option<String>,
    pub handshake_latency: Option<Duration>,
    pub request_headers: HeaderList,
    pub response_headers: HeaderList,
    pub error: Option<String>,
    pub counters: WsCounters,
    pub frame_count: usize,
}

/// AND-composed frame predicate.
#[derive(Debug, Clone, Default)]
pub struct FrameFilter {
    pub url_pattern: Option<Regex>,
    pub frame_type: Option<FrameType>,
    pub direction: Option<WsDirection>,
    pub data_substring: Option<String>,
    pub min_size: Option<usize>,
    pub max_size: Option<usize>,
}

impl FrameFilter {
    fn matches_url(&self, url: &str) -> bool {
        self.url_pattern
            .as_ref()
            .map(|re| re.is_match(url))
            .unwrap_or(true)
    }

    fn matches_frame(&self, frame: &Frame) -> bool {
        if let Some(expected) = self.frame_type
            && frame.frame_type != expected
        {
            return false;
        }
        if let Some(expected) = self.direction
            && frame.direction != expected
        {
            return false;
        }
        if let Some(needle) = &self.data_substring
            && !frame.payload.contains(needle)
        {
            return false;
        }
        if let Some(min) = self.min_size
            && frame.payload.len() < min
        {
            return false;
        }
        if let Some(max) = self.max_size
            && frame.payload.len() > max
        {
            return false;
        }
        true
    }
}

pub struct WebSocketRecorder {
    connections: Mutex<HashMap<String, Arc<Mutex<Connection>>>>,
    /// Maps CDP monotonic timestamps onto the wall clock.
    anchor: Mutex<Option<(f64, DateTime<Utc>)>>,
    changed: Notify,
    session_closed: AtomicBool,
}

impl WebSocketRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            anchor: Mutex::new(None),
            changed: Notify::new(),
            session_closed: AtomicBool::new(false),
        })
    }

    /// Ends every pending wait with a connection-lost error.
    pub fn mark_session_closed(&self) {
        self.session_closed.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    fn mono_to_utc(&self, mono: f64) -> DateTime<Utc> {
        match *self.anchor.lock().unwrap() {
            Some((anchor_mono, anchor_wall)) => {
                let delta = mono - anchor_mono;
                anchor_wall + chrono::Duration::microseconds((delta * 1_000_000.0) as i64)
            }
            None => Utc::now(),
        }
    }

    pub fn handle(&self, event: WebSocketEvent) {
        match event {
            WebSocketEvent::Created { request_id, url } => {
                let mut connections = self.connections.lock().unwrap();
                connections.insert(
                    request_id.clone(),
                    Arc::new(Mutex::new(Connection {
                        id: request_id,
                        url,
                        state: WsState::Connecting,
                        opened_at: Utc::now(),
                        closed_at: None,
                        close_code: None,
                        close_reason: None,
                        created_mono: None,
                        handshake_latency: None,
                        protocol: None,
                        extensions: Vec::new(),
                        request_headers: Vec::new(),
                        response_headers: Vec::new(),
                        error_text: None,
                        frames: Vec::new(),
                        counters: WsCounters::default(),
                    })),
                );
            }
            WebSocketEvent::HandshakeRequestSent {
                request_id,
                headers,
                timestamp,
                wall_time,
            } => {
                let mut anchor = self.anchor.lock().unwrap();
                if anchor.is_none()
                    && let Some(wall) = chrono::DateTime::from_timestamp(
                        wall_time.trunc() as i64,
                        (wall_time.fract() * 1e9) as u32,
                    )
                {
                    *anchor = Some((timestamp, wall));
                }
                drop(anchor);

                let opened_at = self.mono_to_utc(timestamp);
                if let Some(conn) = self.get(&request_id) {
                    let mut conn = conn.lock().unwrap();
                    conn.request_headers = headers;
                    conn.opened_at = opened_at;
                    conn.created_mono.get_or_insert(timestamp);
                }
            }
            WebSocketEvent::HandshakeResponseReceived {
                request_id,
                status,
                status_text,
                headers,
                timestamp,
            } => {
                let Some(conn) = self.get(&request_id) else {
                    warn!(request_id = %request_id, "handshake response for unknown websocket");
                    return;
                };
                {
                    let mut conn = conn.lock().unwrap();
                    conn.protocol = header_value(&headers, "Sec-WebSocket-Protocol")
                        .map(str::to_string);
                    conn.extensions = header_value(&headers, "Sec-WebSocket-Extensions")
                        .map(|v| v.split(',').map(|e| e.trim().to_string()).collect())
                        .unwrap_or_default();
                    conn.response_headers = headers;
                    if let Some(created) = conn.created_mono {
                        let latency = (timestamp - created).max(0.0);
                        conn.handshake_latency = Some(Duration::from_secs_f64(latency));
                    }
                    if status == 101 {
                        conn.state = WsState::Open;
                    } else {
                        debug!(
                            request_id = %request_id,
                            status,
                            status_text = %status_text,
                            "websocket handshake rejected"
                        );
                        conn.state = WsState::Errored;
                        conn.error_text = Some(format!("handshake failed: {status}"));
                    }
                }
                self.changed.notify_waiters();
            }
            WebSocketEvent::FrameSent {
                request_id,
                frame,
                timestamp,
            } => self.record_frame(&request_id, WsDirection::Sent, frame, timestamp),
            WebSocketEvent::FrameReceived {
                request_id,
                frame,
                timestamp,
            } => self.record_frame(&request_id, WsDirection::Received, frame, timestamp),
            WebSocketEvent::FrameError {
                request_id,
                error_text,
                ..
            } => {
                if let Some(conn) = self.get(&request_id) {
                    let mut conn = conn.lock().unwrap();
                    conn.state = WsState::Errored;
                    conn.error_text = Some(error_text);
                }
                self.changed.notify_waiters();
            }
            WebSocketEvent::Closed {
                request_id,
                timestamp,
            } => {
                let closed_at = self.mono_to_utc(timestamp);
                if let Some(conn) = self.get(&request_id) {
                    let mut conn = conn.lock().unwrap();
                    if conn.state != WsState::Errored {
                        conn.state = WsState::Closed;
                    }
                    conn.closed_at = Some(closed_at);
                }
                self.changed.notify_waiters();
            }
        }
    }

    fn get(&self, request_id: &str) -> Option<Arc<Mutex<Connection>>> {
        self.connections.lock().unwrap().get(request_id).cloned()
    }

    fn record_frame(
        &self,
        request_id: &str,
        direction: WsDirection,
        data: FrameData,
        timestamp: f64,
    ) {
        let Some(conn) = self.get(request_id) else {
            debug!(request_id = %request_id, "frame for unknown websocket");
            return;
        };

        let frame_type = FrameType::from_opcode(data.opcode);
        let payload = if frame_type == FrameType::Binary {
            match base64::engine::general_purpose::STANDARD.decode(data.payload_data.as_bytes()) {
                Ok(bytes) => Payload::Binary(bytes),
                Err(_) => Payload::Text(data.payload_data),
            }
        } else {
            Payload::Text(data.payload_data)
        };

        let at = self.mono_to_utc(timestamp);
        {
            let mut conn = conn.lock().unwrap();
            // The log is append-only and strictly ordered per connection.
            let mono = match conn.frames.last() {
                Some(last) if timestamp <= last.mono => last.mono + 1e-6,
                _ => timestamp,
            };
            let at = match conn.frames.last() {
                Some(last) if at <= last.at => last.at + chrono::Duration::microseconds(1),
                _ => at,
            };

            let size = payload.len() as u64;
            if frame_type.is_data() {
                match direction {
                    WsDirection::Sent => {
                        conn.counters.bytes_sent += size;
                        conn.counters.messages_sent += 1;
                    }
                    WsDirection::Received => {
                        conn.counters.bytes_received += size;
                        conn.counters.messages_received += 1;
                    }
                }
            }
            if frame_type == FrameType::Close
                && let Payload::Binary(bytes) = &payload
                && bytes.len() >= 2
            {
                conn.close_code = Some(i64::from(u16::from_be_bytes([bytes[0], bytes[1]])));
                if bytes.len() > 2 {
                    conn.close_reason =
                        Some(String::from_utf8_lossy(&bytes[2..]).into_owned());
                }
            }

            conn.frames.push(Frame {
                direction,
                opcode: data.opcode,
                frame_type,
                payload,
                at,
                mono,
                mask: data.mask,
                arrived: Instant::now(),
            });
        }
        self.changed.notify_waiters();
    }

    pub fn snapshot(&self, request_id: &str) -> Option<WsSnapshot> {
        self.get(request_id).map(|conn| snapshot_of(&conn.lock().unwrap()))
    }

    pub fn snapshots(&self) -> Vec<WsSnapshot> {
        let connections = self.connections.lock().unwrap();
        let mut out: Vec<WsSnapshot> = connections
            .values()
            .map(|conn| snapshot_of(&conn.lock().unwrap()))
            .collect();
        out.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        out
    }

    /// Frames matching `filter`, across connections whose URL matches.
    pub fn matching_frames(&self, filter: &FrameFilter) -> Vec<Frame> {
        let connections = self.connections.lock().unwrap();
        let mut out = Vec::new();
        for conn in connections.values() {
            let conn = conn.lock().unwrap();
            if !filter.matches_url(&conn.url) {
                continue;
            }
            out.extend(conn.frames.iter().filter(|f| filter.matches_frame(f)).cloned());
        }
        out.sort_by(|a, b| a.at.cmp(&b.at));
        out
    }

    fn check_closed(&self, waiting_for: &str) -> Result<()> {
        if self.session_closed.load(Ordering::SeqCst) {
            return Err(HarError::Connection(format!(
                "session closed while waiting for {waiting_for}"
            )));
        }
        Ok(())
    }

    /// Waits until any connection matching `url_pattern` is open.
    pub async fn wait_for_open(
        &self,
        url_pattern: Option<&Regex>,
        timeout: Duration,
    ) -> Result<WsSnapshot> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check_closed("websocket open")?;
            {
                let connections = self.connections.lock().unwrap();
                let found = connections.values().find_map(|conn| {
                    let conn = conn.lock().unwrap();
                    let url_ok = url_pattern.map(|re| re.is_match(&conn.url)).unwrap_or(true);
                    (url_ok && conn.state == WsState::Open).then(|| snapshot_of(&conn))
                });
                if let Some(snapshot) = found {
                    return Ok(snapshot);
                }
            }
            self.sleep_until_change(deadline, "websocket open").await?;
        }
    }

    /// Waits for at least `count` received frames matching `filter`.
    pub async fn wait_for_frames(
        &self,
        filter: &FrameFilter,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<Frame>> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check_closed("websocket frames")?;
            let frames = self.matching_frames(filter);
            if frames.len() >= count {
                return Ok(frames);
            }
            self.sleep_until_change(deadline, "websocket frames").await?;
        }
    }

    /// Waits for a payload containing `needle` on any matching connection.
    pub async fn wait_for_payload(
        &self,
        url_pattern: Option<Regex>,
        needle: &str,
        timeout: Duration,
    ) -> Result<Frame> {
        let filter = FrameFilter {
            url_pattern,
            data_substring: Some(needle.to_string()),
            ..Default::default()
        };
        let deadline = Instant::now() + timeout;
        loop {
            self.check_closed("websocket payload")?;
            if let Some(frame) = self.matching_frames(&filter).into_iter().next() {
                return Ok(frame);
            }
            self.sleep_until_change(deadline, "websocket payload").await?;
        }
    }

    /// Waits until no frame matching `filter` has arrived for `idle`.
    pub async fn wait_for_idle(
        &self,
        filter: &FrameFilter,
        idle: Duration,
        timeout: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            self.check_closed("websocket idle")?;
            let last_arrival = self
                .matching_frames(filter)
                .iter()
                .map(|f| f.arrived)
                .max()
                .unwrap_or(started);
            let elapsed = last_arrival.elapsed();
            if elapsed >= idle {
                return Ok(());
            }
            let wake_in = (idle - elapsed).min(deadline.saturating_duration_since(Instant::now()));
            if Instant::now() >= deadline {
                return Err(HarError::Timeout(
                    timeout.as_secs(),
                    "websocket idle".to_string(),
                ));
            }
            let _ = tokio::time::timeout(wake_in, self.changed.notified()).await;
        }
    }

    async fn sleep_until_change(&self, deadline: Instant, what: &str) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HarError::Timeout(0, what.to_string()));
        }
        let _ = tokio::time::timeout(remaining, self.changed.notified()).await;
        if Instant::now() >= deadline {
            return Err(HarError::Timeout(0, what.to_string()));
        }
        Ok(())
    }

    /// Exports every connection for `log._websockets`.
    pub fn export(&self) -> Vec<WebSocketExport> {
        let connections = self.connections.lock().unwrap();
        let mut out: Vec<WebSocketExport> = connections
            .values()
            .map(|conn| export_of(&conn.lock().unwrap()))
            .collect();
        out.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        out
    }
}

fn snapshot_of(conn: &Connection) -> WsSnapshot {
    WsSnapshot {
        id: conn.id.clone(),
        url: conn.url.clone(),
        state: conn.state,
        opened_at: conn.opened_at,
        closed_at: conn.closed_at,
        close_code: conn.close_code,
        close_reason: conn.close_reason.clone(),
        protocol: conn.protocol.clone(),
        handshake_latency: conn.handshake_latency,
        request_headers: conn.request_headers.clone(),
        response_headers: conn.response_headers.clone(),
        error: conn.error_text.clone(),
        counters: conn.counters,
        frame_count: conn.frames.len(),
    }
}

fn export_of(conn: &Connection) -> WebSocketExport {
    WebSocketExport {
        id: conn.id.clone(),
        url: conn.url.clone(),
        state: conn.state.as_str().to_string(),
        opened_at: format_timestamp(conn.opened_at),
        closed_at: conn.closed_at.map(format_timestamp),
        close_code: conn.close_code,
        close_reason: conn.close_reason.clone(),
        protocol: conn.protocol.clone(),
        extensions: conn.extensions.clone(),
        frames: conn
            .frames
            .iter()
            .map(|frame| {
                let (payload, encoding) = match &frame.payload {
                    Payload::Text(text) => (text.clone(), None),
                    Payload::Binary(bytes) => (
                        base64::engine::general_purpose::STANDARD.encode(bytes),
                        Some("base64".to_string()),
                    ),
                };
                WebSocketFrameExport {
                    direction: frame.direction.as_str().to_string(),
                    opcode: frame.opcode,
                    type_tag: frame.frame_type.as_str().to_string(),
                    size: frame.payload.len(),
                    timestamp: format_timestamp(frame.at),
                    payload,
                    payload_encoding: encoding,
                }
            })
            .collect(),
    }
}
