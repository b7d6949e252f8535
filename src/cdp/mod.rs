pub mod chromium;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

pub use chromium::{ChromiumSession, spawn_event_pump};

/// Header list in receipt order; duplicate names allowed.
pub type HeaderList = Vec<(String, String)>;

/// One typed event from the browser, already decoupled from the wire types.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Network(NetworkEvent),
    WebSocket(WebSocketEvent),
}

#[derive(Debug, Clone)]
pub struct ResponseData {
    pub status: i64,
    pub status_text: String,
    pub protocol: Option<String>,
    pub headers: HeaderList,
    pub mime_type: String,
    pub encoded_data_length: f64,
}

#[derive(Debug, Clone)]
pub enum NetworkEvent {
    RequestWillBeSent {
        request_id: String,
        url: String,
        method: String,
        headers: HeaderList,
        post_data: Option<String>,
        /// Present when this event closes out a redirect hop.
        redirect_response: Option<ResponseData>,
        timestamp: f64,
        wall_time: f64,
    },
    ResponseReceived {
        request_id: String,
        response: ResponseData,
        timestamp: f64,
    },
    LoadingFinished {
        request_id: String,
        timestamp: f64,
        encoded_data_length: f64,
    },
    LoadingFailed {
        request_id: String,
        error_text: String,
        canceled: bool,
        timestamp: f64,
    },
}

impl NetworkEvent {
    pub fn request_id(&self) -> &str {
        match self {
            Self::RequestWillBeSent { request_id, .. }
            | Self::ResponseReceived { request_id, .. }
            | Self::LoadingFinished { request_id, .. }
            | Self::LoadingFailed { request_id, .. } => request_id,
        }
    }
}

/// Raw frame payload as CDP delivers it: text for text frames, base64 for
/// binary frames.
#[derive(Debug, Clone)]
pub struct FrameData {
    pub opcode: u8,
    pub mask: bool,
    pub payload_data: String,
}

#[derive(Debug, Clone)]
pub enum WebSocketEvent {
    Created {
        request_id: String,
        url: String,
    },
    HandshakeRequestSent {
        request_id: String,
        headers: HeaderList,
        timestamp: f64,
        wall_time: f64,
    },
    HandshakeResponseReceived {
        request_id: String,
        status: i64,
        status_text: String,
        headers: HeaderList,
        timestamp: f64,
    },
    FrameSent {
        request_id: String,
        frame: FrameData,
        timestamp: f64,
    },
    FrameReceived {
        request_id: String,
        frame: FrameData,
        timestamp: f64,
    },
    FrameError {
        request_id: String,
        error_text: String,
        timestamp: f64,
    },
    Closed {
        request_id: String,
        timestamp: f64,
    },
}

impl WebSocketEvent {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Created { request_id, .. }
            | Self::HandshakeRequestSent { request_id, .. }
            | Self::HandshakeResponseReceived { request_id, .. }
            | Self::FrameSent { request_id, .. }
            | Self::FrameReceived { request_id, .. }
            | Self::FrameError { request_id, .. }
            | Self::Closed { request_id, .. } => request_id,
        }
    }
}

/// A response body fetched out of band.
#[derive(Debug, Clone)]
pub struct BodyData {
    pub bytes: Vec<u8>,
    pub was_base64: bool,
}

/// A cookie as stored by the browser profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    pub http_only: bool,
    pub secure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

/// Commands the core issues back to the page. Everything the recorders and
/// the stability detector need goes through this trait so they stay testable
/// without a browser.
#[async_trait]
pub trait PageCommands: Send + Sync {
    /// Network.getResponseBody for one request.
    async fn fetch_response_body(&self, request_id: &str) -> Result<BodyData>;
    /// Replace the browser-side blocked URL pattern list.
    async fn block_urls(&self, patterns: Vec<String>) -> Result<()>;
    /// Evaluate a JS expression in the page, returning its JSON value.
    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value>;
    /// Install a script that runs before every document in this page.
    async fn install_on_new_document(&self, script: &str) -> Result<()>;
    async fn navigate(&self, url: &str) -> Result<()>;
    async fn read_cookies(&self) -> Result<Vec<ProfileCookie>>;
    async fn set_cookie(&self, cookie: ProfileCookie) -> Result<()>;
    async fn set_extra_headers(&self, headers: HeaderList) -> Result<()>;
    async fn screenshot_png(&self) -> Result<Vec<u8>>;
    async fn page_content(&self) -> Result<String>;
}

/// Explodes a CDP header object into an ordered list. CDP folds duplicate
/// header names into one `\n`-joined value; those are split back out.
pub fn explode_headers(raw: &serde_json::Value) -> HeaderList {
    let mut out = Vec::new();
    if let Some(map) = raw.as_object() {
        for (name, value) in map {
            let Some(text) = value.as_str() else {
                continue;
            };
            for part in text.split('\n') {
                out.push((name.clone(), part.to_string()));
            }
        }
    }
    out
}
