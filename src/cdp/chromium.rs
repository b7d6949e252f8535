use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::network::{
    CookieSameSite, EnableParams as NetworkEnableParams, EventLoadingFailed,
    EventLoadingFinished, EventRequestWillBeSent, EventResponseReceived, EventWebSocketClosed,
    EventWebSocketCreated, EventWebSocketFrameError, EventWebSocketFrameReceived,
    EventWebSocketFrameSent, EventWebSocketHandshakeResponseReceived,
    EventWebSocketWillSendHandshakeRequest, GetCookiesParams, GetResponseBodyParams, Headers,
    RequestId, SetBlockedUrLsParams, SetCookieParams, SetExtraHttpHeadersParams, TimeSinceEpoch,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat, CaptureScreenshotParams,
    NavigateParams,
};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::mpsc;

use super::{
    BodyData, FrameData, NetworkEvent, PageCommands, ProfileCookie, ResponseData, SessionEvent,
    WebSocketEvent, explode_headers,
};
use crate::{HarError, Result};

fn cdp_err(e: impl std::fmt::Display) -> HarError {
    HarError::Connection(e.to_string())
}

fn convert_response(response: &chromiumoxide::cdp::browser_protocol::network::Response) -> ResponseData {
    ResponseData {
        status: response.status,
        status_text: response.status_text.clone(),
        protocol: response.protocol.clone(),
        headers: explode_headers(response.headers.inner()),
        mime_type: response.mime_type.clone(),
        encoded_data_length: response.encoded_data_length,
    }
}

/// Enables the Network domain and merges every listener this tool consumes
/// into one ordered stream. The channel is unbounded; the session dispatch
/// loop drains it continuously, so memory use is bounded by page activity.
pub async fn spawn_event_pump(page: &Arc<Page>) -> Result<mpsc::UnboundedReceiver<SessionEvent>> {
    page.execute(NetworkEnableParams::default())
        .await
        .map_err(cdp_err)?;

    let mut streams: Vec<BoxStream<'static, SessionEvent>> = Vec::new();

    streams.push(
        page.event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(cdp_err)?
            .map(|ev| {
                SessionEvent::Network(NetworkEvent::RequestWillBeSent {
                    request_id: ev.request_id.inner().to_string(),
                    url: ev.request.url.clone(),
                    method: ev.request.method.clone(),
                    headers: explode_headers(ev.request.headers.inner()),
                    post_data: ev.request.post_data.clone(),
                    redirect_response: ev.redirect_response.as_ref().map(convert_response),
                    timestamp: *ev.timestamp.inner(),
                    wall_time: *ev.wall_time.inner(),
                })
            })
            .boxed(),
    );
    streams.push(
        page.event_listener::<EventResponseReceived>()
            .await
            .map_err(cdp_err)?
            .map(|ev| {
                SessionEvent::Network(NetworkEvent::ResponseReceived {
                    request_id: ev.request_id.inner().to_string(),
                    response: convert_response(&ev.response),
                    timestamp: *ev.timestamp.inner(),
                })
            })
            .boxed(),
    );
    streams.push(
        page.event_listener::<EventLoadingFinished>()
            .await
            .map_err(cdp_err)?
            .map(|ev| {
                SessionEvent::Network(NetworkEvent::LoadingFinished {
                    request_id: ev.request_id.inner().to_string(),
                    timestamp: *ev.timestamp.inner(),
                    encoded_data_length: ev.encoded_data_length,
                })
            })
            .boxed(),
    );
    streams.push(
        page.event_listener::<EventLoadingFailed>()
            .await
            .map_err(cdp_err)?
            .map(|ev| {
                SessionEvent::Network(NetworkEvent::LoadingFailed {
                    request_id: ev.request_id.inner().to_string(),
                    error_text: ev.error_text.clone(),
                    canceled: ev.canceled.unwrap_or(false),
                    timestamp: *ev.timestamp.inner(),
                })
            })
            .boxed(),
    );

    streams.push(
        page.event_listener::<EventWebSocketCreated>()
            .await
            .map_err(cdp_err)?
            .map(|ev| {
                SessionEvent::WebSocket(WebSocketEvent::Created {
                    request_id: ev.request_id.inner().to_string(),
                    url: ev.url.clone(),
                })
            })
            .boxed(),
    );
    streams.push(
        page.event_listener::<EventWebSocketWillSendHandshakeRequest>()
            .await
            .map_err(cdp_err)?
            .map(|ev| {
                SessionEvent::WebSocket(WebSocketEvent::HandshakeRequestSent {
                    request_id: ev.request_id.inner().to_string(),
                    headers: explode_headers(ev.request.headers.inner()),
                    timestamp: *ev.timestamp.inner(),
                    wall_time: *ev.wall_time.inner(),
                })
            })
            .boxed(),
    );
    streams.push(
        page.event_listener::<EventWebSocketHandshakeResponseReceived>()
            .await
            .map_err(cdp_err)?
            .map(|ev| {
                SessionEvent::WebSocket(WebSocketEvent::HandshakeResponseReceived {
                    request_id: ev.request_id.inner().to_string(),
                    status: ev.response.status,
                    status_text: ev.response.status_text.clone(),
                    headers: explode_headers(ev.response.headers.inner()),
                    timestamp: *ev.timestamp.inner(),
                })
            })
            .boxed(),
    );
    streams.push(
        page.event_listener::<EventWebSocketFrameSent>()
            .await
            .map_err(cdp_err)?
            .map(|ev| {
                SessionEvent::WebSocket(WebSocketEvent::FrameSent {
                    request_id: ev.request_id.inner().to_string(),
                    frame: FrameData {
                        opcode: ev.response.opcode as u8,
                        mask: ev.response.mask,
                        payload_data: ev.response.payload_data.clone(),
                    },
                    timestamp: *ev.timestamp.inner(),
                })
            })
            .boxed(),
    );
    streams.push(
        page.event_listener::<EventWebSocketFrameReceived>()
            .await
            .map_err(cdp_err)?
            .map(|ev| {
                SessionEvent::WebSocket(WebSocketEvent::FrameReceived {
                    request_id: ev.request_id.inner().to_string(),
                    frame: FrameData {
                        opcode: ev.response.opcode as u8,
                        mask: ev.response.mask,
                        payload_data: ev.response.payload_data.clone(),
                    },
                    timestamp: *ev.timestamp.inner(),
                })
            })
            .boxed(),
    );
    streams.push(
        page.event_listener::<EventWebSocketFrameError>()
            .await
            .map_err(cdp_err)?
            .map(|ev| {
                SessionEvent::WebSocket(WebSocketEvent::FrameError {
                    request_id: ev.request_id.inner().to_string(),
                    error_text: ev.error_message.clone(),
                    timestamp: *ev.timestamp.inner(),
                })
            })
            .boxed(),
    );
    streams.push(
        page.event_listener::<EventWebSocketClosed>()
            .await
            .map_err(cdp_err)?
            .map(|ev| {
                SessionEvent::WebSocket(WebSocketEvent::Closed {
                    request_id: ev.request_id.inner().to_string(),
                    timestamp: *ev.timestamp.inner(),
                })
            })
            .boxed(),
    );

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut merged = stream::select_all(streams);
        while let Some(event) = merged.next().await {
            if tx.send(event).is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

/// The production adapter: a live chromiumoxide page.
pub struct ChromiumSession {
    page: Arc<Page>,
}

impl ChromiumSession {
    pub fn new(page: Arc<Page>) -> Self {
        Self { page }
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }
}

#[async_trait]
impl PageCommands for ChromiumSession {
    async fn fetch_response_body(&self, request_id: &str) -> Result<BodyData> {
        let params = GetResponseBodyParams::new(RequestId::new(request_id));
        let result = self
            .page
            .execute(params)
            .await
            .map_err(|e| HarError::BodyFetch {
                request_id: request_id.to_string(),
                message: e.to_string(),
            })?;

        let bytes = if result.base64_encoded {
            base64::engine::general_purpose::STANDARD
                .decode(result.body.as_bytes())
                .map_err(|e| HarError::BodyFetch {
                    request_id: request_id.to_string(),
                    message: format!("base64 decode failed: {e}"),
                })?
        } else {
            result.body.clone().into_bytes()
        };

        Ok(BodyData {
            bytes,
            was_base64: result.base64_encoded,
        })
    }

    async fn block_urls(&self, patterns: Vec<String>) -> Result<()> {
        self.page
            .execute(SetBlockedUrLsParams { urls: patterns })
            .await
            .map_err(cdp_err)?;
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value> {
        let result = self.page.evaluate(expression).await.map_err(cdp_err)?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn install_on_new_document(&self, script: &str) -> Result<()> {
        let params = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(script)
            .build()
            .map_err(HarError::Internal)?;
        self.page.execute(params).await.map_err(cdp_err)?;
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(|e| HarError::Navigation(format!("bad navigate params: {e}")))?;
        let result = self
            .page
            .execute(params)
            .await
            .map_err(|e| HarError::Navigation(e.to_string()))?;
        if let Some(text) = &result.error_text {
            return Err(HarError::Navigation(text.clone()));
        }
        Ok(())
    }

    async fn read_cookies(&self) -> Result<Vec<ProfileCookie>> {
        let result = self
            .page
            .execute(GetCookiesParams::default())
            .await
            .map_err(cdp_err)?;

        Ok(result
            .cookies
            .iter()
            .map(|c| ProfileCookie {
                name: c.name.clone(),
                value: c.value.clone(),
                domain: c.domain.clone(),
                path: c.path.clone(),
                expires: (c.expires > 0.0).then_some(c.expires),
                http_only: c.http_only,
                secure: c.secure,
                same_site: c.same_site.as_ref().map(|s| format!("{:?}", s)),
            })
            .collect())
    }

    async fn set_cookie(&self, cookie: ProfileCookie) -> Result<()> {
        let mut builder = SetCookieParams::builder()
            .name(&cookie.name)
            .value(&cookie.value)
            .domain(&cookie.domain)
            .path(&cookie.path)
            .secure(cookie.secure)
            .http_only(cookie.http_only);

        if let Some(expires) = cookie.expires {
            builder = builder.expires(TimeSinceEpoch::new(expires));
        }
        if let Some(same_site) = &cookie.same_site {
            let mapped = match same_site.to_ascii_lowercase().as_str() {
                "strict" => Some(CookieSameSite::Strict),
                "lax" => Some(CookieSameSite::Lax),
                "none" => Some(CookieSameSite::None),
                _ => None,
            };
            if let Some(value) = mapped {
                builder = builder.same_site(value);
            }
        }

        let params = builder.build().map_err(HarError::Internal)?;
        self.page.execute(params).await.map_err(cdp_err)?;
        Ok(())
    }

    async fn set_extra_headers(&self, headers: super::HeaderList) -> Result<()> {
        let mut map = serde_json::Map::new();
        for (name, value) in headers {
            match map.get_mut(&name) {
                Some(serde_json::Value::String(existing)) => {
                    existing.push('\n');
                    existing.push_str(&value);
                }
                _ => {
                    map.insert(name, serde_json::Value::String(value));
                }
            }
        }
        let params = SetExtraHttpHeadersParams {
            headers: Headers::new(serde_json::Value::Object(map)),
        };
        self.page.execute(params).await.map_err(cdp_err)?;
        Ok(())
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>> {
        let params = CaptureScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();
        self.page.screenshot(params).await.map_err(cdp_err)
    }

    async fn page_content(&self) -> Result<String> {
        self.page.content().await.map_err(cdp_err)
    }
}
