//! One recording session: event fan-out, navigation, waits, and HAR
//! production.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cdp::{NetworkEvent, PageCommands, ProfileCookie, SessionEvent};
use crate::config::{RecorderOptions, StabilityConfig};
use crate::filters::{Filters, Projected};
use crate::har::{self, Entry, Har, Page, PageTimings, StreamSink, Timings};
use crate::recorder::{NetworkRecorder, WebSocketRecorder};
use crate::stability::StabilityDetector;
use crate::timeouts::ms;
use crate::{HarError, Result};

const MAIN_PAGE_ID: &str = "page_1";
const PROFILE_COOKIES_PAGE_ID: &str = "profile_cookies";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    Load,
    DomContentLoaded,
    NetworkIdle,
    Stable,
}

impl FromStr for WaitUntil {
    type Err = HarError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "load" => Ok(Self::Load),
            "dom" | "domcontentloaded" => Ok(Self::DomContentLoaded),
            "networkidle" => Ok(Self::NetworkIdle),
            "stable" => Ok(Self::Stable),
            other => Err(HarError::config(
                "--wait",
                format!("unknown wait condition '{other}'"),
            )),
        }
    }
}

pub struct RecordingSession {
    commands: Arc<dyn PageCommands>,
    filters: Arc<Filters>,
    options: RecorderOptions,
    network: Arc<NetworkRecorder>,
    websocket: Arc<WebSocketRecorder>,
    detector: Arc<StabilityDetector>,
    session_id: uuid::Uuid,
    started_at: Mutex<Option<DateTime<Utc>>>,
    page_url: Mutex<Option<String>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    closed: AtomicBool,
    finished: Mutex<Option<Har>>,
}

impl RecordingSession {
    pub fn new(
        commands: Arc<dyn PageCommands>,
        filters: Filters,
        stability: StabilityConfig,
        options: RecorderOptions,
        sink: Option<Arc<Mutex<StreamSink>>>,
    ) -> Arc<Self> {
        let filters = Arc::new(filters);
        let network = NetworkRecorder::new(
            filters.clone(),
            commands.clone(),
            options.clone(),
            sink,
        );
        Arc::new(Self {
            commands,
            filters,
            options,
            network,
            websocket: WebSocketRecorder::new(),
            detector: StabilityDetector::new(stability),
            session_id: uuid::Uuid::new_v4(),
            started_at: Mutex::new(None),
            page_url: Mutex::new(None),
            dispatch: Mutex::new(None),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            finished: Mutex::new(None),
        })
    }

    pub fn network(&self) -> &Arc<NetworkRecorder> {
        &self.network
    }

    pub fn websocket(&self) -> &Arc<WebSocketRecorder> {
        &self.websocket
    }

    pub fn detector(&self) -> &Arc<StabilityDetector> {
        &self.detector
    }

    pub fn commands(&self) -> &Arc<dyn PageCommands> {
        &self.commands
    }

    /// Subscribes to the event stream, installs the mutation watcher, loads
    /// profile cookies, and records the navigation-start wall clock.
    pub async fn start(&self, events: UnboundedReceiver<SessionEvent>) -> Result<()> {
        self.detector.install(self.commands.as_ref()).await?;

        let profile_cookies = match self.commands.read_cookies().await {
            Ok(cookies) => cookies,
            Err(e) => {
                debug!(error = %e, "profile cookie read failed");
                Vec::new()
            }
        };
        let profile_cookies: Vec<ProfileCookie> = profile_cookies
            .into_iter()
            .filter(|c| self.filters.cookie_matches(&c.name))
            .collect();
        info!(
            session = %self.session_id,
            cookies = profile_cookies.len(),
            "recording session started"
        );
        self.network.set_profile_cookies(profile_cookies);

        let now = Utc::now();
        *self.started_at.lock().unwrap() = Some(now);
        self.network.set_navigation_start(now);

        self.spawn_dispatch(events);
        Ok(())
    }

    fn spawn_dispatch(&self, mut events: UnboundedReceiver<SessionEvent>) {
        let network = self.network.clone();
        let websocket = self.websocket.clone();
        let detector = self.detector.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::Network(event) => {
                        match &event {
                            NetworkEvent::RequestWillBeSent {
                                redirect_response, ..
                            } => {
                                // A redirect hop finishes one request as it
                                // starts the next.
                                if redirect_response.is_some() {
                                    detector.on_request_finished();
                                }
                                detector.on_request_started();
                            }
                            NetworkEvent::LoadingFinished { .. }
                            | NetworkEvent::LoadingFailed { .. } => {
                                detector.on_request_finished();
                            }
                            NetworkEvent::ResponseReceived { .. } => {}
                        }
                        network.handle(event);
                    }
                    SessionEvent::WebSocket(event) => websocket.handle(event),
                }
            }
            // Channel closed: browser went away or the session is closing.
            websocket.mark_session_closed();
        });

        *self.dispatch.lock().unwrap() = Some(handle);
    }

    /// Navigates and waits for the requested readiness condition.
    pub async fn navigate(
        &self,
        url: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        *self.started_at.lock().unwrap() = Some(now);
        *self.page_url.lock().unwrap() = Some(url.to_string());
        self.network.set_navigation_start(now);
        self.detector.reset();

        self.commands.navigate(url).await?;

        match wait_until {
            WaitUntil::Load => self.wait_for_ready_state(&["complete"], timeout).await,
            WaitUntil::DomContentLoaded => {
                self.wait_for_ready_state(&["interactive", "complete"], timeout)
                    .await
            }
            WaitUntil::NetworkIdle => {
                self.detector
                    .wait_for_network_idle(
                        self.detector.config().network_idle_duration,
                        timeout,
                    )
                    .await
            }
            WaitUntil::Stable => {
                tokio::time::timeout(timeout, self.detector.wait_until_stable(self.commands.as_ref()))
                    .await
                    .map_err(|_| {
                        HarError::Timeout(timeout.as_secs(), "stability wait".to_string())
                    })?
            }
        }
    }

    async fn wait_for_ready_state(&self, accepted: &[&str], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        // Require two consecutive confirmations so a navigation that resets
        // readyState between polls does not slip through.
        let mut confirmations = 0;
        loop {
            if Instant::now() >= deadline {
                return Err(HarError::Timeout(
                    timeout.as_secs(),
                    "document ready state".to_string(),
                ));
            }
            let state = self
                .commands
                .evaluate(crate::stability::scripts::ready_state())
                .await
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            if accepted.contains(&state.as_str()) {
                confirmations += 1;
                if confirmations >= 2 {
                    return Ok(());
                }
            } else {
                confirmations = 0;
            }
            tokio::time::sleep(Duration::from_millis(ms::READY_STATE_POLL)).await;
        }
    }

    /// Polls until `selector` resolves to an element.
    pub async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()> {
        let escaped = selector.replace('\\', "\\\\").replace('\'', "\\'");
        let expression = format!("document.querySelector('{escaped}') !== null");
        self.wait_for_function(&expression, timeout).await
    }

    /// Polls until `expression` evaluates truthy.
    pub async fn wait_for_function(&self, expression: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(HarError::Timeout(
                    timeout.as_secs(),
                    format!("wait for {expression}"),
                ));
            }
            match self.commands.evaluate(expression).await {
                Ok(value)
                    if !matches!(
                        value,
                        serde_json::Value::Null | serde_json::Value::Bool(false)
                    ) =>
                {
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "wait expression failed, retrying"),
            }
            tokio::time::sleep(Duration::from_millis(ms::POLL_INTERVAL)).await;
        }
    }

    /// Drains body fetches, assembles the document, and latches the result.
    /// A second call returns the same document without re-assembling.
    pub async fn stop(&self) -> Result<Har> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            if let Some(har) = self.finished.lock().unwrap().clone() {
                return Ok(har);
            }
        }

        self.network.drain(self.options.drain_grace).await;

        let started_at = self.started_at.lock().unwrap().unwrap_or_else(Utc::now);
        let page_url = self.page_url.lock().unwrap().clone().unwrap_or_default();

        let mut pages = vec![Page {
            started_date_time: har::format_timestamp(started_at),
            id: MAIN_PAGE_ID.to_string(),
            title: page_url,
            page_timings: PageTimings::default(),
        }];

        let mut entries = Vec::new();
        for entry in self.network.build_entries(Some(MAIN_PAGE_ID)) {
            match self.filters.apply_projection(&entry) {
                Ok(Projected::Entry(entry)) => entries.push(entry),
                Ok(Projected::Drop) => {}
                // Raw template output has no place in a HAR document; it only
                // makes sense on the streaming path.
                Ok(Projected::Raw(_)) => entries.push(entry),
                Err(e) => {
                    debug!(url = %entry.request.url, error = %e, "projection failed, entry skipped");
                }
            }
        }

        let profile_cookies = self.network.profile_cookies();
        if !profile_cookies.is_empty() {
            pages.push(Page {
                started_date_time: har::format_timestamp(started_at),
                id: PROFILE_COOKIES_PAGE_ID.to_string(),
                title: "Profile cookies".to_string(),
                page_timings: PageTimings::default(),
            });
            entries.insert(0, profile_cookie_entry(started_at, &profile_cookies));
        }

        let websockets = if self.options.websockets {
            entries.extend(self.websocket_entries());
            Some(self.websocket.export())
        } else {
            None
        };

        let stats = self.network.stats();
        info!(
            session = %self.session_id,
            captured = stats.captured,
            blocked = stats.blocked,
            failed = stats.failed,
            omitted = stats.omitted,
            body_fetch_failures = stats.body_fetch_failures,
            "recording session stopped"
        );

        let har = har::assemble(pages, entries, websockets);
        *self.finished.lock().unwrap() = Some(har.clone());
        Ok(har)
    }

    fn websocket_entries(&self) -> Vec<Entry> {
        self.websocket
            .snapshots()
            .into_iter()
            .map(|snapshot| {
                let mut request = har::Request::new("GET", &snapshot.url);
                request.headers = crate::recorder::to_har_headers(&snapshot.request_headers);

                let mut response = har::Response::empty();
                response.headers = crate::recorder::to_har_headers(&snapshot.response_headers);
                if !matches!(
                    snapshot.state,
                    crate::recorder::websocket::WsState::Connecting
                ) && snapshot.error.is_none()
                {
                    response.status = 101;
                    response.status_text = "Switching Protocols".to_string();
                }
                let latency_ms = snapshot
                    .handshake_latency
                    .map(|d| d.as_secs_f64() * 1000.0)
                    .unwrap_or(0.0);
                Entry {
                    pageref: Some(MAIN_PAGE_ID.to_string()),
                    started_date_time: har::format_timestamp(snapshot.opened_at),
                    time: latency_ms,
                    request,
                    response,
                    cache: har::Cache::default(),
                    timings: Timings::wait_only(latency_ms),
                    websocket_id: Some(snapshot.id),
                }
            })
            .collect()
    }

    /// Tears down the dispatch loop. Safe to call from any state, repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.websocket.mark_session_closed();
        if let Some(handle) = self.dispatch.lock().unwrap().take() {
            handle.abort();
        }
        debug!(session = %self.session_id, "recording session closed");
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Synthetic entry that carries the profile's cookie jar on its request
/// side, grouped under the profile_cookies page.
fn profile_cookie_entry(started_at: DateTime<Utc>, cookies: &[ProfileCookie]) -> Entry {
    let mut request = har::Request::new("GET", "about:profile-cookies");
    request.cookies = cookies
        .iter()
        .map(|c| har::Cookie {
            name: c.name.clone(),
            value: c.value.clone(),
            domain: Some(c.domain.clone()),
            path: Some(c.path.clone()),
            expires: c.expires.map(|e| e.to_string()),
            http_only: Some(c.http_only),
            secure: Some(c.secure),
            same_site: c.same_site.clone(),
        })
        .collect();

    Entry {
        pageref: Some(PROFILE_COOKIES_PAGE_ID.to_string()),
        started_date_time: har::format_timestamp(started_at),
        time: 0.0,
        request,
        response: har::Response::empty(),
        cache: har::Cache::default(),
        timings: Timings::wait_only(0.0),
        websocket_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_until_parses_known_values() {
        assert_eq!(WaitUntil::from_str("load").unwrap(), WaitUntil::Load);
        assert_eq!(
            WaitUntil::from_str("domcontentloaded").unwrap(),
            WaitUntil::DomContentLoaded
        );
        assert_eq!(WaitUntil::from_str("dom").unwrap(), WaitUntil::DomContentLoaded);
        assert_eq!(
            WaitUntil::from_str("networkIdle").unwrap(),
            WaitUntil::NetworkIdle
        );
        assert_eq!(WaitUntil::from_str("stable").unwrap(), WaitUntil::Stable);
        assert!(WaitUntil::from_str("eventually").is_err());
    }

    #[test]
    fn profile_cookie_entry_carries_metadata() {
        let cookies = vec![ProfileCookie {
            name: "sid".into(),
            value: "abc".into(),
            domain: "example.com".into(),
            path: "/".into(),
            expires: Some(1_800_000_000.0),
            http_only: true,
            secure: true,
            same_site: Some("Lax".into()),
        }];
        let entry = profile_cookie_entry(Utc::now(), &cookies);
        assert_eq!(entry.pageref.as_deref(), Some("profile_cookies"));
        assert_eq!(entry.request.cookies.len(), 1);
        assert_eq!(entry.request.cookies[0].domain.as_deref(), Some("example.com"));
        assert_eq!(entry.response.status, 0);
    }
}
