//! Per-request state tables and HAR entry synthesis.
//!
//! Every network event flows through [`NetworkRecorder::handle`] under the
//! table lock. Response bodies are fetched out of band by a bounded worker
//! pool; the lock is never held across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    header_value, header_values, parse_cookie_header, parse_set_cookie, to_har_headers,
};
use crate::cdp::{HeaderList, NetworkEvent, PageCommands, ProfileCookie, ResponseData};
use crate::config::RecorderOptions;
use crate::filters::{Filters, Projected};
use crate::har::{self, Content, Entry, PostData, StreamSink, Timings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Requested,
    Responded,
    Timed,
    Complete,
    Failed,
}

#[derive(Debug, Clone)]
struct RequestRecord {
    method: String,
    url: String,
    headers: HeaderList,
    post_data: Option<String>,
    started_at: DateTime<Utc>,
    started_mono: f64,
}

#[derive(Debug, Clone)]
struct ResponseRecord {
    status: i64,
    status_text: String,
    protocol: Option<String>,
    headers: HeaderList,
    mime_type: String,
    encoded_data_length: f64,
}

impl ResponseRecord {
    fn from_data(data: ResponseData) -> Self {
        Self {
            status: data.status,
            status_text: data.status_text,
            protocol: data.protocol,
            headers: data.headers,
            mime_type: data.mime_type,
            encoded_data_length: data.encoded_data_length,
        }
    }
}

#[derive(Debug, Clone)]
struct TimingRecord {
    finished_mono: f64,
    encoded_data_length: f64,
}

#[derive(Debug, Clone)]
struct BodyRecord {
    bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
struct RequestSlot {
    request: RequestRecord,
    response: Option<ResponseRecord>,
    timing: Option<TimingRecord>,
    body: Option<BodyRecord>,
    failure: Option<String>,
    state: RequestState,
}

#[derive(Debug, Clone, Copy)]
struct NavAnchor {
    mono: f64,
    wall: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RecorderStats {
    pub captured: usize,
    pub blocked: usize,
    pub failed: usize,
    pub omitted: usize,
    pub body_fetch_failures: usize,
}

#[derive(Debug)]
struct Tables {
    slots: HashMap<String, RequestSlot>,
    /// Redirect hops archived before their RequestId was reused.
    archived: Vec<RequestSlot>,
    anchor: Option<NavAnchor>,
    nav_wall: DateTime<Utc>,
    blocked_patterns: Vec<String>,
    profile_cookies: Vec<ProfileCookie>,
    stats: RecorderStats,
}

pub struct NetworkRecorder {
    tables: Mutex<Tables>,
    filters: Arc<Filters>,
    commands: Arc<dyn PageCommands>,
    options: RecorderOptions,
    body_pool: Arc<Semaphore>,
    in_flight_fetches: AtomicUsize,
    drained: Notify,
    sink: Option<Arc<Mutex<StreamSink>>>,
}

impl NetworkRecorder {
    pub fn new(
        filters: Arc<Filters>,
        commands: Arc<dyn PageCommands>,
        options: RecorderOptions,
        sink: Option<Arc<Mutex<StreamSink>>>,
    ) -> Arc<Self> {
        let workers = options.body_fetch_workers.max(1);
        Arc::new(Self {
            tables: Mutex::new(Tables {
                slots: HashMap::new(),
                archived: Vec::new(),
                anchor: None,
                nav_wall: Utc::now(),
                blocked_patterns: Vec::new(),
                profile_cookies: Vec::new(),
                stats: RecorderStats::default(),
            }),
            filters,
            commands,
            options,
            body_pool: Arc::new(Semaphore::new(workers)),
            in_flight_fetches: AtomicUsize::new(0),
            drained: Notify::new(),
            sink,
        })
    }

    /// Marks the navigation start; entries compute `timings.wait` against the
    /// first monotonic timestamp observed after this.
    pub fn set_navigation_start(&self, wall: DateTime<Utc>) {
        let mut tables = self.tables.lock().unwrap();
        tables.nav_wall = wall;
        tables.anchor = None;
    }

    pub fn set_profile_cookies(&self, cookies: Vec<ProfileCookie>) {
        self.tables.lock().unwrap().profile_cookies = cookies;
    }

    pub fn stats(&self) -> RecorderStats {
        self.tables.lock().unwrap().stats
    }

    pub fn blocked_patterns(&self) -> Vec<String> {
        self.tables.lock().unwrap().blocked_patterns.clone()
    }

    /// Consumes one network event. May spawn a body fetch or a blocked-URL
    /// update; neither runs under the table lock.
    pub fn handle(self: &Arc<Self>, event: NetworkEvent) {
        match event {
            NetworkEvent::RequestWillBeSent {
                request_id,
                url,
                method,
                headers,
                post_data,
                redirect_response,
                timestamp,
                wall_time,
            } => {
                self.on_request(
                    request_id,
                    url,
                    method,
                    headers,
                    post_data,
                    redirect_response,
                    timestamp,
                    wall_time,
                );
            }
            NetworkEvent::ResponseReceived {
                request_id,
                response,
                ..
            } => self.on_response(request_id, response),
            NetworkEvent::LoadingFinished {
                request_id,
                timestamp,
                encoded_data_length,
            } => self.on_finished(request_id, timestamp, encoded_data_length),
            NetworkEvent::LoadingFailed {
                request_id,
                error_text,
                canceled,
                ..
            } => self.on_failed(request_id, error_text, canceled),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_request(
        self: &Arc<Self>,
        request_id: String,
        url: String,
        method: String,
        headers: HeaderList,
        post_data: Option<String>,
        redirect_response: Option<ResponseData>,
        timestamp: f64,
        wall_time: f64,
    ) {
        let mut block_update: Option<Vec<String>> = None;
        let mut emission: Option<(RequestSlot, NavAnchor)> = None;

        {
            let mut tables = self.tables.lock().unwrap();
            let nav_wall = tables.nav_wall;
            tables.anchor.get_or_insert(NavAnchor {
                mono: timestamp,
                wall: nav_wall,
            });

            if self.filters.should_block(&url) {
                tables.stats.blocked += 1;
                if !tables.blocked_patterns.iter().any(|p| p == &url) {
                    tables.blocked_patterns.push(url.clone());
                    block_update = Some(tables.blocked_patterns.clone());
                }
            } else if !self.filters.should_capture(&url) {
                debug!(url = %url, "request dropped by capture filter");
            } else {
                // A redirect closes out the previous hop under the same id.
                if let Some(response) = redirect_response
                    && let Some(previous) = tables.slots.get_mut(&request_id)
                {
                    previous.response = Some(ResponseRecord::from_data(response));
                    previous.timing = Some(TimingRecord {
                        finished_mono: timestamp,
                        encoded_data_length: previous
                            .response
                            .as_ref()
                            .map(|r| r.encoded_data_length)
                            .unwrap_or(0.0),
                    });
                    previous.state = RequestState::Complete;
                    let archived = previous.clone();
                    if self.options.streaming
                        && let Some(anchor) = tables.anchor
                    {
                        emission = Some((archived.clone(), anchor));
                    }
                    tables.archived.push(archived);
                }

                let started_at = epoch_to_utc(wall_time).unwrap_or(nav_wall);
                tables.stats.captured += 1;
                tables.slots.insert(
                    request_id,
                    RequestSlot {
                        request: RequestRecord {
                            method,
                            url,
                            headers,
                            post_data,
                            started_at,
                            started_mono: timestamp,
                        },
                        response: None,
                        timing: None,
                        body: None,
                        failure: None,
                        state: RequestState::Requested,
                    },
                );
            }
        }

        if let Some((slot, anchor)) = emission {
            self.emit_streamed(&slot, anchor);
        }
        if let Some(patterns) = block_update {
            let commands = self.commands.clone();
            tokio::spawn(async move {
                if let Err(e) = commands.block_urls(patterns).await {
                    debug!(error = %e, "failed to update blocked URL list");
                }
            });
        }
    }

    fn on_response(&self, request_id: String, response: ResponseData) {
        let mut tables = self.tables.lock().unwrap();
        match tables.slots.get_mut(&request_id) {
            None => {
                warn!(
                    request_id = %request_id,
                    "response received for unknown request, dropping"
                );
            }
            Some(slot) => {
                if slot.state != RequestState::Requested {
                    warn!(
                        request_id = %request_id,
                        state = ?slot.state,
                        "unexpected response, replacing previous record"
                    );
                }
                slot.response = Some(ResponseRecord::from_data(response));
                slot.state = RequestState::Responded;
            }
        }
    }

    fn on_finished(self: &Arc<Self>, request_id: String, timestamp: f64, encoded: f64) {
        let schedule = {
            let mut tables = self.tables.lock().unwrap();
            match tables.slots.get_mut(&request_id) {
                None => {
                    debug!(request_id = %request_id, "loading finished for untracked request");
                    false
                }
                Some(slot) => {
                    slot.timing = Some(TimingRecord {
                        finished_mono: timestamp,
                        encoded_data_length: encoded,
                    });
                    slot.state = RequestState::Timed;
                    slot.response.is_some()
                }
            }
        };

        if schedule {
            self.in_flight_fetches.fetch_add(1, Ordering::SeqCst);
            let this = self.clone();
            tokio::spawn(async move {
                this.fetch_body(request_id).await;
            });
        }
    }

    fn on_failed(&self, request_id: String, error_text: String, canceled: bool) {
        let mut tables = self.tables.lock().unwrap();
        match tables.slots.get_mut(&request_id) {
            None => debug!(request_id = %request_id, "loading failed for untracked request"),
            Some(slot) => {
                debug!(
                    request_id = %request_id,
                    error = %error_text,
                    canceled,
                    "request failed"
                );
                slot.failure = Some(error_text);
                slot.state = RequestState::Failed;
                tables.stats.failed += 1;
            }
        }
    }

    /// Exactly one of these runs per finished RequestId; bounded by the pool.
    async fn fetch_body(self: Arc<Self>, request_id: String) {
        let permit = self.body_pool.clone().acquire_owned().await;
        let fetched = match permit {
            Ok(_permit) => {
                match tokio::time::timeout(
                    self.options.body_fetch_timeout,
                    self.commands.fetch_response_body(&request_id),
                )
                .await
                {
                    Ok(Ok(body)) => Some(body.bytes),
                    Ok(Err(e)) => {
                        debug!(request_id = %request_id, error = %e, "body fetch failed");
                        None
                    }
                    Err(_) => {
                        debug!(request_id = %request_id, "body fetch timed out");
                        None
                    }
                }
            }
            Err(_) => None,
        };

        let emission = {
            let mut tables = self.tables.lock().unwrap();
            if fetched.is_none() {
                tables.stats.body_fetch_failures += 1;
            }
            let anchor = tables.anchor;
            match tables.slots.get_mut(&request_id) {
                None => None,
                Some(slot) => {
                    if let Some(bytes) = fetched {
                        slot.body = Some(BodyRecord { bytes });
                    }
                    slot.state = RequestState::Complete;
                    match (self.options.streaming, anchor) {
                        (true, Some(anchor)) => Some((slot.clone(), anchor)),
                        _ => None,
                    }
                }
            }
        };

        if let Some((slot, anchor)) = emission {
            self.emit_streamed(&slot, anchor);
        }

        self.in_flight_fetches.fetch_sub(1, Ordering::SeqCst);
        self.drained.notify_waiters();
    }

    fn emit_streamed(&self, slot: &RequestSlot, anchor: NavAnchor) {
        let Some(sink) = &self.sink else {
            return;
        };
        if !self.filters.should_emit(&slot.request.url) {
            return;
        }
        let Some(entry) = build_entry(slot, anchor, None, &self.filters) else {
            return;
        };
        let projected = match self.filters.apply_projection(&entry) {
            Ok(p) => p,
            Err(e) => {
                debug!(url = %slot.request.url, error = %e, "projection failed, entry skipped");
                return;
            }
        };
        let mut sink = sink.lock().unwrap();
        let result = match projected {
            Projected::Drop => return,
            Projected::Entry(entry) => sink.emit_entry(&entry),
            Projected::Raw(bytes) => sink.emit_raw(&bytes),
        };
        if let Err(e) = result {
            debug!(error = %e, "stream emission failed");
        }
    }

    /// Waits for in-flight body fetches, up to `grace`.
    pub async fn drain(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while self.in_flight_fetches.load(Ordering::SeqCst) > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    pending = self.in_flight_fetches.load(Ordering::SeqCst),
                    "body fetches still in flight after drain grace"
                );
                break;
            }
            let _ = tokio::time::timeout(remaining, self.drained.notified()).await;
        }
    }

    /// Final assembly: archived redirect hops plus every table slot that got
    /// far enough, in request order, with the omit filter applied.
    pub fn build_entries(&self, pageref: Option<&str>) -> Vec<Entry> {
        let mut tables = self.tables.lock().unwrap();
        let anchor = tables.anchor.unwrap_or(NavAnchor {
            mono: 0.0,
            wall: tables.nav_wall,
        });

        let mut slots: Vec<RequestSlot> = tables.archived.clone();
        slots.extend(tables.slots.values().cloned());
        slots.sort_by(|a, b| {
            a.request
                .started_mono
                .total_cmp(&b.request.started_mono)
                .then_with(|| a.request.started_at.cmp(&b.request.started_at))
        });

        let mut entries = Vec::new();
        for slot in &slots {
            if !self.filters.should_emit(&slot.request.url) {
                tables.stats.omitted += 1;
                continue;
            }
            match build_entry(slot, anchor, pageref, &self.filters) {
                Some(entry) => entries.push(entry),
                None => {
                    debug!(
                        url = %slot.request.url,
                        state = ?slot.state,
                        "incomplete request skipped at assembly"
                    );
                }
            }
        }
        entries
    }

    /// Cookie metadata captured from the profile at session start, exposed
    /// for the synthetic profile_cookies page.
    pub fn profile_cookies(&self) -> Vec<ProfileCookie> {
        self.tables.lock().unwrap().profile_cookies.clone()
    }
}

fn epoch_to_utc(wall_time: f64) -> Option<DateTime<Utc>> {
    if wall_time <= 0.0 {
        return None;
    }
    let secs = wall_time.trunc() as i64;
    let nanos = (wall_time.fract() * 1_000_000_000.0) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Builds a HAR entry from one slot, or `None` when the slot never got a
/// response and timing (and did not outright fail).
fn build_entry(
    slot: &RequestSlot,
    anchor: NavAnchor,
    pageref: Option<&str>,
    filters: &Filters,
) -> Option<Entry> {
    let mut request = har::Request::new(&slot.request.method, &slot.request.url);
    request.headers = to_har_headers(&slot.request.headers);
    if let Some(raw) = header_value(&slot.request.headers, "Cookie") {
        request.cookies = parse_cookie_header(raw)
            .into_iter()
            .filter(|c| filters.cookie_matches(&c.name))
            .collect();
    }
    if let Some(text) = &slot.request.post_data {
        let mime_type = header_value(&slot.request.headers, "Content-Type")
            .unwrap_or("")
            .to_string();
        request.post_data = Some(PostData {
            mime_type,
            text: text.clone(),
        });
        request.body_size = text.len() as i64;
    }

    let (response, timings) = match (&slot.response, &slot.timing, slot.state) {
        (Some(record), Some(timing), _) => {
            request.http_version = record
                .protocol
                .clone()
                .unwrap_or_else(|| "HTTP/1.1".to_string());

            let mut response = har::Response::empty();
            response.status = record.status;
            response.status_text = record.status_text.clone();
            response.http_version = request.http_version.clone();
            response.headers = to_har_headers(&record.headers);
            response.cookies = header_values(&record.headers, "Set-Cookie")
                .into_iter()
                .filter_map(parse_set_cookie)
                .filter(|c| filters.cookie_matches(&c.name))
                .collect();
            if let Some(location) = header_value(&record.headers, "Location") {
                response.redirect_url = location.to_string();
            }

            let size = if timing.encoded_data_length > 0.0 {
                timing.encoded_data_length
            } else {
                record.encoded_data_length
            };
            let mut content = Content {
                size: size as i64,
                mime_type: record.mime_type.clone(),
                text: None,
                encoding: None,
            };
            if let Some(body) = &slot.body {
                match std::str::from_utf8(&body.bytes) {
                    Ok(text) => content.text = Some(text.to_string()),
                    Err(_) => {
                        content.text = Some(
                            base64::engine::general_purpose::STANDARD.encode(&body.bytes),
                        );
                        content.encoding = Some("base64".to_string());
                    }
                }
            }
            response.body_size = content.size;
            response.content = content;

            let wait = (timing.finished_mono - anchor.mono) * 1000.0;
            (response, Timings::wait_only(wait))
        }
        (_, _, RequestState::Failed) => {
            // Failed requests keep an empty response; the error text rides in
            // statusText so the entry still explains itself.
            let mut response = har::Response::empty();
            if let Some(failure) = &slot.failure {
                response.status_text = failure.clone();
            }
            (response, Timings::wait_only(0.0))
        }
        _ => return None,
    };

    let time = timings.total();
    Some(Entry {
        pageref: pageref.map(str::to_string),
        started_date_time: har::format_timestamp(anchor.wall),
        time,
        request,
        response,
        cache: har::Cache::default(),
        timings,
        websocket_id: None,
    })
}
