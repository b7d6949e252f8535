//! Multi-signal page stability detection.
//!
//! One scheduling loop per page: network handlers update counters and wake
//! the loop, page signals (DOM mutations, resources, custom checks) are
//! polled. Stability is declared only after a full re-observation succeeds,
//! and latches until the next navigation.

pub mod scripts;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::cdp::PageCommands;
use crate::config::{CustomCheck, StabilityConfig};
use crate::timeouts::{limits, ms};
use crate::{HarError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CheckStatus {
    Pending,
    Passed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Live counters, updated by event handlers and polls.
#[derive(Debug)]
struct Metrics {
    in_flight: usize,
    completed: u64,
    /// Set while in-flight count sits at or below the idle threshold.
    idle_since: Option<Instant>,
    last_network_change: Option<Instant>,
    dom_counter: u64,
    dom_observed: bool,
    last_dom_change: Instant,
    pending_resources: Vec<String>,
    checks: BTreeMap<String, CheckOutcome>,
}

/// Snapshot surfaced when the detector gives up. This is the primary
/// output on failure: it names every unsatisfied signal with its last
/// observed metric.
#[derive(Debug, Clone, Serialize)]
pub struct StabilityDiagnostics {
    pub unsatisfied: Vec<String>,
    pub in_flight_requests: usize,
    pub completed_requests: u64,
    pub ms_since_last_network_change: Option<u64>,
    pub ms_since_last_dom_change: Option<u64>,
    pub pending_resources: Vec<String>,
    pub custom_checks: BTreeMap<String, CheckOutcome>,
}

impl fmt::Display for StabilityDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unsatisfied signals [{}], {} request(s) in flight, {} pending resource(s)",
            self.unsatisfied.join(", "),
            self.in_flight_requests,
            self.pending_resources.len()
        )
    }
}

pub struct StabilityDetector {
    config: StabilityConfig,
    metrics: Mutex<Metrics>,
    changed: Notify,
    latched: AtomicBool,
    check_slots: Arc<Semaphore>,
}

impl StabilityDetector {
    pub fn new(config: StabilityConfig) -> Arc<Self> {
        let now = Instant::now();
        let mut checks = BTreeMap::new();
        for check in &config.custom_checks {
            checks.insert(
                check.name.clone(),
                CheckOutcome {
                    status: CheckStatus::Pending,
                    elapsed_ms: 0,
                    error: None,
                },
            );
        }
        Arc::new(Self {
            config,
            metrics: Mutex::new(Metrics {
                in_flight: 0,
                completed: 0,
                idle_since: Some(now),
                last_network_change: None,
                dom_counter: 0,
                dom_observed: false,
                last_dom_change: now,
                pending_resources: Vec::new(),
                checks,
            }),
            changed: Notify::new(),
            latched: AtomicBool::new(false),
            check_slots: Arc::new(Semaphore::new(limits::CUSTOM_CHECK_EVALS)),
        })
    }

    pub fn config(&self) -> &StabilityConfig {
        &self.config
    }

    /// Installs the DOM mutation watcher; call once at session start.
    pub async fn install(&self, page: &dyn PageCommands) -> Result<()> {
        page.install_on_new_document(scripts::MUTATION_WATCHER).await
    }

    /// Resets latched state and counters for a fresh navigation.
    pub fn reset(&self) {
        self.latched.store(false, Ordering::SeqCst);
        let mut metrics = self.metrics.lock().unwrap();
        let now = Instant::now();
        metrics.idle_since = (metrics.in_flight <= self.config.network_idle_inflight_threshold)
            .then_some(now);
        metrics.dom_observed = false;
        metrics.last_dom_change = now;
        metrics.pending_resources.clear();
        for outcome in metrics.checks.values_mut() {
            outcome.status = CheckStatus::Pending;
            outcome.elapsed_ms = 0;
            outcome.error = None;
        }
        drop(metrics);
        self.changed.notify_waiters();
    }

    pub fn on_request_started(&self) {
        let mut metrics = self.metrics.lock().unwrap();
        metrics.in_flight += 1;
        metrics.last_network_change = Some(Instant::now());
        if metrics.in_flight > self.config.network_idle_inflight_threshold {
            metrics.idle_since = None;
        }
        drop(metrics);
        self.changed.notify_waiters();
    }

    pub fn on_request_finished(&self) {
        let mut metrics = self.metrics.lock().unwrap();
        metrics.in_flight = metrics.in_flight.saturating_sub(1);
        metrics.completed += 1;
        metrics.last_network_change = Some(Instant::now());
        if metrics.in_flight <= self.config.network_idle_inflight_threshold
            && metrics.idle_since.is_none()
        {
            metrics.idle_since = Some(Instant::now());
        }
        drop(metrics);
        self.changed.notify_waiters();
    }

    pub fn in_flight(&self) -> usize {
        self.metrics.lock().unwrap().in_flight
    }

    fn network_signal_enabled(&self) -> bool {
        self.config.network_idle_duration > Duration::ZERO
    }

    fn dom_signal_enabled(&self) -> bool {
        self.config.dom_stable_duration > Duration::ZERO
    }

    fn resources_signal_enabled(&self) -> bool {
        self.config.wait_for_images
            || self.config.wait_for_fonts
            || self.config.wait_for_stylesheets
            || self.config.wait_for_scripts
    }

    /// Waits for every enabled signal to hold simultaneously, re-observing
    /// once before declaring. Latches on success.
    pub async fn wait_until_stable(&self, page: &dyn PageCommands) -> Result<()> {
        if self.latched.load(Ordering::SeqCst) {
            return Ok(());
        }

        let started = Instant::now();
        let deadline = started + self.config.max_total_wait;

        loop {
            if Instant::now() >= deadline {
                let diagnostics = self.diagnostics();
                debug!(?diagnostics, "stability wait exhausted");
                return Err(HarError::StabilityTimeout(diagnostics));
            }

            if self.observe(page, started).await? {
                // Re-observe atomically before declaring: a burst between
                // wakes must not slip through.
                if self.observe(page, started).await? {
                    self.latched.store(true, Ordering::SeqCst);
                    if self.config.verbose {
                        debug!(
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "page declared stable"
                        );
                    }
                    return Ok(());
                }
                trace!("re-observation failed, continuing");
                continue;
            }

            let tick = Duration::from_millis(ms::POLL_INTERVAL)
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = self.changed.notified() => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    /// One observation: poll page-side signals, then judge all enabled
    /// signals against a single metrics snapshot.
    async fn observe(&self, page: &dyn PageCommands, started: Instant) -> Result<bool> {
        if self.dom_signal_enabled() {
            self.poll_dom(page).await;
        }
        if self.resources_signal_enabled() {
            self.poll_resources(page).await;
        }
        if !self.config.custom_checks.is_empty() {
            self.poll_custom_checks(page, started).await;
        }

        let metrics = self.metrics.lock().unwrap();

        if self.network_signal_enabled() {
            let idle_for = metrics.idle_since.map(|t| t.elapsed());
            match idle_for {
                Some(idle) if idle >= self.config.network_idle_duration => {}
                _ => return Ok(false),
            }
        }
        if self.dom_signal_enabled() {
            if !metrics.dom_observed {
                return Ok(false);
            }
            if metrics.last_dom_change.elapsed() < self.config.dom_stable_duration {
                return Ok(false);
            }
        }
        if self.resources_signal_enabled() && !metrics.pending_resources.is_empty() {
            return Ok(false);
        }
        if metrics
            .checks
            .values()
            .any(|outcome| outcome.status != CheckStatus::Passed)
        {
            return Ok(false);
        }

        Ok(true)
    }

    async fn poll_dom(&self, page: &dyn PageCommands) {
        let counter = match page.evaluate(scripts::MUTATION_COUNTER).await {
            Ok(value) => value.as_u64().unwrap_or(0),
            Err(e) => {
                trace!(error = %e, "mutation counter poll failed");
                return;
            }
        };

        let mut metrics = self.metrics.lock().unwrap();
        // The page clock is untrusted: change timing comes from our own
        // samples of the counter.
        if !metrics.dom_observed || counter != metrics.dom_counter {
            metrics.dom_counter = counter;
            metrics.last_dom_change = Instant::now();
            metrics.dom_observed = true;
        }
    }

    async fn poll_resources(&self, page: &dyn PageCommands) {
        let script = scripts::resources_pending(&self.config);
        let pending = match page.evaluate(&script).await {
            Ok(serde_json::Value::String(json)) => {
                serde_json::from_str::<Vec<String>>(&json).unwrap_or_default()
            }
            Ok(_) => Vec::new(),
            Err(e) => {
                trace!(error = %e, "resource poll failed");
                return;
            }
        };
        self.metrics.lock().unwrap().pending_resources = pending;
    }

    async fn poll_custom_checks(&self, page: &dyn PageCommands, started: Instant) {
        let unresolved: Vec<CustomCheck> = {
            let metrics = self.metrics.lock().unwrap();
            self.config
                .custom_checks
                .iter()
                .filter(|check| {
                    metrics
                        .checks
                        .get(&check.name)
                        .map(|o| o.status == CheckStatus::Pending)
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };

        let evaluations = unresolved.into_iter().map(|check| {
            let slots = self.check_slots.clone();
            async move {
                let _permit = slots.acquire_owned().await;
                let result = page.evaluate(&check.expression).await;
                (check, result)
            }
        });
        let results = futures::future::join_all(evaluations).await;

        let mut metrics = self.metrics.lock().unwrap();
        for (check, result) in results {
            let Some(outcome) = metrics.checks.get_mut(&check.name) else {
                continue;
            };
            outcome.elapsed_ms = started.elapsed().as_millis() as u64;
            match result {
                Ok(value) if truthy(&value) => {
                    outcome.status = CheckStatus::Passed;
                }
                Ok(_) => {
                    // Still pending unless its own deadline ran out.
                    if started.elapsed() >= check.timeout {
                        outcome.status = CheckStatus::Failed;
                        outcome.error = Some("check never became truthy".to_string());
                    }
                }
                Err(e) => {
                    outcome.status = CheckStatus::Failed;
                    outcome.error = Some(e.to_string());
                }
            }
        }
    }

    /// Network-only wait used for `waitUntil = networkIdle`: no latching, no
    /// page polling, just the in-flight counter.
    pub async fn wait_for_network_idle(&self, idle: Duration, max_wait: Duration) -> Result<()> {
        let deadline = Instant::now() + max_wait;
        loop {
            {
                let metrics = self.metrics.lock().unwrap();
                let idle_ok = metrics
                    .idle_since
                    .map(|t| t.elapsed() >= idle)
                    .unwrap_or(false);
                if idle_ok {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(HarError::StabilityTimeout(self.diagnostics()));
            }
            let tick = Duration::from_millis(ms::POLL_INTERVAL)
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = self.changed.notified() => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    pub fn diagnostics(&self) -> StabilityDiagnostics {
        let metrics = self.metrics.lock().unwrap();
        let mut unsatisfied = Vec::new();

        if self.network_signal_enabled() {
            let idle_ok = metrics
                .idle_since
                .map(|t| t.elapsed() >= self.config.network_idle_duration)
                .unwrap_or(false);
            if !idle_ok {
                unsatisfied.push("networkIdle".to_string());
            }
        }
        if self.dom_signal_enabled()
            && (!metrics.dom_observed
                || metrics.last_dom_change.elapsed() < self.config.dom_stable_duration)
        {
            unsatisfied.push("domStable".to_string());
        }
        if self.resources_signal_enabled() && !metrics.pending_resources.is_empty() {
            unsatisfied.push("resourcesLoaded".to_string());
        }
        for (name, outcome) in &metrics.checks {
            if outcome.status != CheckStatus::Passed {
                unsatisfied.push(format!("custom:{name}"));
            }
        }

        StabilityDiagnostics {
            unsatisfied,
            in_flight_requests: metrics.in_flight,
            completed_requests: metrics.completed,
            ms_since_last_network_change: metrics
                .last_network_change
                .map(|t| t.elapsed().as_millis() as u64),
            ms_since_last_dom_change: metrics
                .dom_observed
                .then(|| metrics.last_dom_change.elapsed().as_millis() as u64),
            pending_resources: metrics.pending_resources.clone(),
            custom_checks: metrics.checks.clone(),
        }
    }
}

fn truthy(value: &serde_json::Value) -> bool {
    !matches!(value, serde_json::Value::Null | serde_json::Value::Bool(false))
}
