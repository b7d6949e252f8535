use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::timeouts::{limits, ms, secs};
use crate::{HarError, Result};

/// Options for one recording session.
#[derive(Debug, Clone)]
pub struct RecorderOptions {
    /// Emit entries as they complete instead of only at stop time.
    pub streaming: bool,
    /// Record WebSocket traffic and emit the `_websockets` extension.
    pub websockets: bool,
    /// Concurrent out-of-band response body fetches.
    pub body_fetch_workers: usize,
    /// Per-fetch deadline for the response body command.
    pub body_fetch_timeout: Duration,
    /// How long `stop()` waits for in-flight body fetches.
    pub drain_grace: Duration,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            streaming: false,
            websockets: false,
            body_fetch_workers: limits::BODY_FETCH_WORKERS,
            body_fetch_timeout: Duration::from_secs(secs::BODY_FETCH),
            drain_grace: Duration::from_secs(secs::DRAIN_GRACE),
        }
    }
}

/// A page-evaluated predicate the stability detector runs until it passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomCheck {
    pub name: String,
    pub expression: String,
    #[serde(default = "default_check_timeout")]
    pub timeout: Duration,
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(secs::CUSTOM_CHECK)
}

/// Which signals gate the "page is stable" decision, and their thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityConfig {
    /// In-flight requests at or below this count to be considered idle.
    pub network_idle_inflight_threshold: usize,
    /// How long the network must stay idle.
    pub network_idle_duration: Duration,
    /// How long the DOM must go without a mutation.
    pub dom_stable_duration: Duration,
    pub wait_for_images: bool,
    pub wait_for_fonts: bool,
    pub wait_for_stylesheets: bool,
    pub wait_for_scripts: bool,
    /// Overall wait before the detector gives up with diagnostics.
    pub max_total_wait: Duration,
    pub custom_checks: Vec<CustomCheck>,
    pub verbose: bool,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            network_idle_inflight_threshold: 0,
            network_idle_duration: Duration::from_millis(ms::NETWORK_IDLE),
            dom_stable_duration: Duration::from_millis(ms::DOM_STABLE),
            wait_for_images: true,
            wait_for_fonts: true,
            wait_for_stylesheets: true,
            wait_for_scripts: false,
            max_total_wait: Duration::from_secs(secs::STABILITY_MAX),
            custom_checks: Vec::new(),
            verbose: false,
        }
    }
}

impl StabilityConfig {
    pub fn network_only(idle: Duration, max_total_wait: Duration) -> Self {
        Self {
            network_idle_duration: idle,
            dom_stable_duration: Duration::ZERO,
            wait_for_images: false,
            wait_for_fonts: false,
            wait_for_stylesheets: false,
            wait_for_scripts: false,
            max_total_wait,
            ..Self::default()
        }
    }
}

/// Environment-provided settings shared by both binaries.
#[derive(Debug, Clone, Default)]
pub struct EnvSettings {
    pub chrome_path: Option<PathBuf>,
    pub headless: Option<bool>,
    pub debug: bool,
    pub timeout: Option<Duration>,
}

impl EnvSettings {
    /// Reads CHROME_PATH, HEADLESS, DEBUG and TIMEOUT. Malformed values are
    /// rejected rather than defaulted.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Ok(path) = std::env::var("CHROME_PATH") {
            if path.is_empty() {
                return Err(HarError::config("CHROME_PATH", "must not be empty"));
            }
            settings.chrome_path = Some(PathBuf::from(path));
        }
        if let Ok(raw) = std::env::var("HEADLESS") {
            settings.headless = Some(parse_bool("HEADLESS", &raw)?);
        }
        if let Ok(raw) = std::env::var("DEBUG") {
            settings.debug = parse_bool("DEBUG", &raw)?;
        }
        if let Ok(raw) = std::env::var("TIMEOUT") {
            settings.timeout = Some(parse_duration("TIMEOUT", &raw)?);
        }

        Ok(settings)
    }
}

fn parse_bool(option: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(HarError::config(
            option,
            format!("expected a boolean, got '{other}'"),
        )),
    }
}

/// Accepts `30`, `30s`, `500ms` or `2m`.
pub fn parse_duration(option: &str, raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| HarError::config(option, format!("invalid duration '{raw}'")))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        other => Err(HarError::config(
            option,
            format!("unknown duration unit '{other}'"),
        )),
    }
}
